/// Tuning knobs for the heap manager.
///
/// All values here are contention/hot-page heuristics, not correctness
/// parameters; defaults follow the shipped server configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Fraction of a page kept unfilled by inserts so in-place updates
    /// have room to grow.
    pub unfill_factor: f32,
    /// Maximum number of entries across the process-wide best-space cache.
    /// When full, insertion either evicts a worse entry or is rejected and
    /// search degrades to header hints only.
    pub bestspace_capacity: usize,
    /// Number of rejected candidates a best-space `find` tolerates before
    /// giving up on the hash cache.
    pub find_probe_limit: usize,
    /// Fraction of the heap's page count a best-space sync scan may visit.
    pub sync_scan_ratio: f32,
    /// Hard cap on pages visited by a single best-space sync scan.
    pub sync_scan_cap: usize,
    /// Only every Nth displacement from the header best ring is pushed to
    /// the second-best ring, to inject variety and avoid hot-page thrash.
    pub second_best_sample_rate: u32,
    /// Free space below this many bytes is not worth caching.
    pub min_cached_freespace: usize,
    /// Decoded class representations kept resident.
    pub classrepr_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            unfill_factor: 0.10,
            bestspace_capacity: 1024,
            find_probe_limit: 100,
            sync_scan_ratio: 0.20,
            sync_scan_cap: 32,
            second_best_sample_rate: 4,
            min_cached_freespace: 64,
            classrepr_capacity: 64,
        }
    }
}

impl HeapConfig {
    /// Bytes of a page inserts will leave unfilled.
    pub fn unfill_space(&self, page_capacity: usize) -> usize {
        (page_capacity as f32 * self.unfill_factor) as usize
    }

    /// Upper bound on pages visited by one sync scan over a heap with
    /// `num_pages` pages.
    pub fn sync_scan_bound(&self, num_pages: usize) -> usize {
        let ratio_bound = (num_pages as f32 * self.sync_scan_ratio).ceil() as usize;
        ratio_bound.min(self.sync_scan_cap).max(1)
    }
}
