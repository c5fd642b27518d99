//! End-to-end heap workloads: placement transitions, MVCC visibility,
//! scans, reclamation, and recovery replay.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hearthdb::classrepr::{ClassRepr, ClassReprLoader, ReprAttribute};
use hearthdb::config::HeapConfig;
use hearthdb::error::{Result, ScanCode};
use hearthdb::heap::{FetchMode, HeapManager};
use hearthdb::log::RecoveryLog;
use hearthdb::mvcc::{HorizonSnapshot, MvccRecHeader, Snapshot};
use hearthdb::page::{LatchWait, PageBuffer};
use hearthdb::slotted::{RecordKind, SlottedPage};
use hearthdb::types::{ClassId, Hfid, Oid};

struct FixedLoader;

impl ClassReprLoader for FixedLoader {
    fn load(&self, class_id: ClassId) -> Result<Vec<Arc<ClassRepr>>> {
        Ok(vec![Arc::new(ClassRepr {
            class_id,
            repr_id: 1,
            attributes: vec![
                ReprAttribute { id: 1, name: "id".into(), fixed_len: Some(8) },
                ReprAttribute { id: 2, name: "data".into(), fixed_len: None },
            ],
        })])
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager() -> HeapManager {
    init_logging();
    HeapManager::new(
        Arc::new(PageBuffer::new()),
        Arc::new(RecoveryLog::new()),
        HeapConfig::default(),
        Arc::new(FixedLoader),
    )
}

fn class() -> ClassId {
    ClassId::new(0, 1, 0)
}

fn snapshot(horizon: u64) -> Arc<dyn Snapshot> {
    Arc::new(HorizonSnapshot::new(horizon))
}

fn payload_of(record: &[u8]) -> Vec<u8> {
    MvccRecHeader::parse(record).unwrap().1.to_vec()
}

fn fetch_payload(mgr: &HeapManager, oid: Oid, mode: FetchMode) -> Option<Vec<u8>> {
    let (code, bytes) = mgr.get(oid, mode, None).unwrap();
    match code {
        ScanCode::Found => Some(payload_of(&bytes.unwrap())),
        _ => None,
    }
}

/// Insert `filler`-sized records until one lands on a second page, and
/// return everything inserted. Leaves the first data page too full to
/// absorb a large in-place growth.
fn fill_first_page(mgr: &HeapManager, hfid: Hfid, filler: usize) -> Vec<Oid> {
    let body = vec![0x44u8; filler];
    let first = mgr.insert(hfid, class(), 1, None, &body).unwrap();
    let mut oids = vec![first];
    loop {
        let oid = mgr.insert(hfid, class(), 1, None, &body).unwrap();
        oids.push(oid);
        if oid.vpid() != first.vpid() {
            return oids;
        }
    }
}

#[test]
fn test_insert_get_roundtrip_many() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let records: Vec<(Oid, Vec<u8>)> = (0..50)
        .map(|i| {
            let body = format!("row number {i}").into_bytes();
            let oid = mgr.insert(hfid, class(), 1, None, &body).unwrap();
            (oid, body)
        })
        .collect();

    for (oid, body) in &records {
        assert_eq!(fetch_payload(&mgr, *oid, FetchMode::Plain).as_ref(), Some(body));
    }
    assert_eq!(mgr.count_all(hfid).unwrap(), 50);
    assert_eq!(mgr.estimate(hfid).unwrap().num_recs, 50);
}

#[test]
fn test_oid_survives_relocation_and_collapse() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let target = mgr.insert(hfid, class(), 1, None, b"starts small").unwrap();
    // Pack the target's page so a large growth cannot stay in place.
    fill_first_page(&mgr, hfid, 1000);

    let grown = vec![0x5Au8; 3500];
    let (code, updated) = mgr.update(hfid, class(), 1, None, target, &grown).unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_eq!(updated, target, "physical update never changes the OID");
    assert_eq!(fetch_payload(&mgr, target, FetchMode::Plain), Some(grown));

    // Shrink back below the home page's free space: collapses inline.
    let (code, _) = mgr.update(hfid, class(), 1, None, target, b"small again").unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_eq!(
        fetch_payload(&mgr, target, FetchMode::Plain).as_deref(),
        Some(b"small again".as_slice())
    );
}

#[test]
fn test_big_record_transitions() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let cap = hearthdb::heap::page_capacity();

    // Far past one page: straight to an overflow chain.
    let big: Vec<u8> = (0..3 * cap).map(|i| (i % 251) as u8).collect();
    let oid = mgr.insert(hfid, class(), 1, None, &big).unwrap();
    assert_eq!(fetch_payload(&mgr, oid, FetchMode::Plain), Some(big));

    // Still big after the update: the chain is rewritten in place.
    let bigger: Vec<u8> = (0..4 * cap).map(|i| (i % 127) as u8).collect();
    let (code, updated) = mgr.update(hfid, class(), 1, None, oid, &bigger).unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_eq!(updated, oid);
    assert_eq!(fetch_payload(&mgr, oid, FetchMode::Plain), Some(bigger));

    // Shrunk to ordinary size: back inline, chain gone.
    let (code, _) = mgr.update(hfid, class(), 1, None, oid, b"deflated").unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_eq!(
        fetch_payload(&mgr, oid, FetchMode::Plain).as_deref(),
        Some(b"deflated".as_slice())
    );
    assert_eq!(mgr.count_all(hfid).unwrap(), 1);
}

#[test]
fn test_mvcc_update_builds_version_chain() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let v1 = mgr.insert(hfid, class(), 1, Some(5), b"version one").unwrap();
    let (code, v2) = mgr.update(hfid, class(), 1, Some(10), v1, b"version two").unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_ne!(v2, v1, "a versioned update creates a new OID");

    // A snapshot from before the update still reads version one at either
    // OID: directly at the old site, and through the previous-version
    // chain from the new head.
    let old_snap = snapshot(7);
    assert_eq!(
        fetch_payload(&mgr, v1, FetchMode::Visible(Arc::clone(&old_snap))).as_deref(),
        Some(b"version one".as_slice())
    );
    assert_eq!(
        fetch_payload(&mgr, v2, FetchMode::Visible(old_snap)).as_deref(),
        Some(b"version one".as_slice())
    );

    // A snapshot from after the update sees only version two.
    let new_snap = snapshot(12);
    let (code, _) = mgr.get(v1, FetchMode::Visible(Arc::clone(&new_snap)), None).unwrap();
    assert_eq!(code, ScanCode::Invisible);
    assert_eq!(
        fetch_payload(&mgr, v2, FetchMode::Visible(new_snap)).as_deref(),
        Some(b"version two".as_slice())
    );
}

#[test]
fn test_mvcc_delete_stamps_without_removing() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let oid = mgr.insert(hfid, class(), 1, Some(5), b"doomed row").unwrap();
    let code = mgr.delete(hfid, class(), Some(10), oid).unwrap();
    assert_eq!(code, ScanCode::Found);

    // The body stays for older snapshots and vacuum.
    assert!(mgr.does_exist(oid).unwrap());
    assert_eq!(
        fetch_payload(&mgr, oid, FetchMode::Visible(snapshot(7))).as_deref(),
        Some(b"doomed row".as_slice())
    );
    let (code, _) = mgr.get(oid, FetchMode::Visible(snapshot(12)), None).unwrap();
    assert_eq!(code, ScanCode::Invisible);
    let (code, _) = mgr.get(oid, FetchMode::LastVersion, None).unwrap();
    assert_eq!(code, ScanCode::DoesNotExist);
}

#[test]
fn test_mvcc_delete_of_overflow_record() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let cap = hearthdb::heap::page_capacity();

    let big: Vec<u8> = (0..2 * cap).map(|i| (i % 199) as u8).collect();
    let oid = mgr.insert(hfid, class(), 1, Some(5), &big).unwrap();
    let code = mgr.delete(hfid, class(), Some(10), oid).unwrap();
    assert_eq!(code, ScanCode::Found);

    assert_eq!(fetch_payload(&mgr, oid, FetchMode::Visible(snapshot(7))), Some(big));
    let (code, _) = mgr.get(oid, FetchMode::Visible(snapshot(12)), None).unwrap();
    assert_eq!(code, ScanCode::Invisible);
}

#[test]
fn test_physical_delete_and_reclaim() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let keep = mgr.insert(hfid, class(), 1, None, b"keeper").unwrap();
    let gone = mgr.insert(hfid, class(), 1, None, b"goner").unwrap();
    assert_eq!(mgr.delete(hfid, class(), None, gone).unwrap(), ScanCode::Found);

    let (code, _) = mgr.get(gone, FetchMode::Plain, None).unwrap();
    assert_eq!(code, ScanCode::DoesNotExist);
    assert!(!mgr.does_exist(gone).unwrap());
    assert_eq!(mgr.count_all(hfid).unwrap(), 1);

    // Deleting the same OID again is a domain outcome, not an error.
    assert_eq!(mgr.delete(hfid, class(), None, gone).unwrap(), ScanCode::DoesNotExist);

    assert_eq!(mgr.reclaim_addresses(hfid).unwrap(), 1);
    assert_eq!(fetch_payload(&mgr, keep, FetchMode::Plain).as_deref(), Some(b"keeper".as_slice()));
}

#[test]
fn test_cache_coherency_number_short_circuit() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let oid = mgr.insert(hfid, class(), 1, None, b"cached client copy").unwrap();
    let (_, bytes) = mgr.get(oid, FetchMode::Plain, None).unwrap();
    let chn = MvccRecHeader::parse(&bytes.unwrap()).unwrap().0.chn;

    let (code, bytes) = mgr.get(oid, FetchMode::Plain, Some(chn)).unwrap();
    assert_eq!(code, ScanCode::Unchanged);
    assert!(bytes.is_none(), "unchanged records come back without a body");

    mgr.update(hfid, class(), 1, None, oid, b"changed").unwrap();
    let (code, bytes) = mgr.get(oid, FetchMode::Plain, Some(chn)).unwrap();
    assert_eq!(code, ScanCode::Found);
    assert_eq!(payload_of(&bytes.unwrap()), b"changed");
}

#[test]
fn test_scan_walks_every_record_once() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let inserted = fill_first_page(&mgr, hfid, 1000);
    assert!(inserted.len() >= 3, "expected the filler to span two pages");

    let mut sc = mgr.scan_start(hfid, class(), None);
    let mut seen = Vec::new();
    let mut cursor = Oid::NULL;
    while let Some((oid, _)) = sc.next(cursor).unwrap() {
        seen.push(oid);
        cursor = oid;
    }
    assert_eq!(seen, inserted, "forward scan follows page then slot order");

    let mut reversed = Vec::new();
    let mut cursor = Oid::NULL;
    while let Some((oid, _)) = sc.prev(cursor).unwrap() {
        reversed.push(oid);
        cursor = oid;
    }
    reversed.reverse();
    assert_eq!(reversed, seen);
    sc.end();

    // Deleted records disappear from the walk.
    let victim = inserted[1];
    mgr.delete(hfid, class(), None, victim).unwrap();
    let mut sc = mgr.scan_start(hfid, class(), None);
    let mut cursor = Oid::NULL;
    while let Some((oid, _)) = sc.next(cursor).unwrap() {
        assert_ne!(oid, victim);
        cursor = oid;
    }
    sc.end();
}

#[test]
fn test_scan_with_snapshot_resolves_versions() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    mgr.insert(hfid, class(), 1, Some(5), b"stable").unwrap();
    let updated = mgr.insert(hfid, class(), 1, Some(5), b"old body").unwrap();
    mgr.update(hfid, class(), 1, Some(10), updated, b"new body").unwrap();

    // The pre-update snapshot sees the superseded version instead of the
    // stamped head, via the version chain.
    let mut sc = mgr.scan_start(hfid, class(), Some(snapshot(7)));
    let mut bodies = Vec::new();
    let mut cursor = Oid::NULL;
    while let Some((oid, record)) = sc.next(cursor).unwrap() {
        bodies.push(payload_of(&record));
        cursor = oid;
    }
    sc.end();
    assert!(bodies.contains(&b"stable".to_vec()));
    assert!(bodies.contains(&b"old body".to_vec()));
    assert!(!bodies.contains(&b"new body".to_vec()));
}

#[test]
fn test_scanrange_covers_one_page_extent() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let inserted = fill_first_page(&mgr, hfid, 1000);

    let first_page: Vec<Oid> = inserted
        .iter()
        .copied()
        .filter(|oid| oid.vpid() == inserted[0].vpid())
        .collect();

    let mut sc = mgr.scan_start(hfid, class(), None);
    let range = sc.scanrange_to_following(Oid::NULL).unwrap().unwrap();
    assert_eq!(range.first, first_page[0]);
    assert_eq!(range.last, *first_page.last().unwrap());

    let mut walked = Vec::new();
    let mut cursor = Oid::NULL;
    while let Some((oid, _)) = sc.range_next(&range, cursor).unwrap() {
        walked.push(oid);
        cursor = oid;
    }
    assert_eq!(walked, first_page);

    // The prior-direction range lands on the last page's extent.
    let tail_range = sc.scanrange_to_prior(Oid::NULL).unwrap().unwrap();
    assert_eq!(tail_range.last, *inserted.last().unwrap());
    let (oid, _) = sc.range_prev(&tail_range, Oid::NULL).unwrap().unwrap();
    assert_eq!(oid, tail_range.last);
    sc.end();
}

#[test]
fn test_freed_space_is_found_again() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let inserted = fill_first_page(&mgr, hfid, 1000);
    let pages_before = mgr.estimate(hfid).unwrap().num_pages;

    // Free two records' worth, then insert three of the same size: the
    // heap must absorb them in existing pages instead of growing.
    mgr.delete(hfid, class(), None, inserted[0]).unwrap();
    mgr.delete(hfid, class(), None, inserted[1]).unwrap();
    for _ in 0..3 {
        mgr.insert(hfid, class(), 1, None, &vec![0x77u8; 1000]).unwrap();
    }
    assert_eq!(mgr.estimate(hfid).unwrap().num_pages, pages_before);
}

#[test]
fn test_replay_rebuilds_pages_and_is_idempotent() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let cap = hearthdb::heap::page_capacity();

    let small = mgr.insert(hfid, class(), 1, None, b"plain row").unwrap();
    let big_body: Vec<u8> = (0..2 * cap).map(|i| (i % 241) as u8).collect();
    let big = mgr.insert(hfid, class(), 1, None, &big_body).unwrap();
    let versioned = mgr.insert(hfid, class(), 1, Some(5), b"first version").unwrap();
    let (_, new_version) =
        mgr.update(hfid, class(), 1, Some(10), versioned, b"second version").unwrap();
    mgr.update(hfid, class(), 1, None, small, b"plain row, edited").unwrap();
    let doomed = mgr.insert(hfid, class(), 1, None, b"dropped before the crash").unwrap();
    mgr.delete(hfid, class(), None, doomed).unwrap();

    let expected_count = mgr.count_all(hfid).unwrap();

    let verify = |other: &HeapManager| {
        assert_eq!(
            fetch_payload(other, small, FetchMode::Plain).as_deref(),
            Some(b"plain row, edited".as_slice())
        );
        assert_eq!(fetch_payload(other, big, FetchMode::Plain).as_ref(), Some(&big_body));
        assert_eq!(
            fetch_payload(other, new_version, FetchMode::Plain).as_deref(),
            Some(b"second version".as_slice())
        );
        let (code, _) = other.get(doomed, FetchMode::Plain, None).unwrap();
        assert_eq!(code, ScanCode::DoesNotExist);
        assert_eq!(other.count_all(hfid).unwrap(), expected_count);
    };

    // Cold buffer brought up from the log alone.
    let recovered = HeapManager::new(
        Arc::new(PageBuffer::new()),
        Arc::clone(mgr.log()),
        HeapConfig::default(),
        Arc::new(FixedLoader),
    );
    recovered.replay_log().unwrap();
    verify(&recovered);

    // Replaying over an already-recovered buffer changes nothing.
    recovered.replay_log().unwrap();
    verify(&recovered);
}

#[test]
fn test_update_does_not_hold_home_while_reading_header() {
    let mgr = Arc::new(manager());
    let hfid = mgr.create_heap(0, class()).unwrap();
    let oid = mgr.insert(hfid, class(), 1, None, b"about to balloon").unwrap();
    let cap = hearthdb::heap::page_capacity();

    // Pin the header page. A Home -> BigOne update needs the overflow
    // volume from it and must wait here without sitting on its home page.
    let header_guard = mgr.buffer().fix_write_blocking(hfid.header_vpid()).unwrap();

    let worker = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let big: Vec<u8> = (0..2 * cap).map(|i| (i % 97) as u8).collect();
            let (code, _) = mgr.update(hfid, class(), 1, None, oid, &big).unwrap();
            code
        })
    };

    thread::sleep(Duration::from_millis(200));
    let home_probe = mgr.buffer().fix_write(oid.vpid(), LatchWait::NonBlocking).unwrap();
    assert!(
        home_probe.is_some(),
        "updater held its home page while blocked on the header"
    );
    drop(home_probe);

    drop(header_guard);
    assert_eq!(worker.join().unwrap(), ScanCode::Found);
    assert_eq!(fetch_payload(&mgr, oid, FetchMode::Plain).map(|p| p.len()), Some(2 * cap));
}

#[test]
fn test_replay_does_not_resurrect_destroyed_heap() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let cap = hearthdb::heap::page_capacity();

    let oid = mgr.insert(hfid, class(), 1, None, b"short lived").unwrap();
    let big: Vec<u8> = (0..2 * cap).map(|i| (i % 233) as u8).collect();
    mgr.insert(hfid, class(), 1, None, &big).unwrap();
    mgr.destroy_heap(hfid).unwrap();

    let recovered = HeapManager::new(
        Arc::new(PageBuffer::new()),
        Arc::clone(mgr.log()),
        HeapConfig::default(),
        Arc::new(FixedLoader),
    );
    recovered.replay_log().unwrap();

    assert_eq!(
        recovered.buffer().page_count(0),
        0,
        "replay rebuilt pages of a destroyed heap"
    );
    let (code, _) = recovered.get(oid, FetchMode::Plain, None).unwrap();
    assert_eq!(code, ScanCode::DoesNotExist);
}

#[test]
fn test_mvcc_delete_stamp_relocates_when_home_page_is_full() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let target = mgr.insert(hfid, class(), 1, Some(5), b"stamp victim body").unwrap();
    let filler = mgr.insert(hfid, class(), 1, None, &[7u8; 64]).unwrap();
    assert_eq!(filler.vpid(), target.vpid());

    // Grow the filler in place by exactly the page's remaining slack, so
    // the delete stamp cannot widen the victim's header where it sits.
    let slack = {
        let guard = mgr.buffer().fix_read(target.vpid()).unwrap();
        SlottedPage::new(guard.data().as_slice()).total_free_space()
    };
    let (code, _) = mgr.update(hfid, class(), 1, None, filler, &vec![7u8; 64 + slack]).unwrap();
    assert_eq!(code, ScanCode::Found);

    assert_eq!(mgr.delete(hfid, class(), Some(10), target).unwrap(), ScanCode::Found);

    // The home slot degraded to a forward; visibility is unaffected.
    {
        let guard = mgr.buffer().fix_read(target.vpid()).unwrap();
        let page = SlottedPage::new(guard.data().as_slice());
        assert_eq!(page.kind(target.slotid), Some(RecordKind::Relocation));
    }
    assert_eq!(
        fetch_payload(&mgr, target, FetchMode::Visible(snapshot(7))).as_deref(),
        Some(b"stamp victim body".as_slice())
    );
    let (code, _) = mgr.get(target, FetchMode::Visible(snapshot(12)), None).unwrap();
    assert_eq!(code, ScanCode::Invisible);
}

#[test]
fn test_count_all_recollects_free_space() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();
    let inserted = fill_first_page(&mgr, hfid, 1000);

    // A cold manager recovered from the log starts with an empty
    // best-space cache; the counting walk refills it.
    let recovered = HeapManager::new(
        Arc::new(PageBuffer::new()),
        Arc::clone(mgr.log()),
        HeapConfig::default(),
        Arc::new(FixedLoader),
    );
    recovered.replay_log().unwrap();
    assert_eq!(recovered.bestspace_stats().entries, 0);

    assert_eq!(recovered.count_all(hfid).unwrap() as usize, inserted.len());
    assert!(
        recovered.bestspace_stats().entries >= 1,
        "counting walk should repopulate the best-space cache"
    );
}

#[test]
fn test_chain_stays_consistent_under_churn() {
    let mgr = manager();
    let hfid = mgr.create_heap(0, class()).unwrap();

    let mut oids = Vec::new();
    for i in 0..40 {
        let body = vec![i as u8; 700];
        oids.push(mgr.insert(hfid, class(), 1, None, &body).unwrap());
    }
    for oid in oids.iter().step_by(3) {
        mgr.delete(hfid, class(), None, *oid).unwrap();
    }
    mgr.reclaim_addresses(hfid).unwrap();

    let pages = mgr.check(hfid).unwrap();
    assert_eq!(mgr.estimate(hfid).unwrap().num_pages as usize, pages);
    let live = oids.len() - oids.iter().step_by(3).count();
    assert_eq!(mgr.count_all(hfid).unwrap() as usize, live);
}
