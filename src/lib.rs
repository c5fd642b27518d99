//! Heap-file manager for a disk-based relational storage engine.
//!
//! Records live in per-class heap files: unordered collections of slotted
//! pages chained off a header page. A record keeps its OID for life while
//! its body moves between inline storage, relocated bodies, and overflow
//! chains as it grows and shrinks. Multi-version headers at the front of
//! every record carry the visibility metadata snapshot scans evaluate.
//!
//! [`HeapManager`](heap::HeapManager) is the entry point. The page buffer,
//! the recovery log, and the snapshot predicate are collaborators supplied
//! by the surrounding engine; in-memory implementations of all three ship
//! here and back the test suite.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hearthdb::config::HeapConfig;
//! use hearthdb::heap::{FetchMode, HeapManager};
//! use hearthdb::log::RecoveryLog;
//! use hearthdb::page::PageBuffer;
//! # use hearthdb::classrepr::ClassReprLoader;
//! # fn demo(loader: Arc<dyn ClassReprLoader>) -> hearthdb::error::Result<()> {
//! let manager = HeapManager::new(
//!     Arc::new(PageBuffer::new()),
//!     Arc::new(RecoveryLog::new()),
//!     HeapConfig::default(),
//!     loader,
//! );
//! let class = hearthdb::types::ClassId::new(0, 1, 0);
//! let hfid = manager.create_heap(0, class)?;
//! let oid = manager.insert(hfid, class, 1, None, b"record bytes")?;
//! let (code, bytes) = manager.get(oid, FetchMode::Plain, None)?;
//! # let _ = (code, bytes);
//! # Ok(())
//! # }
//! ```

pub mod bestspace;
pub mod classrepr;
pub mod config;
pub mod error;
pub mod heap;
pub mod log;
pub mod mvcc;
pub mod overflow;
pub mod page;
pub mod slotted;
pub mod types;

pub use config::HeapConfig;
pub use error::{Error, Result, ScanCode};
pub use heap::{FetchMode, HeapManager, OperationContext, OperationKind, ScanCache, ScanRange};
pub use types::{Hfid, Oid, Vpid};
