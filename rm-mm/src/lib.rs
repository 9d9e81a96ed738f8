//! Object store, folio allocator, ager, and memory-region manager — the
//! subsystems built atop `rm-cap`'s data model and `rm-as`'s address
//! space engine (§4.2, §4.4, §4.6).

#![forbid(unsafe_code)]

pub mod ager;
pub mod frametable;
pub mod lru;
pub mod region;
pub mod store;

pub use ager::{AccessSampler, Ager, AGER_THREAD_ID, BATCH_SIZE, FULL_UNMAP_PERIOD};
pub use frametable::FrameTable;
pub use region::{Access, Map, MemoryRecord, MemoryRegionManager, Range, RangeOverlap, Store, StoreId};
pub use store::ObjectStore;
