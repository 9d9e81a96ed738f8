//! Wire protocol for the capability resource manager.
//!
//! This crate carries no behaviour of its own: it is the vocabulary
//! shared between the address-space engine (`rm-as`), the object store
//! (`rm-mm`) and the RPC layer (`rm-rpc`) for naming capabilities on
//! the wire and reporting faults back to clients.

#![forbid(unsafe_code)]

mod address;
mod error;
mod rpc;

pub use address::{Address, ADDR_BITS, VOID};
pub use error::Error;
pub use rpc::{CopyFlags, Label, Message, Properties};

/// Bits in a folio's object-version counter (§3 Folio).
pub const CAP_VERSION_BITS: u32 = 20;

/// Objects carved out of a single folio (§3 Folio).
pub const FOLIO_OBJECTS: usize = 128;

/// `log2(FOLIO_OBJECTS)`, the number of address bits a folio consumes
/// during a `lookup`/`build` walk (§4.3).
pub const FOLIO_OBJECTS_LOG2: u32 = FOLIO_OBJECTS.ilog2();

/// Upper bound on a capability slot's guard width (§3 Capability slot).
pub const CAP_ADDR_TRANS_GUARD_SUBPAGE_BITS: u32 = 22;

/// Width of a data page in address bits.
pub const PAGESIZE_LOG2: u32 = 12;

/// Width of a cappage's slot index in address bits (256 slots/page).
pub const CAPPAGE_SLOTS_LOG2: u32 = 8;
