//! The RPC bucket and worker-pool scheduler: per-sender acceptance,
//! inhibition, and cancellation (§4.5). No teacher module covers this
//! (the teacher is a single-core bare-metal nucleus); grounded instead
//! on `original_source/libhurd-cap-server/*`.

#![forbid(unsafe_code)]

pub mod bucket;
pub mod cancel;
pub mod inhibit;
pub mod table;

pub use bucket::{Bucket, Handshake, WorkerAllocPolicy};
pub use cancel::CancelToken;
pub use inhibit::{Inhibitable, State};
pub use table::{ClassTable, ClientTable, InhibitTable, ObjectTable};
