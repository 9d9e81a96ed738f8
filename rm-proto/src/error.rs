/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The wire error taxonomy (§6 Error taxonomy, §7 Error handling).

use snafu::Snafu;

/// Errors reported back to a client over the RPC reply path.
///
/// Faults from `lookup` are reported, not retried (§7): each variant
/// here corresponds to one row of §6's error taxonomy table.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The address was malformed (depth out of range, guard mismatch).
    Invalid,
    /// The slot named by the address is absent or has been revoked.
    NoEntry,
    /// The operation is not permitted (e.g. weakened capability used
    /// where a strong one is required).
    NotPermitted,
    /// The capability's type does not match what the operation expects.
    BadCapType,
    /// The operation would have to block and the caller asked not to.
    WouldBlock,
    /// The operation was cancelled (bucket/class/client/object
    /// inhibition, or shutdown).
    Canceled,
    /// Allocation failed (folio or page-table allocation).
    NoMemory,
    /// The sender already has an RPC in flight on this bucket.
    Busy,
    /// The `(oid, version)` pair no longer names a live object.
    CapDead,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
