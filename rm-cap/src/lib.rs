/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Capability slots, folios, frame descriptors, and activities — the
//! data model of §3, shared by `rm-as` (address-space engine) and
//! `rm-mm` (object store, ager, memory regions).

#![forbid(unsafe_code)]

pub mod activity;
pub mod cappage;
pub mod folio;
pub mod frame;
pub mod slot;

pub use activity::{Activity, ActivityError, ActivityId, ActivityTable, LruList, PriorityKey};
pub use cappage::{CapPage, CAPPAGE_SLOTS};
pub use folio::{FolioHeader, ObjectHeader};
pub use frame::{FrameDescriptor, FrameId, FrameMutex, AGE_WIDTH};
pub use slot::{AddrTrans, CapSlot, CapType, Designation, Policy};
