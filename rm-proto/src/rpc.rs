/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! RPC labels and payloads (§6 Wire protocol).
//!
//! Grounded on `nucleus/src/api.rs`'s syscall trait shape: there the
//! teacher models the kernel ABI as a flat `send`/`recv`/`call` surface;
//! here the resource manager's ABI is the capability-layer subset of
//! that surface, specialized to the operations §6 names.

use bitflags::bitflags;

/// Up to one capability handle and 62 untyped words, per §6.
pub const MAX_UNTYPED_WORDS: usize = 62;

bitflags! {
    /// `CAP_COPY` flags (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CopyFlags: u8 {
        /// Use the subpage descriptor from `properties`.
        const ADDR_TRANS_SUBPAGE = 1 << 0;
        /// Use the guard from `properties`.
        const ADDR_TRANS_GUARD = 1 << 1;
        /// Use the source capability's own guard.
        const SOURCE_GUARD = 1 << 2;
        /// Save a weakened (`r*`) copy of the source's type.
        const WEAKEN = 1 << 3;
        /// `properties.discardable` is meaningful.
        const DISCARDABLE_SET = 1 << 4;
        /// `properties.priority` is meaningful.
        const PRIORITY_SET = 1 << 5;
    }
}

/// Capability-slot properties carried by `CAP_COPY`/`CAP_READ` (§3
/// Capability slot `policy`/`addr_trans`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties {
    pub guard: u32,
    pub guard_bits: u8,
    pub subpage_index: u16,
    pub subpage_count: u16,
    pub discardable: bool,
    pub priority: i8,
}

/// RPC labels used by the capability layer (§6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    CapCopy,
    CapRubout,
    CapRead,
    ObjectDiscardedClear,
    ObjectDiscard,
    ObjectStatus,
    ObjectReplyOnDestruction,
    ObjectName,
    Cancel,
    GetRoot,
}

/// Message envelope: `{ label, sender_task_id, up to 1 capability
/// handle, up to 62 untyped words }` (§6).
#[derive(Debug, Clone)]
pub struct Message {
    pub label: Label,
    pub sender_task_id: u64,
    /// A capability handle naming the object the RPC targets, when the
    /// label requires one (e.g. the bucket/object addressed via a
    /// client handle table, §3 Client).
    pub cap_handle: Option<u32>,
    pub words: heapless_words::Words,
}

/// A small fixed-capacity word buffer, avoiding a heap allocation for
/// the common case of a handful of untyped words.
mod heapless_words {
    use super::MAX_UNTYPED_WORDS;

    #[derive(Debug, Clone)]
    pub struct Words {
        buf: [u64; MAX_UNTYPED_WORDS],
        len: usize,
    }

    impl Default for Words {
        fn default() -> Self {
            Words {
                buf: [0; MAX_UNTYPED_WORDS],
                len: 0,
            }
        }
    }

    impl Words {
        pub fn from_slice(words: &[u64]) -> Self {
            assert!(words.len() <= MAX_UNTYPED_WORDS);
            let mut w = Words::default();
            w.buf[..words.len()].copy_from_slice(words);
            w.len = words.len();
            w
        }

        pub fn as_slice(&self) -> &[u64] {
            &self.buf[..self.len]
        }
    }
}

impl Message {
    pub fn new(label: Label, sender_task_id: u64) -> Self {
        Message {
            label,
            sender_task_id,
            cap_handle: None,
            words: Default::default(),
        }
    }

    pub fn with_words(mut self, words: &[u64]) -> Self {
        self.words = heapless_words::Words::from_slice(words);
        self
    }

    pub fn with_cap(mut self, handle: u32) -> Self {
        self.cap_handle = Some(handle);
        self
    }

    pub fn words(&self) -> &[u64] {
        self.words.as_slice()
    }

    /// `true` for the one label the bucket manager accepts irrespective
    /// of inhibition state (§4.5 Cancellation RPC).
    pub fn is_cancel(&self) -> bool {
        matches!(self.label, Label::Cancel)
    }
}
