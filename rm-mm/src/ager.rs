//! The ager: a periodic sweep that ages frames and rebalances LRU
//! lists under memory pressure (§4.4), grounded on
//! `original_source/viengoos/ager.c`'s sweep loop. The hardware
//! referenced/dirty query and the global unmap are behind
//! [`AccessSampler`] since neither has a meaning above the MMU this
//! crate sits on top of.

use crate::frametable::FrameTable;
use crate::store::ObjectStore;
use rm_cap::ActivityTable;

/// Thread id the ager reserves for itself when taking a frame's mutex
/// (`rm-cap::FrameMutex` ids are caller-assigned; real RPC worker
/// threads start at 1, so this sentinel never collides with one).
pub const AGER_THREAD_ID: u64 = u64::MAX;

/// Frames swept per wakeup (§4.4: "sweeps batches of up to
/// `BATCH_SIZE` descriptors").
pub const BATCH_SIZE: usize = 256;

/// Full unmap cadence (§4.4: "every `N ≈ 40` iterations").
pub const FULL_UNMAP_PERIOD: u32 = 40;

/// The hook through which the ager queries and clears a frame's
/// hardware access bits, and performs the periodic full unmap. An
/// implementation lives above the microkernel's MMU interface; this
/// crate only defines when it is called.
pub trait AccessSampler {
    /// Atomically read and clear `oid`'s referenced/dirty bits (§4.4
    /// step 3; relies on `l4_flush` semantics — "reading the access
    /// bits also clears them").
    fn sample_and_clear(&mut self, oid: u64) -> (bool, bool);

    /// Unmap every translation, so dormant shared pages re-attribute to
    /// whichever activity next touches them (§4.4).
    fn unmap_all(&mut self);
}

/// A single worker that wakes every ≈125ms (`8 Hz`) and sweeps a batch
/// of resident frames (§4.4).
pub struct Ager {
    batch_size: usize,
    cursor: usize,
    sweeps_since_unmap: u32,
}

impl Default for Ager {
    fn default() -> Self {
        Ager {
            batch_size: BATCH_SIZE,
            cursor: 0,
            sweeps_since_unmap: 0,
        }
    }
}

impl Ager {
    pub fn new(batch_size: usize) -> Self {
        Ager {
            batch_size,
            ..Self::default()
        }
    }

    /// One sweep (§4.4 steps 1-6). Dead frames never appear in
    /// `frames`'s live set, so step 1 ("skip dead") falls out of
    /// iterating only resident descriptors.
    pub fn sweep(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        store: &mut ObjectStore,
        sampler: &mut dyn AccessSampler,
    ) {
        let ids: Vec<_> = frames.iter().map(|(id, _)| id).collect();
        if ids.is_empty() {
            return;
        }
        let n = ids.len();
        let take = self.batch_size.min(n);
        for i in 0..take {
            let id = ids[(self.cursor + i) % n];
            let Some(desc) = frames.get(id) else { continue };
            // step 2: try_lock never blocks; skip contested frames.
            if !desc.mutex.try_lock(AGER_THREAD_ID) {
                continue;
            }
            let oid = desc.oid;
            let was_active = desc.is_active();

            // step 3: atomically query and clear referenced+dirty.
            let (referenced, dirty) = sampler.sample_and_clear(oid);

            // step 4: fold into dirty/age state.
            {
                let d = frames.get_mut(id).expect("locked above");
                d.dirty |= dirty;
                d.age_tick(referenced);
            }
            let now_active = frames.get(id).expect("locked above").is_active();

            // steps 5/6: active <-> inactive list transition.
            if was_active != now_active {
                store.transition(activities, frames, id, now_active);
            }

            frames.get(id).expect("locked above").mutex.unlock(AGER_THREAD_ID);
        }
        self.cursor = (self.cursor + take) % n;

        self.sweeps_since_unmap += 1;
        if self.sweeps_since_unmap >= FULL_UNMAP_PERIOD {
            self.sweeps_since_unmap = 0;
            log::debug!("ager: full unmap after {FULL_UNMAP_PERIOD} sweeps");
            sampler.unmap_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frametable::FrameTable;
    use rm_cap::{ActivityTable, CapType, Policy};

    struct NeverReferenced;
    impl AccessSampler for NeverReferenced {
        fn sample_and_clear(&mut self, _oid: u64) -> (bool, bool) {
            (false, false)
        }
        fn unmap_all(&mut self) {}
    }

    struct AlwaysReferenced;
    impl AccessSampler for AlwaysReferenced {
        fn sample_and_clear(&mut self, _oid: u64) -> (bool, bool) {
            (true, false)
        }
        fn unmap_all(&mut self) {}
    }

    fn setup() -> (ActivityTable, FrameTable, ObjectStore, rm_cap::ActivityId, rm_cap::FrameId) {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 100);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();
        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        let (oid, _) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        let frame_id = store
            .object_find(&mut activities, &mut frames, root, oid, Policy::default())
            .unwrap();
        (activities, frames, store, root, frame_id)
    }

    #[test]
    fn referenced_frame_stays_in_active_list() {
        let (mut activities, mut frames, mut store, root, frame_id) = setup();
        let mut ager = Ager::new(8);
        let mut sampler = AlwaysReferenced;

        ager.sweep(&mut activities, &mut frames, &mut store, &mut sampler);
        assert!(frames.get(frame_id).unwrap().is_active());
        assert_eq!(activities.get(root).unwrap().active.len, 1);
        assert_eq!(activities.get(root).unwrap().inactive_clean.len, 0);
    }

    #[test]
    fn unreferenced_frame_moves_to_inactive_after_age_width_sweeps() {
        let (mut activities, mut frames, mut store, root, frame_id) = setup();
        let mut ager = Ager::new(8);

        // One referenced sweep to seed an active bit, matching the
        // "ager monotonicity" property's starting condition.
        ager.sweep(&mut activities, &mut frames, &mut store, &mut AlwaysReferenced);
        assert!(frames.get(frame_id).unwrap().is_active());

        let mut sampler = NeverReferenced;
        for _ in 0..rm_cap::AGE_WIDTH {
            ager.sweep(&mut activities, &mut frames, &mut store, &mut sampler);
        }

        assert!(!frames.get(frame_id).unwrap().is_active());
        assert_eq!(activities.get(root).unwrap().active.len, 0);
        assert_eq!(activities.get(root).unwrap().inactive_clean.len, 1);
    }

    #[test]
    fn full_unmap_fires_every_n_sweeps() {
        let (mut activities, mut frames, mut store, _root, _frame_id) = setup();
        let mut ager = Ager::new(8);

        struct CountingSampler {
            unmaps: usize,
        }
        impl AccessSampler for CountingSampler {
            fn sample_and_clear(&mut self, _oid: u64) -> (bool, bool) {
                (false, false)
            }
            fn unmap_all(&mut self) {
                self.unmaps += 1;
            }
        }
        let mut sampler = CountingSampler { unmaps: 0 };
        for _ in 0..FULL_UNMAP_PERIOD {
            ager.sweep(&mut activities, &mut frames, &mut store, &mut sampler);
        }
        assert_eq!(sampler.unmaps, 1);
    }
}
