//! Object store and folio allocator (§4.2), grounded on
//! `nucleus/src/objects/untyped.rs` (folio/object-table bookkeeping) and
//! `original_source/libhurd-mm/frame.c`/`store.c` for the claim/disown
//! and versioning discipline spec.md distills.

use crate::frametable::FrameTable;
use crate::lru;
use rm_cap::{
    ActivityId, ActivityTable, CapType, FolioHeader, FrameDescriptor, FrameId, Policy, PriorityKey,
};
use rm_proto::{Error, FOLIO_OBJECTS};
use std::collections::{HashMap, HashSet};

/// Which of an activity's three lists (or the process-global
/// `disowned` list) currently holds a frame (§3 Activity). Tracked
/// alongside the frame rather than inferred, since `LruList` itself
/// carries no membership tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Active,
    InactiveDirty,
    InactiveClean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Owned(ActivityId, ListKind),
    Disowned,
}

/// Maps object identifiers to in-memory frame descriptors, and folios
/// to the objects carved out of them (§2 Object store, §2 Folio
/// allocator).
pub struct ObjectStore {
    folios: HashMap<u64, FolioHeader>,
    oid_to_base: HashMap<u64, u64>,
    resident: HashMap<u64, FrameId>,
    /// Conservative approximation of "a capability referring to this
    /// oid has ever left the address space" (§4.2 Versioning
    /// algorithm). Callers that copy a capability to another task call
    /// [`Self::mark_escaped`]; nothing here attempts to reconstruct this
    /// from `rm-as` automatically.
    escaped: HashSet<u64>,
    locations: HashMap<FrameId, Location>,
    priority_nodes: HashMap<FrameId, rm_btree::NodeId>,
    next_base_oid: u64,
}

impl Default for ObjectStore {
    fn default() -> Self {
        ObjectStore {
            folios: HashMap::new(),
            oid_to_base: HashMap::new(),
            resident: HashMap::new(),
            escaped: HashSet::new(),
            locations: HashMap::new(),
            priority_nodes: HashMap::new(),
            next_base_oid: 1,
        }
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `folio_alloc(activity, policy) -> folio` (§4.2).
    pub fn folio_alloc(
        &mut self,
        activities: &mut ActivityTable,
        activity: ActivityId,
        policy: Policy,
    ) -> Result<u64, Error> {
        activities.charge(activity, 1).map_err(|_| Error::NoMemory)?;
        let base = self.next_base_oid;
        self.next_base_oid += FOLIO_OBJECTS as u64 + 1;
        let folio = FolioHeader::new(base, policy);
        for k in 0..FOLIO_OBJECTS {
            self.oid_to_base.insert(folio.oid_of(k), base);
        }
        self.folios.insert(base, folio);
        log::debug!("folio_alloc: base_oid={base} activity={activity:?}");
        Ok(base)
    }

    /// `folio_free(activity, folio)`: implicitly frees every object it
    /// contains (§4.2).
    pub fn folio_free(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        activity: ActivityId,
        base_oid: u64,
    ) {
        if let Some(folio) = self.folios.remove(&base_oid) {
            for k in 0..FOLIO_OBJECTS {
                let oid = folio.oid_of(k);
                self.oid_to_base.remove(&oid);
                self.escaped.remove(&oid);
                if let Some(frame_id) = self.resident.remove(&oid) {
                    self.evict(activities, frames, frame_id);
                    frames.free(frame_id);
                }
            }
        }
        activities.refund(activity, 1);
    }

    /// `folio_object_alloc(activity, folio, k, type, policy) -> object`
    /// (§4.2). `type = Void` is `folio_object_free`.
    pub fn folio_object_alloc(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        base_oid: u64,
        k: usize,
        ty: CapType,
        policy: Policy,
    ) -> Result<(u64, u32), Error> {
        let folio = self.folios.get(&base_oid).ok_or(Error::NoEntry)?;
        let oid = folio.oid_of(k);
        let escaped = self.escaped.remove(&oid);

        let folio = self.folios.get_mut(&base_oid).expect("checked above");
        folio.set_object_versioned(k, ty, policy, escaped);
        let version = folio.objects[k].version;
        log::trace!("folio_object_alloc: oid={oid} ty={ty:?} version={version} escaped={escaped}");

        // Replacing the object (or freeing it) evicts whatever frame
        // was materialized for the old occupant; a fresh `object_find`
        // re-materializes under the new type.
        if let Some(frame_id) = self.resident.remove(&oid) {
            self.evict(activities, frames, frame_id);
            frames.free(frame_id);
        }

        Ok((oid, version))
    }

    /// Mark that a capability naming `oid` has left the address space
    /// (SPEC_FULL supplement to §4.2's conservative escape tracking).
    pub fn mark_escaped(&mut self, oid: u64) {
        self.escaped.insert(oid);
    }

    /// `(oid, version)` is live iff the folio's recorded version
    /// matches and the type is not void (§3 Invariants).
    pub fn is_live(&self, oid: u64, version: u32) -> bool {
        let Some(&base) = self.oid_to_base.get(&oid) else {
            return false;
        };
        let folio = &self.folios[&base];
        let k = folio.slot_of(oid).expect("oid_to_base kept in sync");
        folio.is_live(k, version)
    }

    fn header_of(&self, oid: u64) -> Option<(CapType, Policy, u32)> {
        let base = *self.oid_to_base.get(&oid)?;
        let folio = &self.folios[&base];
        let k = folio.slot_of(oid)?;
        let hdr = &folio.objects[k];
        Some((
            hdr.ty,
            Policy { discardable: hdr.discardable, priority: 0 },
            hdr.version,
        ))
    }

    /// `object_find(activity, oid, policy) -> frame`, paging in (here:
    /// materializing a fresh descriptor) if necessary (§4.2).
    pub fn object_find(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        activity: ActivityId,
        oid: u64,
        policy: Policy,
    ) -> Result<FrameId, Error> {
        if let Some(&id) = self.resident.get(&oid) {
            return Ok(id);
        }
        let (ty, _, version) = self.header_of(oid).ok_or(Error::NoEntry)?;
        if ty == CapType::Void {
            return Err(Error::NoEntry);
        }
        let desc = FrameDescriptor::new(oid, version, ty, policy);
        let id = frames.alloc(desc);
        self.resident.insert(oid, id);
        self.object_claim(activities, frames, id, activity, policy)?;
        Ok(id)
    }

    /// `object_find_soft`: same as [`Self::object_find`] but never pages
    /// in; returns `None` on miss (§4.2).
    pub fn object_find_soft(&self, oid: u64) -> Option<FrameId> {
        self.resident.get(&oid).copied()
    }

    fn list_of<'a>(activities: &'a mut ActivityTable, loc: Location) -> Option<&'a mut rm_cap::LruList> {
        match loc {
            Location::Disowned => Some(&mut activities.disowned),
            Location::Owned(act, kind) => {
                let a = activities.get_mut(act)?;
                Some(match kind {
                    ListKind::Active => &mut a.active,
                    ListKind::InactiveDirty => &mut a.inactive_dirty,
                    ListKind::InactiveClean => &mut a.inactive_clean,
                })
            }
        }
    }

    fn detach_from_current(&mut self, activities: &mut ActivityTable, frames: &mut FrameTable, frame_id: FrameId) -> Option<Location> {
        let loc = self.locations.remove(&frame_id)?;
        if let Some(list) = Self::list_of(activities, loc) {
            lru::remove(list, frames, frame_id);
        }
        if let Location::Owned(old_activity, _) = loc {
            if let Some(a) = activities.get_mut(old_activity) {
                a.frames_total = a.frames_total.saturating_sub(1);
            }
            if let Some(node) = self.priority_nodes.remove(&frame_id) {
                if let Some(a) = activities.get_mut(old_activity) {
                    a.priority_tree.detach(node);
                }
            }
        }
        Some(loc)
    }

    /// `object_claim(activity, object, policy)`: move the frame onto
    /// `activity`'s `active` list, update `frames_total`, and (if
    /// `policy.priority` is non-default) index it in the priority tree
    /// (§4.2 Claim/disown contract).
    pub fn object_claim(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        frame_id: FrameId,
        activity: ActivityId,
        policy: Policy,
    ) -> Result<(), Error> {
        self.detach_from_current(activities, frames, frame_id);

        let a = activities.get_mut(activity).ok_or(Error::Invalid)?;
        lru::push_front(&mut a.active, frames, frame_id);
        a.frames_total += 1;

        if policy.priority != 0 {
            let seq = a.next_priority_seq();
            let key = PriorityKey { priority: policy.priority, seq };
            let node = match a.priority_tree.insert(key, frame_id) {
                rm_btree::Inserted::New(id) | rm_btree::Inserted::Existing(id) => id,
            };
            self.priority_nodes.insert(frame_id, node);
        }

        if let Some(d) = frames.get_mut(frame_id) {
            d.activity = Some(activity);
        }
        self.locations.insert(frame_id, Location::Owned(activity, ListKind::Active));
        Ok(())
    }

    /// `object_disown(object)`: move the frame to the process-global
    /// `disowned` list with a null activity back-pointer (§4.2
    /// Claim/disown contract, §3 Invariants).
    pub fn object_disown(&mut self, activities: &mut ActivityTable, frames: &mut FrameTable, frame_id: FrameId) {
        self.detach_from_current(activities, frames, frame_id);
        lru::push_front(&mut activities.disowned, frames, frame_id);
        if let Some(d) = frames.get_mut(frame_id) {
            d.activity = None;
        }
        self.locations.insert(frame_id, Location::Disowned);
    }

    /// Called when a frame's backing object disappears out from under
    /// it (`folio_free`/`folio_object_alloc`): detach from whichever
    /// list currently holds it without re-homing it anywhere. The
    /// caller has already removed the frame's `resident` entry.
    fn evict(&mut self, activities: &mut ActivityTable, frames: &mut FrameTable, frame_id: FrameId) {
        self.detach_from_current(activities, frames, frame_id);
    }

    /// `OBJECT_DISCARD` (§6): release a resident, clean, discardable
    /// object's frame, so a later `object_find` re-materializes a fresh
    /// one (SPEC_FULL §3 supplement, grounded on
    /// `libhurd-cap-server/obj-*.c`'s discard bookkeeping). A no-op if
    /// nothing is resident; refuses a frame that is dirty or whose
    /// policy forbids discarding.
    pub fn discard(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        oid: u64,
    ) -> Result<(), Error> {
        let Some(&frame_id) = self.resident.get(&oid) else {
            return Ok(());
        };
        let desc = frames.get(frame_id).ok_or(Error::NoEntry)?;
        if desc.dirty || !desc.policy.discardable {
            return Err(Error::WouldBlock);
        }
        self.resident.remove(&oid);
        self.evict(activities, frames, frame_id);
        frames.free(frame_id);
        Ok(())
    }

    /// §4.4 steps 5/6: move a frame between its activity's `active`
    /// list and one of the two inactive lists as its age crosses zero.
    /// A no-op for a frame with a non-default priority (it lives in the
    /// priority tree, not the plain LRU lists) or one with no owning
    /// activity (disowned frames are not aged).
    pub fn transition(
        &mut self,
        activities: &mut ActivityTable,
        frames: &mut FrameTable,
        frame_id: FrameId,
        now_active: bool,
    ) {
        let Some(Location::Owned(activity, current_kind)) = self.locations.get(&frame_id).copied()
        else {
            return;
        };
        let Some(desc) = frames.get(frame_id) else { return };
        if desc.policy.priority != 0 {
            return;
        }
        let target_kind = if now_active {
            ListKind::Active
        } else if desc.dirty && !desc.policy.discardable {
            ListKind::InactiveDirty
        } else {
            ListKind::InactiveClean
        };
        if target_kind == current_kind {
            return;
        }
        let Some(a) = activities.get_mut(activity) else { return };
        use ListKind::*;
        match (current_kind, target_kind) {
            (Active, InactiveDirty) => lru::move_between(frames, &mut a.active, &mut a.inactive_dirty, frame_id),
            (Active, InactiveClean) => lru::move_between(frames, &mut a.active, &mut a.inactive_clean, frame_id),
            (InactiveDirty, Active) => lru::move_between(frames, &mut a.inactive_dirty, &mut a.active, frame_id),
            (InactiveClean, Active) => lru::move_between(frames, &mut a.inactive_clean, &mut a.active, frame_id),
            (InactiveDirty, InactiveClean) => {
                lru::move_between(frames, &mut a.inactive_dirty, &mut a.inactive_clean, frame_id)
            }
            (InactiveClean, InactiveDirty) => {
                lru::move_between(frames, &mut a.inactive_clean, &mut a.inactive_dirty, frame_id)
            }
            _ => {}
        }
        self.locations.insert(frame_id, Location::Owned(activity, target_kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_cap::Policy;

    #[test]
    fn folio_alloc_charges_and_free_refunds() {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 10);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();

        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        assert_eq!(activities.get(root).unwrap().budget, 9);

        store.folio_free(&mut activities, &mut frames, root, base);
        assert_eq!(activities.get(root).unwrap().budget, 10);
    }

    #[test]
    fn object_alloc_then_find_materializes_a_resident_frame() {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 10);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();

        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        let (oid, version) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        assert_eq!(version, 0);
        assert!(store.is_live(oid, version));

        let frame_id = store
            .object_find(&mut activities, &mut frames, root, oid, Policy::default())
            .unwrap();
        assert_eq!(frames.get(frame_id).unwrap().oid, oid);
        assert_eq!(activities.get(root).unwrap().frames_total, 1);
        assert_eq!(activities.get(root).unwrap().active.len, 1);
    }

    #[test]
    fn versioning_only_bumps_when_escaped() {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 10);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();

        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        let (oid, v0) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        assert_eq!(v0, 0);

        // Never escaped: freeing and reallocating must not bump the version.
        let (oid2, v1) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        assert_eq!(oid2, oid);
        assert_eq!(v1, 0);

        store.mark_escaped(oid);
        let (_, v2) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        assert_eq!(v2, 1);
    }

    #[test]
    fn discard_frees_a_clean_discardable_frame_but_not_a_dirty_one() {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 10);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();

        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        let (oid, _) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        let discardable = Policy { discardable: true, priority: 0 };
        let frame_id = store
            .object_find(&mut activities, &mut frames, root, oid, discardable)
            .unwrap();

        frames.get_mut(frame_id).unwrap().dirty = true;
        assert_eq!(store.discard(&mut activities, &mut frames, oid), Err(Error::WouldBlock));
        assert!(store.object_find_soft(oid).is_some());

        frames.get_mut(frame_id).unwrap().dirty = false;
        store.discard(&mut activities, &mut frames, oid).unwrap();
        assert!(store.object_find_soft(oid).is_none());

        // Discarding something never resident is a no-op, not an error.
        store.discard(&mut activities, &mut frames, 9999).unwrap();
    }

    #[test]
    fn disown_moves_frame_to_global_list_with_null_activity() {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 10);
        let mut store = ObjectStore::new();
        let mut frames = FrameTable::new();

        let base = store.folio_alloc(&mut activities, root, Policy::default()).unwrap();
        let (oid, _) = store
            .folio_object_alloc(&mut activities, &mut frames, base, 0, CapType::Page, Policy::default())
            .unwrap();
        let frame_id = store
            .object_find(&mut activities, &mut frames, root, oid, Policy::default())
            .unwrap();

        store.object_disown(&mut activities, &mut frames, frame_id);
        assert_eq!(frames.get(frame_id).unwrap().activity, None);
        assert_eq!(activities.disowned.len, 1);
        assert_eq!(activities.get(root).unwrap().frames_total, 0);
    }
}
