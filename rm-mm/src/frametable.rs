//! The resident-frame table: storage for every [`FrameDescriptor`]
//! currently materialized in memory. Grounded on `nucleus/src/objects/
//! untyped.rs`'s slab-style descriptor array — `desc ↔ frame` conversion
//! there is pointer arithmetic off a linear array; here it is a `Vec`
//! index plus a free list, since this table owns frame lifetime instead
//! of aliasing raw physical memory (§3 Frame descriptor).

use rm_cap::{FrameDescriptor, FrameId};

#[derive(Default)]
pub struct FrameTable {
    frames: Vec<Option<FrameDescriptor>>,
    free: Vec<FrameId>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, desc: FrameDescriptor) -> FrameId {
        if let Some(id) = self.free.pop() {
            self.frames[id.0 as usize] = Some(desc);
            id
        } else {
            let id = FrameId(self.frames.len() as u32);
            self.frames.push(Some(desc));
            id
        }
    }

    pub fn free(&mut self, id: FrameId) {
        self.frames[id.0 as usize] = None;
        self.free.push(id);
    }

    pub fn get(&self, id: FrameId) -> Option<&FrameDescriptor> {
        self.frames.get(id.0 as usize).and_then(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameDescriptor> {
        self.frames.get_mut(id.0 as usize).and_then(|f| f.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &FrameDescriptor)> {
        self.frames.iter().enumerate().filter_map(|(i, f)| {
            f.as_ref().map(|d| (FrameId(i as u32), d))
        })
    }
}
