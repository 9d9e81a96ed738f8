//! Doubly-linked LRU list manipulation (§3 Activity, §4.4 Ager). An
//! [`LruList`] is just head/tail/len counters (`rm-cap`); the link
//! storage lives on each frame's descriptor. Moving a frame between
//! lists is the one operation that has to touch both, so it lives here
//! rather than on either owning type.

use crate::frametable::FrameTable;
use rm_cap::{FrameId, LruList};

pub fn push_front(list: &mut LruList, table: &mut FrameTable, id: FrameId) {
    let old_head = list.head;
    if let Some(d) = table.get_mut(id) {
        d.lru_prev = None;
        d.lru_next = old_head;
    }
    match old_head {
        Some(h) => table.get_mut(h).expect("head in table").lru_prev = Some(id),
        None => list.tail = Some(id),
    }
    list.head = Some(id);
    list.len += 1;
}

pub fn remove(list: &mut LruList, table: &mut FrameTable, id: FrameId) {
    let (prev, next) = match table.get(id) {
        Some(d) => (d.lru_prev, d.lru_next),
        None => return,
    };
    match prev {
        Some(p) => table.get_mut(p).expect("prev in table").lru_next = next,
        None => list.head = next,
    }
    match next {
        Some(n) => table.get_mut(n).expect("next in table").lru_prev = prev,
        None => list.tail = prev,
    }
    if let Some(d) = table.get_mut(id) {
        d.lru_prev = None;
        d.lru_next = None;
    }
    list.len -= 1;
}

/// Detach `id` from `from` and push it onto the front of `to` (§4.2
/// Claim/disown contract, §4.4 step 5/6 active↔inactive transitions).
pub fn move_between(table: &mut FrameTable, from: &mut LruList, to: &mut LruList, id: FrameId) {
    remove(from, table, id);
    push_front(to, table, id);
}
