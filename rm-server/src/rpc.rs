//! The §6 wire-protocol handlers: each [`Label`] is resolved here
//! against the shared `rm-as` address space and `rm-mm` object store,
//! then run through [`Bucket::dispatch`] so acceptance, busy-rejection,
//! and cancellation all go through the same manager/worker path real
//! RPC traffic would.
//!
//! `CAP_COPY`/`CAP_RUBOUT`/`CAP_READ` name their target by address and
//! act purely on the guarded page table (`rm-as`); the `OBJECT_*`
//! labels act on the object an already-resolved capability designates,
//! named here by `Message::cap_handle` as a stand-in for the client
//! handle table §3's `Client` describes — this crate wires one shared
//! address space rather than a table of per-client ones, so
//! `cap_handle` is read directly as an oid (truncated to 32 bits) and
//! `CAP_COPY`'s `src_obj_cap` is folded into the single address space
//! via `src_addr` instead of naming a separate source cspace.

use rm_as::{AddressSpace, LookupMode, LookupOutcome};
use rm_cap::{ActivityId, ActivityTable, CapSlot, CapType, Policy};
use rm_mm::{FrameTable, ObjectStore};
use rm_proto::{Address, CopyFlags, Error, Label, Message, Properties};
use rm_rpc::Bucket;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// The reply payload a handler produces, alongside the `Result`'s `Err`
/// side carrying the §6 error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `{err}`-only replies (`CAP_COPY`, `CAP_RUBOUT`,
    /// `OBJECT_DISCARDED_CLEAR`, `OBJECT_DISCARD`, `OBJECT_NAME`, `CANCEL`).
    Ack,
    /// `CAP_READ`'s `{err, type, properties}`.
    CapRead { ty: CapType, properties: Properties },
    /// `OBJECT_STATUS`'s `{err, status: {dirty, referenced}}`.
    Status { dirty: bool, referenced: bool },
    /// `OBJECT_REPLY_ON_DESTRUCTION`'s `{err, return_code}`.
    Destroyed { return_code: i32 },
    /// `GET_ROOT`'s `{err, cap}`.
    Root(CapSlot),
}

/// One pending `OBJECT_REPLY_ON_DESTRUCTION` registration: the worker
/// thread blocks on `condvar` until [`Handlers::destroy_object`] sets
/// `return_code` and notifies.
struct DestructionWaiter {
    return_code: Mutex<Option<i32>>,
    condvar: Condvar,
}

/// Shared state every handler reads or mutates, wired into `Bucket`'s
/// worker closures by `Server::handle`.
pub struct Handlers {
    pub address_space: Arc<Mutex<AddressSpace>>,
    pub activities: Arc<Mutex<ActivityTable>>,
    pub frames: Arc<Mutex<FrameTable>>,
    pub store: Arc<Mutex<ObjectStore>>,
    pub bucket: Arc<Bucket>,
    pub root_activity: ActivityId,
    names: Mutex<HashMap<u64, [u8; 12]>>,
    destruction_waiters: Mutex<HashMap<u64, Vec<Arc<DestructionWaiter>>>>,
}

fn decode_properties(word_a: u64, word_b: u64) -> Properties {
    Properties {
        guard: word_a as u32,
        guard_bits: (word_a >> 32) as u8,
        discardable: (word_a >> 40) & 1 != 0,
        priority: ((word_a >> 48) as u8) as i8,
        subpage_index: word_b as u16,
        subpage_count: (word_b >> 16) as u16,
    }
}

fn encode_properties(p: Properties) -> (u64, u64) {
    let word_a = p.guard as u64
        | (p.guard_bits as u64) << 32
        | (p.discardable as u64) << 40
        | ((p.priority as u8 as u64) << 48);
    let word_b = p.subpage_index as u64 | (p.subpage_count as u64) << 16;
    (word_a, word_b)
}

impl Handlers {
    pub fn new(
        address_space: Arc<Mutex<AddressSpace>>,
        activities: Arc<Mutex<ActivityTable>>,
        frames: Arc<Mutex<FrameTable>>,
        store: Arc<Mutex<ObjectStore>>,
        bucket: Arc<Bucket>,
        root_activity: ActivityId,
    ) -> Self {
        Handlers {
            address_space,
            activities,
            frames,
            store,
            bucket,
            root_activity,
            names: Mutex::new(HashMap::new()),
            destruction_waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch one already-decoded [`Message`] to its handler (§6 table).
    pub fn handle(&self, msg: &Message) -> Result<Reply, Error> {
        match msg.label {
            Label::CapCopy => self.cap_copy(msg).map(|_| Reply::Ack),
            Label::CapRubout => self.cap_rubout(msg).map(|_| Reply::Ack),
            Label::CapRead => self.cap_read(msg),
            Label::ObjectDiscardedClear => self.object_discarded_clear(msg).map(|_| Reply::Ack),
            Label::ObjectDiscard => self.object_discard(msg).map(|_| Reply::Ack),
            Label::ObjectStatus => self.object_status(msg),
            Label::ObjectReplyOnDestruction => self.object_reply_on_destruction(msg),
            Label::ObjectName => self.object_name(msg).map(|_| Reply::Ack),
            Label::Cancel => self.cancel(msg).map(|_| Reply::Ack),
            Label::GetRoot => self.get_root(),
        }
    }

    fn oid_of(&self, msg: &Message) -> Result<u64, Error> {
        msg.cap_handle.map(|h| h as u64).ok_or(Error::Invalid)
    }

    /// `CAP_COPY`: `{dst_addr, src_addr, flags, properties}` (§6).
    fn cap_copy(&self, msg: &Message) -> Result<(), Error> {
        let words = msg.words();
        let dst_addr = Address::from_word(words[0]);
        let src_addr = Address::from_word(words[1]);
        let flags = CopyFlags::from_bits_truncate(words[2] as u8);
        let props = decode_properties(words[3], words[4]);

        let mut asp = self.address_space.lock().unwrap();
        let LookupOutcome::Cap(mut src_slot) = asp.lookup(src_addr, None, LookupMode::WantCap)?
        else {
            unreachable!("want_cap always yields Cap")
        };

        if flags.contains(CopyFlags::WEAKEN) {
            src_slot = src_slot.weakened();
        }
        if flags.contains(CopyFlags::DISCARDABLE_SET) || flags.contains(CopyFlags::PRIORITY_SET) {
            let mut policy = src_slot.policy();
            if flags.contains(CopyFlags::DISCARDABLE_SET) {
                policy.discardable = props.discardable;
            }
            if flags.contains(CopyFlags::PRIORITY_SET) {
                policy.priority = props.priority;
            }
            src_slot.set_policy(policy);
        }
        let override_guard = flags.contains(CopyFlags::ADDR_TRANS_GUARD) || flags.contains(CopyFlags::SOURCE_GUARD);
        if flags.contains(CopyFlags::ADDR_TRANS_SUBPAGE) || flags.contains(CopyFlags::ADDR_TRANS_GUARD) {
            let mut at = src_slot.addr_trans();
            if flags.contains(CopyFlags::ADDR_TRANS_SUBPAGE) {
                at.subpage_index = props.subpage_index;
                at.subpage_count = props.subpage_count.max(1);
            }
            if flags.contains(CopyFlags::ADDR_TRANS_GUARD) {
                at.guard = props.guard;
                at.guard_bits = props.guard_bits;
            }
            src_slot.set_addr_trans(at);
        }

        let handle = asp.build(dst_addr, true)?;
        asp.copy_into(handle, src_slot, override_guard);
        Ok(())
    }

    /// `CAP_RUBOUT`: `{addr}` (§6) — resolve to the owning slot and void it.
    fn cap_rubout(&self, msg: &Message) -> Result<(), Error> {
        let addr = Address::from_word(msg.words()[0]);
        let mut asp = self.address_space.lock().unwrap();
        let LookupOutcome::Slot(handle) = asp.lookup(addr, None, LookupMode::WantSlot)? else {
            unreachable!("want_slot always yields Slot")
        };
        asp.write_handle(handle, CapSlot::void());
        Ok(())
    }

    /// `CAP_READ`: `{addr}` -> `{type, properties}` (§6).
    fn cap_read(&self, msg: &Message) -> Result<Reply, Error> {
        let addr = Address::from_word(msg.words()[0]);
        let asp = self.address_space.lock().unwrap();
        let LookupOutcome::Cap(slot) = asp.lookup(addr, None, LookupMode::WantCap)? else {
            unreachable!("want_cap always yields Cap")
        };
        let at = slot.addr_trans();
        let policy = slot.policy();
        Ok(Reply::CapRead {
            ty: slot.cap_type(),
            properties: Properties {
                guard: at.guard,
                guard_bits: at.guard_bits,
                subpage_index: at.subpage_index,
                subpage_count: at.subpage_count,
                discardable: policy.discardable,
                priority: policy.priority,
            },
        })
    }

    /// `OBJECT_DISCARDED_CLEAR`: `{addr}` (§6) — acknowledge that the
    /// client has observed the object's content as discarded; fails if
    /// the object named is no longer live.
    fn object_discarded_clear(&self, msg: &Message) -> Result<(), Error> {
        let addr = Address::from_word(msg.words()[0]);
        let asp = self.address_space.lock().unwrap();
        let LookupOutcome::Object { oid, version, .. } = asp.lookup(addr, None, LookupMode::WantObject)? else {
            unreachable!("want_object always yields Object")
        };
        let store = self.store.lock().unwrap();
        if !store.is_live(oid, version) {
            return Err(Error::CapDead);
        }
        Ok(())
    }

    /// `OBJECT_DISCARD`: targets `msg.cap_handle` (§6, SPEC_FULL §3 supplement).
    fn object_discard(&self, msg: &Message) -> Result<(), Error> {
        let oid = self.oid_of(msg)?;
        let mut activities = self.activities.lock().unwrap();
        let mut frames = self.frames.lock().unwrap();
        let mut store = self.store.lock().unwrap();
        store.discard(&mut activities, &mut frames, oid)
    }

    /// `OBJECT_STATUS`: `{clear}` -> `{dirty, referenced}` (§6), targets
    /// `msg.cap_handle`.
    fn object_status(&self, msg: &Message) -> Result<Reply, Error> {
        let oid = self.oid_of(msg)?;
        let clear = msg.words().first().copied().unwrap_or(0) != 0;

        let store = self.store.lock().unwrap();
        let Some(frame_id) = store.object_find_soft(oid) else {
            return Ok(Reply::Status { dirty: false, referenced: false });
        };
        drop(store);

        let mut frames = self.frames.lock().unwrap();
        let desc = frames.get_mut(frame_id).ok_or(Error::NoEntry)?;
        let dirty = desc.dirty;
        let referenced = desc.is_active();
        if clear {
            desc.dirty = false;
            desc.age = 0;
        }
        Ok(Reply::Status { dirty, referenced })
    }

    /// `OBJECT_REPLY_ON_DESTRUCTION`: no payload, targets
    /// `msg.cap_handle` (§6). Blocks the worker until
    /// [`Self::destroy_object`] is called for this oid — there is no
    /// client-invokable "free object" label in §6's table, so the
    /// trigger is this crate's own internal deallocation path, not a
    /// wire message.
    fn object_reply_on_destruction(&self, msg: &Message) -> Result<Reply, Error> {
        let oid = self.oid_of(msg)?;
        let waiter = Arc::new(DestructionWaiter {
            return_code: Mutex::new(None),
            condvar: Condvar::new(),
        });
        self.destruction_waiters
            .lock()
            .unwrap()
            .entry(oid)
            .or_default()
            .push(Arc::clone(&waiter));

        let mut code = waiter.return_code.lock().unwrap();
        while code.is_none() {
            code = waiter.condvar.wait(code).unwrap();
        }
        Ok(Reply::Destroyed { return_code: code.unwrap() })
    }

    /// Wake every `OBJECT_REPLY_ON_DESTRUCTION` waiter registered for
    /// `oid` with `return_code`. The internal hook real deallocation
    /// (e.g. `folio_object_alloc` with `CapType::Void`) would call.
    pub fn destroy_object(&self, oid: u64, return_code: i32) {
        if let Some(waiters) = self.destruction_waiters.lock().unwrap().remove(&oid) {
            for w in waiters {
                *w.return_code.lock().unwrap() = Some(return_code);
                w.condvar.notify_all();
            }
        }
    }

    /// `OBJECT_NAME`: `{name[12]}` (§6), targets `msg.cap_handle`.
    fn object_name(&self, msg: &Message) -> Result<(), Error> {
        let oid = self.oid_of(msg)?;
        let words = msg.words();
        let mut name = [0u8; 12];
        for (i, b) in name.iter_mut().enumerate() {
            let word = words.get(i / 8).copied().unwrap_or(0);
            *b = (word >> ((i % 8) * 8)) as u8;
        }
        self.names.lock().unwrap().insert(oid, name);
        Ok(())
    }

    /// `CANCEL`: `{thread_id}` (§6) — bypasses the busy check at the
    /// bucket level; here it only needs to signal the target's token.
    fn cancel(&self, msg: &Message) -> Result<(), Error> {
        let target = msg.words().first().copied().unwrap_or(msg.sender_task_id);
        self.bucket.cancel_sender(target);
        Ok(())
    }

    /// `GET_ROOT`: no payload -> `{cap}` (§6).
    fn get_root(&self) -> Result<Reply, Error> {
        let asp = self.address_space.lock().unwrap();
        Ok(Reply::Root(asp.root()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_cap::{AddrTrans, Designation};
    use rm_rpc::WorkerAllocPolicy;
    use std::time::Duration;

    fn handlers() -> Handlers {
        let mut activities = ActivityTable::new();
        let root = activities.create(None, 1000);
        Handlers::new(
            Arc::new(Mutex::new(AddressSpace::new())),
            Arc::new(Mutex::new(activities)),
            Arc::new(Mutex::new(FrameTable::new())),
            Arc::new(Mutex::new(ObjectStore::new())),
            Bucket::new(WorkerAllocPolicy::Synchronous, Duration::from_secs(5)),
            root,
        )
    }

    fn page_cap(oid: u64) -> CapSlot {
        CapSlot::new(
            CapType::Page,
            Policy::default(),
            AddrTrans::default(),
            Designation { oid, version: 0 },
        )
    }

    #[test]
    fn cap_copy_then_cap_read_round_trips_through_the_wire_words() {
        let h = handlers();
        {
            let mut asp = h.address_space.lock().unwrap();
            let handle = asp.build(Address::new(0xAAAA_0000_u64 << 32, 32), false).unwrap();
            asp.copy_into(handle, page_cap(7), false);
        }

        let dst = Address::new(0xBBBB_0000_u64 << 32, 32);
        let src = Address::new(0xAAAA_0000_u64 << 32, 32);
        let (pa, pb) = encode_properties(Properties::default());
        let copy = Message::new(Label::CapCopy, 1).with_words(&[dst.to_word(), src.to_word(), 0, pa, pb]);
        h.handle(&copy).unwrap();

        let read = Message::new(Label::CapRead, 1).with_words(&[dst.to_word()]);
        match h.handle(&read).unwrap() {
            Reply::CapRead { ty, .. } => assert_eq!(ty, CapType::Page),
            other => panic!("expected CapRead, got {other:?}"),
        }
    }

    #[test]
    fn cap_rubout_voids_the_slot() {
        let h = handlers();
        let addr = Address::new(0xCCCC_0000_u64 << 32, 32);
        {
            let mut asp = h.address_space.lock().unwrap();
            let handle = asp.build(addr, false).unwrap();
            asp.copy_into(handle, page_cap(3), false);
        }

        h.handle(&Message::new(Label::CapRubout, 1).with_words(&[addr.to_word()])).unwrap();

        let err = h
            .handle(&Message::new(Label::CapRead, 1).with_words(&[addr.to_word()]))
            .unwrap_err();
        assert_eq!(err, Error::NoEntry);
    }

    #[test]
    fn get_root_returns_the_address_spaces_root_slot() {
        let h = handlers();
        h.address_space.lock().unwrap().set_root(page_cap(99));
        match h.handle(&Message::new(Label::GetRoot, 1)).unwrap() {
            Reply::Root(slot) => assert_eq!(slot.designation().oid, 99),
            other => panic!("expected Root, got {other:?}"),
        }
    }

    #[test]
    fn object_discard_then_status_report_the_frames_state() {
        let h = handlers();
        let base = h
            .store
            .lock()
            .unwrap()
            .folio_alloc(&mut h.activities.lock().unwrap(), h.root_activity, Policy::default())
            .unwrap();
        let (oid, _) = h
            .store
            .lock()
            .unwrap()
            .folio_object_alloc(
                &mut h.activities.lock().unwrap(),
                &mut h.frames.lock().unwrap(),
                base,
                0,
                CapType::Page,
                Policy { discardable: true, priority: 0 },
            )
            .unwrap();
        h.store
            .lock()
            .unwrap()
            .object_find(
                &mut h.activities.lock().unwrap(),
                &mut h.frames.lock().unwrap(),
                h.root_activity,
                oid,
                Policy { discardable: true, priority: 0 },
            )
            .unwrap();

        let status = Message::new(Label::ObjectStatus, 1).with_cap(oid as u32);
        match h.handle(&status).unwrap() {
            Reply::Status { dirty, referenced } => assert!(!dirty && !referenced),
            other => panic!("expected Status, got {other:?}"),
        }

        let discard = Message::new(Label::ObjectDiscard, 1).with_cap(oid as u32);
        h.handle(&discard).unwrap();
        assert!(h.store.lock().unwrap().object_find_soft(oid).is_none());
    }

    #[test]
    fn object_reply_on_destruction_unblocks_when_destroy_object_is_called() {
        use std::sync::mpsc;
        use std::thread;

        let h = Arc::new(handlers());
        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&h);
        thread::spawn(move || {
            let reply = waiter
                .handle(&Message::new(Label::ObjectReplyOnDestruction, 1).with_cap(5))
                .unwrap();
            tx.send(reply).unwrap();
        });

        // Give the waiter a moment to register before signaling it.
        thread::sleep(Duration::from_millis(20));
        h.destroy_object(5, 42);

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Reply::Destroyed { return_code } => assert_eq!(return_code, 42),
            other => panic!("expected Destroyed, got {other:?}"),
        }
    }

    #[test]
    fn cancel_reaches_the_bucket() {
        let h = handlers();
        // No RPC in flight for sender 5: cancel_sender returns false,
        // but the handler itself still reports success on the wire.
        h.handle(&Message::new(Label::Cancel, 1).with_words(&[5])).unwrap();
    }
}
