//! The bucket manager and its worker pool (§4.5), grounded on
//! `libhurd-cap-server/bucket-manage-mt.c` (the manager's accept loop)
//! and `bucket-worker-alloc.c` (synchronous worker creation on demand).
//! A worker is a real OS thread; `Bucket::dispatch` plays the role of
//! the manager's closed-receive loop, one message at a time.

use crate::cancel::CancelToken;
use crate::inhibit::{Inhibitable, State};
use rm_proto::{Error, Message};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Worker allocation policy (§4.5 Worker allocation policy). Only
/// `Synchronous` is implemented: the manager creates workers inline.
/// `Asynchronous` (a background allocator thread, used where the
/// manager creating a thread could deadlock — e.g. the physical-memory
/// server creating threads via a task server blocked on the memory
/// server) is recorded as a non-goal for this port; `rm-server` never
/// puts this crate in that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAllocPolicy {
    Synchronous,
}

/// A worker's reply to the manager after deciding whether to run an
/// RPC (§4.5 Worker acceptance handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accepted,
    Rejected,
}

enum WorkerMsg {
    Rpc { msg: Message, body: Box<dyn FnOnce() + Send>, handshake: mpsc::Sender<Handshake> },
    Shutdown,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
}

/// A capability bucket: the manager state (§3 Bucket, §4.5) that
/// serializes acceptance of one RPC per sender and hands each accepted
/// message to a worker drawn from `free_workers`.
pub struct Bucket {
    inhibit: Inhibitable,
    senders: Mutex<HashSet<u64>>,
    in_flight: Mutex<HashMap<u64, CancelToken>>,
    free_workers: Mutex<VecDeque<WorkerHandle>>,
    next_worker_id: AtomicU64,
    worker_timeout: Duration,
    policy: WorkerAllocPolicy,
}

impl Bucket {
    pub fn new(policy: WorkerAllocPolicy, worker_timeout: Duration) -> Arc<Self> {
        Arc::new(Bucket {
            inhibit: Inhibitable::new(),
            senders: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            free_workers: Mutex::new(VecDeque::new()),
            next_worker_id: AtomicU64::new(1),
            worker_timeout,
            policy,
        })
    }

    pub fn state(&self) -> State {
        self.inhibit.state()
    }

    /// `inhibit(bucket)` (§4.5): block new RPC acceptance and wait for
    /// every in-flight one to leave.
    pub fn inhibit_bucket(&self) {
        self.inhibit.inhibit();
    }

    /// `resume(bucket)` (§4.5): lift inhibition, waking the manager and
    /// any waiters.
    pub fn resume_bucket(&self) {
        self.inhibit.resume();
    }

    /// Cancel the RPC in flight on behalf of `sender`, if any (§4.5
    /// Cancellation RPC). Returns whether there was one to cancel.
    pub fn cancel_sender(&self, sender: u64) -> bool {
        match self.in_flight.lock().unwrap().get(&sender) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The manager's accept step (§4.5): reject with `Busy` if `msg`'s
    /// sender already has an RPC in flight on this bucket, unless `msg`
    /// is itself a cancellation (those are always accepted). On
    /// acceptance, hand `body` to a worker and wait only for its
    /// accept/reject handshake — the body then runs concurrently with
    /// this call returning.
    pub fn dispatch(
        self: &Arc<Self>,
        msg: Message,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<Handshake, Error> {
        let sender = msg.sender_task_id;
        if !msg.is_cancel() {
            let mut senders = self.senders.lock().unwrap();
            if senders.contains(&sender) {
                return Err(Error::Busy);
            }
            senders.insert(sender);
        }

        let worker = self.acquire_worker();
        let (htx, hrx) = mpsc::channel();
        if worker
            .tx
            .send(WorkerMsg::Rpc { msg, body: Box::new(body), handshake: htx })
            .is_err()
        {
            self.senders.lock().unwrap().remove(&sender);
            return Err(Error::Canceled);
        }
        let handshake = hrx.recv().map_err(|_| Error::Canceled)?;
        if handshake == Handshake::Rejected {
            self.senders.lock().unwrap().remove(&sender);
        }
        Ok(handshake)
    }

    fn acquire_worker(self: &Arc<Self>) -> WorkerHandle {
        if let Some(w) = self.free_workers.lock().unwrap().pop_front() {
            return w;
        }
        match self.policy {
            WorkerAllocPolicy::Synchronous => self.spawn_worker(),
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        let bucket = Arc::clone(self);
        let self_tx = tx.clone();
        thread::Builder::new()
            .name(format!("rm-rpc-worker-{id}"))
            .spawn(move || worker_loop(bucket, rx, self_tx))
            .expect("spawn rm-rpc worker thread");
        WorkerHandle { tx }
    }

    /// `end(bucket)` (§4.5 Shutdown order): end inhibition (state ->
    /// black) and cancel every idle worker. Workers currently running a
    /// body finish on their own; they find no free slot to return to
    /// and simply exit.
    pub fn end(&self) {
        self.inhibit.end();
        for w in self.free_workers.lock().unwrap().drain(..) {
            let _ = w.tx.send(WorkerMsg::Shutdown);
        }
    }
}

fn worker_loop(bucket: Arc<Bucket>, rx: mpsc::Receiver<WorkerMsg>, self_tx: mpsc::Sender<WorkerMsg>) {
    loop {
        let msg = match rx.recv_timeout(bucket.worker_timeout) {
            Ok(m) => m,
            Err(_) => return, // idle past worker_timeout_sec, or shut down: exit
        };
        let WorkerMsg::Rpc { msg, body, handshake } = msg else { return };
        let sender = msg.sender_task_id;
        let is_cancel = msg.is_cancel();

        let token = if is_cancel { None } else { bucket.inhibit.enter() };
        if !is_cancel && token.is_none() {
            let _ = handshake.send(Handshake::Rejected);
            // "REJECTED allows the worker to loop back and become the
            // current worker again" (§4.5): return to the free pool
            // rather than waiting idle off of it.
            if bucket.state() != State::Black {
                bucket.free_workers.lock().unwrap().push_back(WorkerHandle { tx: self_tx.clone() });
            }
            continue;
        }
        let _ = handshake.send(Handshake::Accepted);
        if let Some(t) = &token {
            bucket.in_flight.lock().unwrap().insert(sender, t.clone());
        }

        body();

        if let Some(t) = &token {
            bucket.inhibit.leave(t);
            bucket.in_flight.lock().unwrap().remove(&sender);
        }
        bucket.senders.lock().unwrap().remove(&sender);

        if bucket.state() == State::Black {
            return;
        }
        bucket.free_workers.lock().unwrap().push_back(WorkerHandle { tx: self_tx.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_proto::Label;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn msg(label: Label, sender: u64) -> Message {
        Message::new(label, sender)
    }

    #[test]
    fn busy_sender_is_rejected_before_a_worker_ever_runs() {
        let bucket = Bucket::new(WorkerAllocPolicy::Synchronous, Duration::from_millis(200));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let b1 = Arc::clone(&bucket);
        let rx1 = Arc::clone(&release_rx);
        b1.dispatch(msg(Label::CapRead, 1), move || {
            let _ = rx1.lock().unwrap().recv();
        })
        .unwrap();

        let err = bucket.dispatch(msg(Label::CapRead, 1), || {}).unwrap_err();
        assert_eq!(err, Error::Busy);

        release_tx.send(()).unwrap();
    }

    #[test]
    fn worker_cap_at_most_one_concurrent_rpc_per_sender() {
        let bucket = Bucket::new(WorkerAllocPolicy::Synchronous, Duration::from_millis(200));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let b = Arc::clone(&bucket);
            let c = Arc::clone(&concurrent);
            let m = Arc::clone(&max_seen);
            handles.push(thread::spawn(move || {
                // All dispatches are attributed to the same sender, so
                // at most one should ever be running its body at once;
                // the rest observe Busy and simply stop.
                let _ = b.dispatch(msg(Label::CapRead, 42), move || {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    c.fetch_sub(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn cancel_rpc_bypasses_busy_and_cancels_target() {
        let bucket = Bucket::new(WorkerAllocPolicy::Synchronous, Duration::from_millis(200));
        let canceled = Arc::new(AtomicUsize::new(0));
        let (start_tx, start_rx) = mpsc::channel::<()>();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();

        let b1 = Arc::clone(&bucket);
        let target = thread::spawn(move || {
            b1.dispatch(msg(Label::ObjectStatus, 9), move || {
                start_tx.send(()).unwrap();
                let _ = finish_rx.recv();
            })
            .unwrap();
        });
        start_rx.recv().unwrap();

        // Even though sender 9 is busy, the cancel message (a distinct
        // sender on the wire, canceling 9's RPC) is always accepted.
        let h = bucket
            .dispatch(msg(Label::Cancel, 1), {
                let bucket = Arc::clone(&bucket);
                let canceled = Arc::clone(&canceled);
                move || {
                    if bucket.cancel_sender(9) {
                        canceled.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .unwrap();
        assert_eq!(h, Handshake::Accepted);
        assert_eq!(canceled.load(Ordering::SeqCst), 1);

        finish_tx.send(()).unwrap();
        target.join().unwrap();
    }
}
