//! Subsystem wiring: bootstraps the activity/object/frame tables and
//! owns the ager thread (§4.4, §6 "launcher binary"). Grounded on
//! `bin/chainofcommand`'s role as the host-side process that owns
//! long-running worker threads around a core it doesn't itself
//! implement.

use crate::rpc::{Handlers, Reply};
use crate::sampler::NullSampler;
use rm_as::AddressSpace;
use rm_cap::{ActivityId, ActivityTable};
use rm_mm::{Ager, FrameTable, ObjectStore};
use rm_proto::{Error, Message};
use rm_rpc::{Bucket, Handshake, WorkerAllocPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// §4.4: "wakes every ≈125ms (8 Hz)".
const AGER_PERIOD: Duration = Duration::from_millis(125);

/// §4.5 Worker allocation policy: "idle longer than `worker_timeout_sec`
/// and not the current worker exits". No value is pinned by spec.md;
/// 30s matches the teacher's own `bin/chainofcommand` serial-link
/// idle timeouts.
const WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Every top-level piece of server state, plus the thread-safe handles
/// the ager and the RPC bucket need to share it.
pub struct Server {
    activities: Arc<Mutex<ActivityTable>>,
    frames: Arc<Mutex<FrameTable>>,
    store: Arc<Mutex<ObjectStore>>,
    address_space: Arc<Mutex<AddressSpace>>,
    root_activity: ActivityId,
    bucket: Arc<Bucket>,
    handlers: Arc<Handlers>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bootstrap the root activity and an otherwise empty object store
    /// and address space (§3 Activity: the root of the budget tree has
    /// no parent).
    pub fn bootstrap(root_budget: i64) -> Self {
        let mut activities = ActivityTable::new();
        let root_activity = activities.create(None, root_budget);

        let activities = Arc::new(Mutex::new(activities));
        let frames = Arc::new(Mutex::new(FrameTable::new()));
        let store = Arc::new(Mutex::new(ObjectStore::new()));
        let address_space = Arc::new(Mutex::new(AddressSpace::new()));
        let bucket = Bucket::new(WorkerAllocPolicy::Synchronous, WORKER_TIMEOUT);

        let handlers = Arc::new(Handlers::new(
            Arc::clone(&address_space),
            Arc::clone(&activities),
            Arc::clone(&frames),
            Arc::clone(&store),
            Arc::clone(&bucket),
            root_activity,
        ));

        Server {
            activities,
            frames,
            store,
            address_space,
            root_activity,
            bucket,
            handlers,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root_activity(&self) -> ActivityId {
        self.root_activity
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    pub fn address_space(&self) -> &Arc<Mutex<AddressSpace>> {
        &self.address_space
    }

    /// Run one RPC end to end (§6): accept `msg` through the bucket's
    /// manager/worker handshake, run the matching handler on the worker
    /// thread, and block for its reply. A `Rejected` handshake means
    /// the bucket was inhibited out from under the worker (§4.5); that
    /// is reported to the caller the same way the worker reports it to
    /// its client — as `CANCELED`.
    pub fn handle(&self, msg: Message) -> Result<Reply, Error> {
        let (tx, rx) = mpsc::channel();
        let handlers = Arc::clone(&self.handlers);
        let body_msg = msg.clone();
        let handshake = self.bucket.dispatch(msg, move || {
            let reply = handlers.handle(&body_msg);
            let _ = tx.send(reply);
        })?;
        match handshake {
            Handshake::Accepted => rx.recv().map_err(|_| Error::Canceled)?,
            Handshake::Rejected => Err(Error::Canceled),
        }
    }

    /// Spawn the ager thread (§4.4): a periodic sweep over the shared
    /// activity/frame/store state, using a placeholder access sampler
    /// until a real kernel binding is wired in.
    pub fn spawn_ager(&self) -> JoinHandle<()> {
        let activities = Arc::clone(&self.activities);
        let frames = Arc::clone(&self.frames);
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);

        thread::Builder::new()
            .name("rm-ager".into())
            .spawn(move || {
                let mut ager = Ager::default();
                let mut sampler = NullSampler;
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(AGER_PERIOD);
                    let mut activities = activities.lock().unwrap();
                    let mut frames = frames.lock().unwrap();
                    let mut store = store.lock().unwrap();
                    ager.sweep(&mut activities, &mut frames, &mut store, &mut sampler);
                }
            })
            .expect("spawn rm-server ager thread")
    }

    /// Shut every owned subsystem down: stop the ager loop and end the
    /// RPC bucket (§4.5 Shutdown order).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.bucket.end();
    }
}
