//! §8 scenario 6 (*Inhibit/resume*), exercised through the public API.

use rm_proto::Label;
use rm_rpc::{Bucket, Handshake, State, WorkerAllocPolicy};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn msg(label: Label, sender: u64) -> rm_proto::Message {
    rm_proto::Message::new(label, sender)
}

#[test]
fn scenario_6_inhibit_resume() {
    let bucket = Bucket::new(WorkerAllocPolicy::Synchronous, Duration::from_millis(500));

    let (start_tx, start_rx) = mpsc::channel::<()>();
    let (finish_tx, finish_rx) = mpsc::channel::<()>();

    // A long RPC on object/sender 1 is in flight.
    let b1 = Arc::clone(&bucket);
    let long_rpc = thread::spawn(move || {
        b1.dispatch(msg(Label::CapRead, 1), move || {
            start_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
        })
        .unwrap()
    });
    start_rx.recv().unwrap();

    // A second thread inhibits the bucket; it blocks since the long
    // RPC is still in flight.
    let b2 = Arc::clone(&bucket);
    let inhibitor = thread::spawn(move || {
        b2.inhibit_bucket();
    });
    thread::sleep(Duration::from_millis(20));
    assert_eq!(bucket.state(), State::Yellow);

    // The first RPC completes, letting inhibit proceed to red.
    finish_tx.send(()).unwrap();
    assert_eq!(long_rpc.join().unwrap(), Handshake::Accepted);
    inhibitor.join().unwrap();
    assert_eq!(bucket.state(), State::Red);

    // A third thread's RPC blocks (is rejected by the worker, since the
    // bucket is inhibited) until resume() is called.
    let rejected = bucket.dispatch(msg(Label::CapRead, 2), || {}).unwrap();
    assert_eq!(rejected, Handshake::Rejected);

    bucket.resume_bucket();
    assert_eq!(bucket.state(), State::Green);
    let accepted = bucket.dispatch(msg(Label::CapRead, 2), || {}).unwrap();
    assert_eq!(accepted, Handshake::Accepted);
}
