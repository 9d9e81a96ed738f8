//! The `green → yellow → red → green` inhibition state machine shared
//! by buckets, classes, clients and objects (§4.5 Inhibition), grounded
//! on `libhurd-cap-server/bucket-inhibit.c` and `class-inhibit.c` (the
//! bucket/class/client/object variants differ only in which condition
//! wakes the "last RPC out" transition, not in the state machine
//! itself, so one generic type serves all four).

use crate::cancel::CancelToken;
use std::sync::{Condvar, Mutex};

/// `black` only ever applies to a bucket (§4.5); class/client/object
/// inhibitables simply never reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Green,
    Yellow,
    Red,
    Black,
}

struct Inner {
    state: State,
    pending: Vec<CancelToken>,
}

/// One instance per bucket, per class, per client, or per object (§4.5).
pub struct Inhibitable {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for Inhibitable {
    fn default() -> Self {
        Inhibitable {
            inner: Mutex::new(Inner { state: State::Green, pending: Vec::new() }),
            cond: Condvar::new(),
        }
    }
}

impl Inhibitable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Register a new in-flight RPC, unless this is inhibited or
    /// already ended — mirrors the worker acceptance handshake's
    /// `REJECTED` case ("bucket is inhibited and message is a
    /// non-cancel", §4.5).
    pub fn enter(&self) -> Option<CancelToken> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Green {
            return None;
        }
        let token = CancelToken::new();
        inner.pending.push(token.clone());
        Some(token)
    }

    /// An RPC admitted by [`Self::enter`] has completed. If this is the
    /// last pending RPC during an inhibit's `yellow` window, transition
    /// to `red` and wake the inhibitor.
    pub fn leave(&self, token: &CancelToken) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|t| t != token);
        if inner.state == State::Yellow && inner.pending.is_empty() {
            inner.state = State::Red;
            self.cond.notify_all();
        }
    }

    /// `inhibit(X)` (§4.5): wait until green, set yellow, cancel every
    /// pending RPC, wait until the last one has left (red), return.
    /// Serialized per-instance: a second concurrent caller blocks here
    /// until an intervening [`Self::resume`] brings the state back to
    /// green (§8 "Bucket inhibit serialization").
    pub fn inhibit(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.state != State::Green {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.pending.is_empty() {
            inner.state = State::Red;
            return;
        }
        inner.state = State::Yellow;
        for token in &inner.pending {
            token.cancel();
        }
        let _guard = self
            .cond
            .wait_while(inner, |i| i.state != State::Red)
            .unwrap();
    }

    /// `resume(X)`: state ← green, broadcast.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Green;
        self.cond.notify_all();
    }

    /// `end(bucket)`: state ← black, wake the manager and all waiters.
    /// Only meaningful on a bucket's own `Inhibitable`.
    pub fn end(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Black;
        self.cond.notify_all();
    }
}
