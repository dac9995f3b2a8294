//! How a finished transfer gets back to whoever issued it.
//!
//! The interrupt bridge only ever calls [`Transfer::complete`]; the sink decides whether that
//! wakes a blocked caller, feeds a batch collector, runs a callback, or does nothing.

use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::rsc::error::RscError;
use crate::rsc::types::TcsRequest;

pub type TransferResult = Result<(), RscError>;

/// One-shot completion a synchronous caller blocks on.
#[derive(Debug, Default)]
pub struct Completion {
    result: Mutex<Option<TransferResult>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: TransferResult) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(result);
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Block until completed or `deadline` passes. `None` on timeout.
    pub fn wait_until(&self, deadline: Instant) -> Option<TransferResult> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransferResult> {
        self.wait_until(Instant::now() + timeout)
    }
}

/// Where the outcome of a transfer is delivered.
pub enum CompletionSink {
    /// Fire-and-forget.
    None,
    Waiter(Arc<Completion>),
    /// Tagged result for a collector waiting on several transfers.
    Channel {
        tag: usize,
        tx: Sender<(usize, TransferResult)>,
    },
    Callback(Box<dyn FnOnce(TransferResult) + Send>),
}

impl CompletionSink {
    pub fn signal(self, result: TransferResult) {
        match self {
            CompletionSink::None => {}
            CompletionSink::Waiter(completion) => completion.complete(result),
            CompletionSink::Channel { tag, tx } => {
                // collector may have given up already
                let _ = tx.send((tag, result));
            }
            CompletionSink::Callback(callback) => callback(result),
        }
    }
}

impl Debug for CompletionSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionSink::None => write!(f, "None"),
            CompletionSink::Waiter(c) => write!(f, "Waiter(done: {})", c.is_done()),
            CompletionSink::Channel { tag, .. } => write!(f, "Channel({})", tag),
            CompletionSink::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// A request as held by the scheduler while in flight.
#[derive(Debug, Clone)]
pub enum RequestRef {
    /// Handed over at submission; dropped once the transfer completes.
    Owned(Box<TcsRequest>),
    /// Still referenced by a caller that waits for the result.
    Shared(Arc<TcsRequest>),
}

impl Deref for RequestRef {
    type Target = TcsRequest;

    fn deref(&self) -> &TcsRequest {
        match self {
            RequestRef::Owned(req) => req,
            RequestRef::Shared(req) => req,
        }
    }
}

/// An in-flight request plus its completion sink.
#[derive(Debug)]
pub struct Transfer {
    pub msg: RequestRef,
    sink: CompletionSink,
}

impl Transfer {
    pub fn new(msg: RequestRef, sink: CompletionSink) -> Self {
        Self { msg, sink }
    }

    pub fn fire_and_forget(msg: TcsRequest) -> Self {
        Self::new(RequestRef::Owned(Box::new(msg)), CompletionSink::None)
    }

    pub fn waited(msg: Arc<TcsRequest>, completion: Arc<Completion>) -> Self {
        Self::new(RequestRef::Shared(msg), CompletionSink::Waiter(completion))
    }

    /// Deliver the result; an owned request is released here.
    pub fn complete(self, result: TransferResult) {
        self.sink.signal(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsc::types::RpmhState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn waiter_times_out_then_completes() {
        let completion = Completion::new();
        assert!(completion.wait_timeout(Duration::from_millis(5)).is_none());

        let remote = Arc::clone(&completion);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete(Ok(()));
        });
        assert_eq!(Some(Ok(())), completion.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn channel_sink_tags_results() {
        let (tx, rx) = mpsc::channel();
        let msg = TcsRequest::single(RpmhState::ActiveOnly, 0x100, 1);
        let transfer = Transfer::new(
            RequestRef::Owned(Box::new(msg)),
            CompletionSink::Channel { tag: 3, tx },
        );
        transfer.complete(Err(RscError::Busy));
        assert_eq!((3, Err(RscError::Busy)), rx.recv().unwrap());
    }

    #[test]
    fn channel_sink_survives_dropped_collector() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        CompletionSink::Channel { tag: 0, tx }.signal(Ok(()));
    }

    #[test]
    fn callback_runs_once() {
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        let sink = CompletionSink::Callback(Box::new(move |r| {
            assert!(r.is_ok());
            flag.store(true, Ordering::SeqCst);
        }));
        sink.signal(Ok(()));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn shared_request_outlives_transfer() {
        let msg = Arc::new(TcsRequest::single(RpmhState::ActiveOnly, 0x200, 2));
        let completion = Completion::new();
        let transfer = Transfer::waited(Arc::clone(&msg), Arc::clone(&completion));
        assert_eq!(2, Arc::strong_count(&msg));
        transfer.complete(Ok(()));
        assert_eq!(1, Arc::strong_count(&msg));
        assert!(completion.is_done());
    }
}
