//! Deferred-call scheduler.
//!
//! Queues closures to run after returning to the event loop. Each thread
//! that runs an event loop owns one `DeferCall`; the loop drains it at the
//! end of every turn, in FIFO order, before polling for new I/O. Closures
//! enqueued while draining run in the same turn.
//!
//! # Design Decisions
//! - Two queues: a local one for same-thread closures (may capture `Rc`
//!   state) and a shared one for cross-thread posts (`Send` closures).
//! - Cross-thread posting wakes the owning loop through its readiness
//!   handle, so a sleeping worker picks the call up immediately.
//! - A process-wide registry maps thread id → handle, so the supervisor
//!   can post to a worker knowing only its thread id.
//! - A panicking closure is logged and the next one runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

type LocalCall = Box<dyn FnOnce()>;
type RemoteCall = Box<dyn FnOnce() + Send>;

fn registry() -> &'static DashMap<ThreadId, DeferHandle> {
    static REGISTRY: OnceLock<DashMap<ThreadId, DeferHandle>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

thread_local! {
    static CURRENT: RefCell<Option<DeferCall>> = const { RefCell::new(None) };
}

struct Shared {
    calls: Mutex<VecDeque<RemoteCall>>,
    wake: Box<dyn Fn() + Send + Sync>,
}

/// The per-thread deferred-call queue. Cloning shares the queue.
#[derive(Clone)]
pub struct DeferCall {
    local: Rc<RefCell<VecDeque<LocalCall>>>,
    shared: Arc<Shared>,
}

impl DeferCall {
    /// Create the queue for the current thread and make it available via
    /// [`DeferCall::current`] and the cross-thread registry. `wake` is
    /// invoked on cross-thread posts and must be safe from any thread.
    ///
    /// Called by the event loop during construction; at most one queue per
    /// thread may be installed at a time.
    pub fn install(wake: Box<dyn Fn() + Send + Sync>) -> DeferCall {
        let dc = DeferCall {
            local: Rc::new(RefCell::new(VecDeque::new())),
            shared: Arc::new(Shared {
                calls: Mutex::new(VecDeque::new()),
                wake,
            }),
        };

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(current.is_none(), "DeferCall already installed on this thread");
            *current = Some(dc.clone());
        });

        registry().insert(thread::current().id(), dc.handle());

        dc
    }

    /// Remove the current thread's queue. Pending calls are dropped
    /// without running; the loop drains before calling this.
    pub fn uninstall() {
        registry().remove(&thread::current().id());
        CURRENT.with(|current| current.borrow_mut().take());
    }

    /// The current thread's queue. Panics if no event loop is installed.
    pub fn current() -> DeferCall {
        CURRENT.with(|current| {
            current
                .borrow()
                .clone()
                .expect("no DeferCall installed on this thread")
        })
    }

    /// Look up the handle for another thread's queue.
    pub fn handle_for(thread_id: ThreadId) -> Option<DeferHandle> {
        registry().get(&thread_id).map(|h| h.clone())
    }

    /// Queue `handler` to run after returning to the event loop. If the
    /// handler captures references they must outlive this queue; the
    /// recommended usage is to capture only owned or `Rc` data.
    pub fn defer<F: FnOnce() + 'static>(&self, handler: F) {
        self.local.borrow_mut().push_back(Box::new(handler));
    }

    /// Defer destruction of `obj` until the loop turn ends.
    pub fn delete_later<T: 'static>(&self, obj: T) {
        self.defer(move || drop(obj));
    }

    /// Number of calls waiting to run.
    pub fn pending_count(&self) -> usize {
        self.local.borrow().len() + self.shared.calls.lock().unwrap().len()
    }

    /// A cloneable, `Send` handle for posting from other threads.
    pub fn handle(&self) -> DeferHandle {
        DeferHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run queued calls until both queues are empty. Calls enqueued by the
    /// running calls are executed in the same drain. Returns the number of
    /// calls run.
    pub fn drain(&self) -> usize {
        let mut ran = 0;

        loop {
            let call: Option<LocalCall> = self.local.borrow_mut().pop_front();
            if let Some(call) = call {
                run_one(call);
                ran += 1;
                continue;
            }

            let call: Option<RemoteCall> = self.shared.calls.lock().unwrap().pop_front();
            match call {
                Some(call) => {
                    run_one(call);
                    ran += 1;
                }
                None => break,
            }
        }

        ran
    }
}

fn run_one<F: FnOnce()>(call: F) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::error!("deferred call panicked; continuing with next");
    }
}

/// Cross-thread handle to a [`DeferCall`] queue. Posting wakes the owning
/// thread's event loop.
#[derive(Clone)]
pub struct DeferHandle {
    shared: Arc<Shared>,
}

impl DeferHandle {
    /// Queue `handler` to run on the owning thread's next loop turn.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, handler: F) {
        self.shared.calls.lock().unwrap().push_back(Box::new(handler));
        (self.shared.wake)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_queue() -> DeferCall {
        DeferCall {
            local: Rc::new(RefCell::new(VecDeque::new())),
            shared: Arc::new(Shared {
                calls: Mutex::new(VecDeque::new()),
                wake: Box::new(|| {}),
            }),
        }
    }

    #[test]
    fn test_fifo_order() {
        let dc = test_queue();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            dc.defer(move || seen.borrow_mut().push(i));
        }

        assert_eq!(dc.pending_count(), 3);
        assert_eq!(dc.drain(), 3);
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
        assert_eq!(dc.pending_count(), 0);
    }

    #[test]
    fn test_nested_defer_runs_same_drain() {
        let dc = test_queue();
        let seen = Rc::new(RefCell::new(Vec::new()));

        {
            let dc2 = dc.clone();
            let seen = seen.clone();
            dc.defer(move || {
                seen.borrow_mut().push("outer");
                let seen = seen.clone();
                dc2.defer(move || seen.borrow_mut().push("inner"));
            });
        }

        assert_eq!(dc.drain(), 2);
        assert_eq!(*seen.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_cross_thread_post_and_wake() {
        let woken = Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        let dc = DeferCall {
            local: Rc::new(RefCell::new(VecDeque::new())),
            shared: Arc::new(Shared {
                calls: Mutex::new(VecDeque::new()),
                wake: Box::new(move || {
                    w.fetch_add(1, Ordering::SeqCst);
                }),
            }),
        };

        let ran = Arc::new(AtomicUsize::new(0));
        let handle = dc.handle();
        let r = ran.clone();
        let t = thread::spawn(move || {
            handle.defer(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        });
        t.join().unwrap();

        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(dc.drain(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_call_does_not_stop_drain() {
        let dc = test_queue();
        let seen = Rc::new(RefCell::new(0));

        dc.defer(|| panic!("boom"));
        {
            let seen = seen.clone();
            dc.defer(move || *seen.borrow_mut() += 1);
        }

        assert_eq!(dc.drain(), 2);
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_delete_later() {
        struct Tracker(Rc<RefCell<bool>>);
        impl Drop for Tracker {
            fn drop(&mut self) {
                *self.0.borrow_mut() = true;
            }
        }

        let dc = test_queue();
        let dropped = Rc::new(RefCell::new(false));
        dc.delete_later(Tracker(dropped.clone()));

        assert!(!*dropped.borrow());
        dc.drain();
        assert!(*dropped.borrow());
    }
}
