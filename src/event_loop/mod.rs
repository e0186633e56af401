//! Single-threaded readiness-driven event loop.
//!
//! Each worker thread owns one loop. A turn performs, in order:
//!
//! 1. drain the thread's deferred-call queue to empty
//! 2. compute the nearest timer deadline
//! 3. poll fd readiness with that timeout
//! 4. fire expired timers in deadline order (ties by registration order)
//! 5. fire ready fds in registration order
//!
//! # Design Decisions
//! - A fixed registration budget is set at construction. Timers and fd
//!   registrations share it; exceeding it returns
//!   [`EventLoopError::RegistrationsExhausted`] and the caller backs off
//!   (e.g. refuses the connection).
//! - Timers are one-shot; periodic behavior re-registers from the
//!   callback.
//! - Readiness callbacks must consume until would-block; the poller is
//!   edge-driven underneath.
//! - Not `Send`: handles are per-thread by design. Cross-thread wakeup
//!   goes through the [`SetReadiness`] handle.

pub mod waker;

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use slab::Slab;

use crate::defer::DeferCall;
pub use mio::Interest;
pub use waker::{wake_pair, SetReadiness, WakeReceiver};

/// Timers a single proxy session may hold at once (request + response
/// transaction expiry/keep-alive pairs, inspect/accept deadline, retry).
pub const TIMERS_PER_SESSION: usize = 10;

/// Timers one bus route (socket set) may hold at once.
pub const TIMERS_PER_ZROUTE: usize = 10;

/// Socket notifiers one bus route may hold at once.
pub const SOCKET_NOTIFIERS_PER_ZROUTE: usize = 10;

/// Upper bound on concurrently configured bus routes.
pub const ZROUTES_MAX: usize = 100;

const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EventLoopError {
    /// The registration budget is spent; the caller must back off.
    #[error("registrations exhausted")]
    RegistrationsExhausted,

    /// The id does not name a live registration.
    #[error("unknown registration")]
    UnknownRegistration,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Readiness state delivered to fd callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    key: usize,
    seq: u64,
}

/// Handle to a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdId {
    key: usize,
    seq: u64,
}

struct TimerEntry {
    seq: u64,
    deadline: Instant,
    callback: Option<Box<dyn FnOnce()>>,
}

struct FdEntry {
    seq: u64,
    fd: RawFd,
    callback: Option<Box<dyn FnMut(Readiness)>>,
}

struct Inner {
    poll: Poll,
    budget: usize,
    timers: Slab<TimerEntry>,
    timer_heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    fds: Slab<FdEntry>,
    next_seq: u64,
    exit_code: Option<i32>,
}

impl Inner {
    fn used(&self) -> usize {
        // the waker's registration counts against the budget
        self.timers.len() + self.fds.len() + 1
    }
}

/// The event loop. Owns the poller; runs on the constructing thread.
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
    defer: DeferCall,
    set_readiness: SetReadiness,
    wake_rx: WakeReceiver,
}

/// Cloneable per-thread handle for registering timers and fds and for
/// requesting loop exit.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Rc<RefCell<Inner>>,
}

impl EventLoop {
    /// Create a loop with a registration budget. Installs the thread's
    /// deferred-call queue; wakes from other threads arrive through the
    /// returned loop's [`SetReadiness`] handle.
    pub fn new(registrations_max: usize) -> io::Result<EventLoop> {
        assert!(registrations_max >= 1, "budget must cover the waker");

        let poll = Poll::new()?;
        let (set_readiness, mut wake_rx) = wake_pair()?;

        poll.registry().register(
            &mut SourceFd(&std::os::fd::AsRawFd::as_raw_fd(&wake_rx.receiver)),
            WAKER_TOKEN,
            Interest::READABLE,
        )?;

        let wake = set_readiness.clone();
        let defer = DeferCall::install(Box::new(move || {
            let _ = wake.set(true);
        }));

        Ok(EventLoop {
            inner: Rc::new(RefCell::new(Inner {
                poll,
                budget: registrations_max,
                timers: Slab::new(),
                timer_heap: BinaryHeap::new(),
                fds: Slab::new(),
                next_seq: 0,
                exit_code: None,
            })),
            defer,
            set_readiness,
            wake_rx,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Cross-thread wake handle.
    pub fn set_readiness(&self) -> SetReadiness {
        self.set_readiness.clone()
    }

    /// Run until [`LoopHandle::exit`] is called; returns the exit code.
    pub fn exec(&mut self) -> i32 {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            self.defer.drain();

            if let Some(code) = self.inner.borrow().exit_code {
                return code;
            }

            let timeout = self.next_timeout();
            let polled = self.inner.borrow_mut().poll.poll(&mut events, timeout);
            match polled {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed; exiting loop");
                    return 1;
                }
            }

            self.fire_timers();
            self.fire_fds(&events);
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let mut inner = self.inner.borrow_mut();

        loop {
            let &Reverse((deadline, seq, key)) = inner.timer_heap.peek()?;

            // skip stale heap entries left by cancellation
            let live = inner.timers.get(key).map(|t| t.seq) == Some(seq);
            if !live {
                inner.timer_heap.pop();
                continue;
            }

            return Some(deadline.saturating_duration_since(Instant::now()));
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        loop {
            let callback = {
                let mut inner = self.inner.borrow_mut();

                let Some(&Reverse((deadline, seq, key))) = inner.timer_heap.peek() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                inner.timer_heap.pop();

                let live = inner.timers.get(key).map(|t| t.seq) == Some(seq);
                if !live {
                    continue;
                }

                inner.timers.remove(key).callback
            };

            // borrow released: the callback may register or cancel freely
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn fire_fds(&mut self, events: &Events) {
        let mut ready: Vec<(u64, usize, Readiness)> = Vec::new();

        {
            let mut inner = self.inner.borrow_mut();
            for event in events {
                if event.token() == WAKER_TOKEN {
                    self.wake_rx.drain();
                    continue;
                }

                let key = event.token().0;
                if let Some(entry) = inner.fds.get_mut(key) {
                    let readiness = Readiness {
                        readable: event.is_readable() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                    };
                    ready.push((entry.seq, key, readiness));
                }
            }
        }

        // deliver in registration order
        ready.sort_by_key(|&(seq, _, _)| seq);

        for (seq, key, readiness) in ready {
            // take the callback out so it can re-enter the loop handle
            let callback = {
                let mut inner = self.inner.borrow_mut();
                match inner.fds.get_mut(key) {
                    Some(entry) if entry.seq == seq => entry.callback.take(),
                    _ => None,
                }
            };

            let Some(mut callback) = callback else { continue };
            callback(readiness);

            // restore unless the callback unregistered itself
            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.fds.get_mut(key) {
                if entry.seq == seq && entry.callback.is_none() {
                    entry.callback = Some(callback);
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.defer.drain();
        DeferCall::uninstall();
    }
}

impl LoopHandle {
    /// Register a one-shot timer. The callback runs on the loop thread
    /// once `duration` has elapsed.
    pub fn register_timer<F: FnOnce() + 'static>(
        &self,
        duration: Duration,
        callback: F,
    ) -> Result<TimerId, EventLoopError> {
        let mut inner = self.inner.borrow_mut();

        if inner.used() >= inner.budget {
            return Err(EventLoopError::RegistrationsExhausted);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline = Instant::now() + duration;

        let key = inner.timers.insert(TimerEntry {
            seq,
            deadline,
            callback: Some(Box::new(callback)),
        });
        inner.timer_heap.push(Reverse((deadline, seq, key)));

        Ok(TimerId { key, seq })
    }

    /// Cancel a timer. Unknown or already-fired ids are errors.
    pub fn cancel_timer(&self, id: TimerId) -> Result<(), EventLoopError> {
        let mut inner = self.inner.borrow_mut();

        match inner.timers.get(id.key) {
            Some(entry) if entry.seq == id.seq => {
                inner.timers.remove(id.key);
                Ok(())
            }
            _ => Err(EventLoopError::UnknownRegistration),
        }
    }

    /// Register interest in fd readiness. The callback runs on the loop
    /// thread every time the fd becomes ready; it must consume until
    /// would-block.
    pub fn register_fd<F: FnMut(Readiness) + 'static>(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: F,
    ) -> Result<FdId, EventLoopError> {
        let mut inner = self.inner.borrow_mut();

        if inner.used() >= inner.budget {
            return Err(EventLoopError::RegistrationsExhausted);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let key = inner.fds.vacant_entry().key();

        inner
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(key), interest)?;

        inner.fds.insert(FdEntry {
            seq,
            fd,
            callback: Some(Box::new(callback)),
        });

        Ok(FdId { key, seq })
    }

    /// Change the interest set of a registered fd.
    pub fn modify_fd(&self, id: FdId, interest: Interest) -> Result<(), EventLoopError> {
        let inner = self.inner.borrow();

        let entry = match inner.fds.get(id.key) {
            Some(entry) if entry.seq == id.seq => entry,
            _ => return Err(EventLoopError::UnknownRegistration),
        };

        inner
            .poll
            .registry()
            .reregister(&mut SourceFd(&entry.fd), Token(id.key), interest)?;

        Ok(())
    }

    /// Remove an fd registration.
    pub fn unregister_fd(&self, id: FdId) -> Result<(), EventLoopError> {
        let mut inner = self.inner.borrow_mut();

        match inner.fds.get(id.key) {
            Some(entry) if entry.seq == id.seq => {
                let fd = entry.fd;
                let _ = inner.poll.registry().deregister(&mut SourceFd(&fd));
                inner.fds.remove(id.key);
                Ok(())
            }
            _ => Err(EventLoopError::UnknownRegistration),
        }
    }

    /// Ask the loop to return `code` from `exec` at the next turn
    /// boundary.
    pub fn exit(&self, code: i32) {
        self.inner.borrow_mut().exit_code = Some(code);
    }

    /// Live registrations, including the loop's own waker.
    pub fn registrations_used(&self) -> usize {
        self.inner.borrow().used()
    }

    /// Remaining registration headroom.
    pub fn registrations_available(&self) -> usize {
        let inner = self.inner.borrow();
        inner.budget.saturating_sub(inner.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_timer_fires_and_exits() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();

        let h = handle.clone();
        handle
            .register_timer(Duration::from_millis(10), move || h.exit(7))
            .unwrap();

        assert_eq!(el.exec(), 7);
    }

    #[test]
    fn test_timer_order_by_deadline() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();
        let seen = Rc::new(RefCell::new(Vec::new()));

        {
            let seen = seen.clone();
            handle
                .register_timer(Duration::from_millis(30), move || {
                    seen.borrow_mut().push("late")
                })
                .unwrap();
        }
        {
            let seen = seen.clone();
            let h = handle.clone();
            handle
                .register_timer(Duration::from_millis(10), move || {
                    seen.borrow_mut().push("early");
                    let seen = seen.clone();
                    let h2 = h.clone();
                    h.register_timer(Duration::from_millis(40), move || {
                        seen.borrow_mut().push("rearmed");
                        h2.exit(0);
                    })
                    .unwrap();
                })
                .unwrap();
        }

        assert_eq!(el.exec(), 0);
        assert_eq!(*seen.borrow(), vec!["early", "late", "rearmed"]);
    }

    #[test]
    fn test_cancel_timer() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();
        let fired = Rc::new(RefCell::new(false));

        let id = {
            let fired = fired.clone();
            handle
                .register_timer(Duration::from_millis(5), move || *fired.borrow_mut() = true)
                .unwrap()
        };
        handle.cancel_timer(id).unwrap();
        assert!(matches!(
            handle.cancel_timer(id),
            Err(EventLoopError::UnknownRegistration)
        ));

        let h = handle.clone();
        handle
            .register_timer(Duration::from_millis(20), move || h.exit(0))
            .unwrap();

        el.exec();
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_registration_budget() {
        // budget of 2: one for the waker, one for a timer
        let el = EventLoop::new(2).unwrap();
        let handle = el.handle();

        let _t = handle.register_timer(Duration::from_secs(60), || {}).unwrap();
        let err = handle.register_timer(Duration::from_secs(60), || {});
        assert!(matches!(err, Err(EventLoopError::RegistrationsExhausted)));
    }

    #[test]
    fn test_fd_readiness() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();

        let (mut tx, rx) = mio::unix::pipe::new().unwrap();
        tx.write_all(&[42]).unwrap();

        let h = handle.clone();
        let rx_fd = std::os::fd::AsRawFd::as_raw_fd(&rx);
        handle
            .register_fd(rx_fd, Interest::READABLE, move |readiness| {
                assert!(readiness.readable);
                h.exit(3);
            })
            .unwrap();

        assert_eq!(el.exec(), 3);
        drop(rx);
    }

    #[test]
    fn test_deferred_calls_run_before_poll() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();

        let dc = DeferCall::current();
        let h = handle.clone();
        dc.defer(move || h.exit(11));

        // a long timer must not delay the deferred exit
        handle
            .register_timer(Duration::from_secs(3600), || unreachable!())
            .unwrap();

        let start = Instant::now();
        assert_eq!(el.exec(), 11);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cross_thread_wake() {
        let mut el = EventLoop::new(10).unwrap();
        let handle = el.handle();
        let sr = el.set_readiness();
        let dc_handle = DeferCall::current().handle();

        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            dc_handle.defer(move || {});
            sr.set(true).unwrap();
        });

        let h = handle.clone();
        handle
            .register_timer(Duration::from_millis(200), move || h.exit(0))
            .unwrap();

        assert_eq!(el.exec(), 0);
        t.join().unwrap();
    }
}
