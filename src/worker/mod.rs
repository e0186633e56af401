//! Worker supervisor.
//!
//! Spawns N worker threads, each owning its own event loop, deferred
//! call queue, bus context, and engine. Startup is barriered: the
//! supervisor waits for each worker to report started or failed before
//! spawning the next. Control flows one way: the supervisor posts
//! deferred calls onto worker queues; workers never call back.
//!
//! # Design Decisions
//! - Worker registration budget follows the session budget:
//!   `sessions_max * TIMERS_PER_SESSION + route and socket overhead`
//! - Stop is cooperative: a deferred call shuts the engine down and
//!   exits the loop; join afterwards
//! - A worker that fails startup aborts the process after best-effort
//!   shutdown of the workers already running

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::defer::{DeferCall, DeferHandle};
use crate::engine::{Engine, EngineConfig};
use crate::event_loop::{
    EventLoop, LoopHandle, SOCKET_NOTIFIERS_PER_ZROUTE, TIMERS_PER_SESSION, TIMERS_PER_ZROUTE,
    ZROUTES_MAX,
};
use crate::routing::DomainMap;

/// Per-worker registration budget.
pub fn worker_registrations_max(sessions_max: usize) -> usize {
    let timers_max = sessions_max * TIMERS_PER_SESSION + ZROUTES_MAX * TIMERS_PER_ZROUTE + 100;
    let socket_notifiers_max = SOCKET_NOTIFIERS_PER_ZROUTE * ZROUTES_MAX + 100;
    timers_max + socket_notifiers_max
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker {0} failed to start: {1}")]
    WorkerStart(usize, String),

    #[error("worker thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

thread_local! {
    static WORKER_CONTROL: RefCell<Option<WorkerControl>> = const { RefCell::new(None) };
}

struct WorkerControl {
    engine: Rc<RefCell<Engine>>,
    handle: LoopHandle,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
    defer: DeferHandle,
}

/// Owns the worker threads for the process lifetime.
pub struct Supervisor {
    workers: Vec<Worker>,
}

impl Supervisor {
    /// Spawn `count` workers from the base engine config. Waits for each
    /// to signal readiness; any failure stops the workers already
    /// running and returns an error.
    pub fn start(
        base: &EngineConfig,
        count: usize,
        domain_map: Arc<DomainMap>,
    ) -> Result<Supervisor, SupervisorError> {
        let mut supervisor = Supervisor {
            workers: Vec::with_capacity(count),
        };

        for n in 0..count {
            let config = base.for_worker(n, count);
            let map = Arc::clone(&domain_map);
            let (ready_tx, ready_rx) = mpsc::channel::<Result<DeferHandle, String>>();

            let thread = std::thread::Builder::new()
                .name(format!("proxy-worker-{}", n))
                .spawn(move || worker_run(config, map, ready_tx))?;

            match ready_rx.recv() {
                Ok(Ok(defer)) => {
                    tracing::debug!(worker = n, "started");
                    supervisor.workers.push(Worker {
                        id: n,
                        thread: Some(thread),
                        defer,
                    });
                }
                Ok(Err(message)) => {
                    let _ = thread.join();
                    supervisor.stop();
                    return Err(SupervisorError::WorkerStart(n, message));
                }
                Err(_) => {
                    let _ = thread.join();
                    supervisor.stop();
                    return Err(SupervisorError::WorkerStart(
                        n,
                        "worker exited before signaling readiness".to_string(),
                    ));
                }
            }
        }

        Ok(supervisor)
    }

    /// Broadcast a routes change: each worker re-reads the shared map on
    /// its own thread.
    pub fn routes_changed(&self) {
        for worker in &self.workers {
            worker.defer.defer(|| {
                WORKER_CONTROL.with(|control| {
                    if let Some(control) = control.borrow().as_ref() {
                        control.engine.borrow_mut().routes_changed();
                    }
                });
            });
        }
    }

    /// A thread-safe closure that broadcasts a routes change; suitable
    /// for registering as a domain-map observer.
    pub fn change_broadcaster(&self) -> Box<dyn Fn() + Send + Sync> {
        let handles: Vec<DeferHandle> = self.workers.iter().map(|w| w.defer.clone()).collect();

        Box::new(move || {
            for handle in &handles {
                handle.defer(|| {
                    WORKER_CONTROL.with(|control| {
                        if let Some(control) = control.borrow().as_ref() {
                            control.engine.borrow_mut().routes_changed();
                        }
                    });
                });
            }
        })
    }

    /// Stop every worker: post the stop call, then join.
    pub fn stop(&mut self) {
        for worker in &self.workers {
            tracing::debug!(worker = worker.id, "stopping");
            worker.defer.defer(|| {
                WORKER_CONTROL.with(|control| {
                    if let Some(control) = control.borrow_mut().take() {
                        control.engine.borrow_mut().shutdown();
                        control.handle.exit(0);
                    }
                });
            });
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
            tracing::debug!(worker = worker.id, "stopped");
        }

        self.workers.clear();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_run(
    config: EngineConfig,
    domain_map: Arc<DomainMap>,
    ready_tx: mpsc::Sender<Result<DeferHandle, String>>,
) {
    let worker_id = config.id;
    let registrations_max = worker_registrations_max(config.sessions_max);

    let mut event_loop = match EventLoop::new(registrations_max) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("event loop: {}", e)));
            return;
        }
    };

    tracing::debug!(worker = worker_id, registrations_max, "worker loop ready");

    let ctx = zmq::Context::new();
    let engine = match Engine::start(config, domain_map, &ctx, event_loop.handle()) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("engine: {}", e)));
            return;
        }
    };

    WORKER_CONTROL.with(|control| {
        *control.borrow_mut() = Some(WorkerControl {
            engine: Rc::clone(&engine),
            handle: event_loop.handle(),
        });
    });

    if ready_tx.send(Ok(DeferCall::current().handle())).is_err() {
        return;
    }

    event_loop.exec();

    // engine is shut down by the stop call; drop the last references
    // here, on the owning thread
    WORKER_CONTROL.with(|control| control.borrow_mut().take());
    drop(engine);

    tracing::debug!(worker = worker_id, "worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_budget_formula() {
        // sessions_max of 100: 100*10 timers + route overhead + misc
        let budget = worker_registrations_max(100);
        assert_eq!(budget, (100 * 10 + 100 * 10 + 100) + (10 * 100 + 100));
    }
}
