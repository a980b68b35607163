use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, ModuleLoadError, Reason};
use crate::event_loop::run_worker;
use crate::ids::WorkerId;
use crate::module::{Module, ModuleRegistry};
use crate::observability::WorkerCounts;
use crate::worker::{WeakWorker, Worker, WorkerShared, WorkerState};

struct WorkerEntry {
    worker: WeakWorker,
    thread: Option<JoinHandle<()>>,
}

struct RuntimeInner {
    registry: Arc<ModuleRegistry>,
    config: RuntimeConfig,
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    next_thread: AtomicUsize,
}

/// Worker registry: spawns workers from modules and tracks them until they are joined.
///
/// Cloning is cheap and clones share the same registry. The runtime only keeps weak
/// references, so it never keeps a worker alive by itself.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Runtime with the default [`RuntimeConfig`].
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self::from_parts(registry, RuntimeConfig::default())
    }

    /// Runtime with an explicit config, validated first.
    pub fn with_config(
        registry: Arc<ModuleRegistry>,
        config: RuntimeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(registry, config))
    }

    fn from_parts(registry: Arc<ModuleRegistry>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                registry,
                config,
                workers: Mutex::new(HashMap::new()),
                next_thread: AtomicUsize::new(0),
            }),
        }
    }

    /// Modules that [`Runtime::spawn`] can look up by name.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerEntry>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a worker running the registered module `name`.
    pub fn spawn(&self, name: &str) -> Result<Worker, ModuleLoadError> {
        let module = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| ModuleLoadError::NotFound(name.to_string()))?;
        self.spawn_module(module)
    }

    /// Spawns a worker running `module`, registered or not.
    ///
    /// Blocks until the module's `init` has returned on the new thread (or the configured
    /// init timeout elapses). On failure no live worker remains.
    ///
    /// # 実装
    /// 1. thread を起動する前に handle を作る（loop が handles == 0 を見ないように）
    /// 2. `<prefix>-<n>` の名前で thread を起動
    /// 3. sync_channel で init の結果を待つ（timeout 付きなら recv_timeout）
    /// 4. 失敗なら thread を join して `ModuleLoadError`
    /// 5. 成功なら table に登録し、終了済みの thread を回収する
    pub fn spawn_module(&self, module: Arc<dyn Module>) -> Result<Worker, ModuleLoadError> {
        let name = module.name().to_string();
        let id = WorkerId::generate();
        let shared = Arc::new(WorkerShared::new(id, name.clone()));
        // Counted before the thread starts so the new loop never sees zero handles early.
        let worker = Worker::from_shared(Arc::clone(&shared));

        let n = self.inner.next_thread.fetch_add(1, Ordering::SeqCst);
        let mut builder =
            thread::Builder::new().name(format!("{}-{n}", self.inner.config.thread_name_prefix));
        if let Some(size) = self.inner.config.stack_size {
            builder = builder.stack_size(size);
        }

        let (init_tx, init_rx) = mpsc::sync_channel::<Result<(), Reason>>(1);
        let runtime = self.clone();
        let thread = builder
            .spawn(move || run_worker(shared, runtime, module, init_tx))
            .map_err(|source| ModuleLoadError::Thread {
                module: name.clone(),
                source,
            })?;

        let outcome = match self.inner.config.init_timeout() {
            Some(timeout) => match init_rx.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(worker_id = %id, module = %name, ?timeout, "Module init timed out, abandoning worker.");
                    // The thread finishes init on its own, sees nobody waiting, and exits.
                    worker.terminate();
                    return Err(ModuleLoadError::InitTimeout {
                        module: name,
                        timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => Err(lost_thread()),
            },
            None => init_rx.recv().unwrap_or_else(|_| Err(lost_thread())),
        };

        if let Err(reason) = outcome {
            if thread.join().is_err() {
                debug!(worker_id = %id, "Worker thread panicked outside the event loop.");
            }
            return Err(ModuleLoadError::Init {
                module: name,
                reason,
            });
        }

        let mut table = self.table();
        reap_finished(&mut table);
        table.insert(
            id,
            WorkerEntry {
                worker: worker.downgrade(),
                thread: Some(thread),
            },
        );
        drop(table);

        debug!(worker_id = %id, module = %name, "Worker spawned.");
        Ok(worker)
    }

    /// [`Worker::post_message`] with no source.
    pub fn post_message(&self, worker: &Worker, data: serde_json::Value) {
        worker.post_message(data);
    }

    /// [`Worker::post_error`] with no source.
    pub fn post_error(&self, worker: &Worker, data: serde_json::Value) {
        worker.post_error(data);
    }

    /// [`Worker::terminate`].
    pub fn terminate(&self, worker: &Worker) {
        worker.terminate();
    }

    /// Handles to every worker that has not terminated yet.
    pub fn workers(&self) -> Vec<Worker> {
        self.table()
            .values()
            .filter_map(|entry| entry.worker.upgrade())
            .collect()
    }

    /// Handle to a tracked worker that has not terminated.
    pub fn get(&self, id: WorkerId) -> Option<Worker> {
        self.table().get(&id).and_then(|entry| entry.worker.upgrade())
    }

    /// Tracked workers by state. Terminated workers count until they are reaped by the
    /// next spawn or by [`Runtime::shutdown_and_join`].
    pub fn counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::default();
        for entry in self.table().values() {
            match entry.worker.state() {
                WorkerState::Starting => counts.starting += 1,
                WorkerState::Running => counts.running += 1,
                WorkerState::Terminated => counts.terminated += 1,
            }
        }
        counts
    }

    /// Terminates every tracked worker and joins their threads.
    ///
    /// Safe to call from a worker thread; that worker's own thread is not joined.
    pub fn shutdown_and_join(&self) {
        let entries: Vec<(WorkerId, WorkerEntry)> = self.table().drain().collect();
        info!(workers = entries.len(), "Shutting down runtime.");

        for (_, entry) in &entries {
            if let Some(worker) = entry.worker.upgrade() {
                worker.terminate();
            }
        }

        let me = thread::current().id();
        for (id, entry) in entries {
            let Some(thread) = entry.thread else {
                continue;
            };
            if thread.thread().id() == me {
                continue;
            }
            if thread.join().is_err() {
                warn!(worker_id = %id, "Worker thread panicked.");
            }
        }
    }
}

fn lost_thread() -> Reason {
    Reason::String("worker thread exited during initialization".to_string())
}

/// Joins threads whose event loop has already returned.
fn reap_finished(table: &mut HashMap<WorkerId, WorkerEntry>) {
    table.retain(|id, entry| {
        let finished = entry
            .thread
            .as_ref()
            .is_none_or(|thread| thread.is_finished());
        if finished {
            if let Some(thread) = entry.thread.take()
                && thread.join().is_err()
            {
                warn!(worker_id = %id, "Worker thread panicked.");
            }
            return false;
        }
        true
    });
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.inner.registry.names())
            .field("workers", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TimerId;
    use crate::module::module_fn;
    use crate::promise::{Deferred, Next};
    use crate::semaphore::Semaphore;
    use serde_json::{Value, json};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    /// Collects values pushed from worker threads.
    #[derive(Clone, Default)]
    struct Collector {
        values: Arc<Mutex<Vec<Value>>>,
        pushed: Semaphore,
    }

    impl Collector {
        fn push(&self, value: Value) {
            self.values.lock().unwrap().push(value);
            self.pushed.signal_one();
        }

        /// Blocks until `n` more values have arrived, then returns everything so far.
        fn wait_for(&self, n: usize) -> Vec<Value> {
            assert!(self.pushed.try_wait(WAIT, n), "timed out waiting for {n} values");
            self.snapshot()
        }

        fn snapshot(&self) -> Vec<Value> {
            self.values.lock().unwrap().clone()
        }
    }

    fn runtime_with(modules: Vec<Arc<dyn Module>>) -> Runtime {
        let mut registry = ModuleRegistry::new();
        for module in modules {
            registry.register(module).unwrap();
        }
        Runtime::new(Arc::new(registry))
    }

    /// A module whose onmessage pushes every payload.
    fn sink(name: &str, out: &Collector) -> Arc<dyn Module> {
        let out = out.clone();
        module_fn(name, move |scope| {
            let out = out.clone();
            scope.set_onmessage(move |_, event| {
                out.push(event.data);
                Ok(())
            });
            Ok(())
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn messages_from_one_sender_arrive_in_order() {
        let out = Collector::default();
        let rt = runtime_with(vec![sink("sink", &out)]);
        let worker = rt.spawn("sink").unwrap();

        for i in 0..100 {
            worker.post_message(json!(i));
        }

        let expected: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        assert_eq!(out.wait_for(100), expected);
        rt.shutdown_and_join();
    }

    #[test]
    fn unknown_module_is_not_found() {
        let rt = runtime_with(Vec::new());
        let err = rt.spawn("missing").unwrap_err();
        assert!(matches!(err, ModuleLoadError::NotFound(name) if name == "missing"));
    }

    #[test]
    fn failing_init_leaves_no_live_worker() {
        let rt = runtime_with(vec![module_fn("broken", |_scope| Err(json!("no config")))]);

        let err = rt.spawn("broken").unwrap_err();
        assert!(
            matches!(err, ModuleLoadError::Init { ref module, ref reason } if module == "broken" && *reason == json!("no config"))
        );
        assert_eq!(rt.counts().live(), 0);
        assert!(rt.workers().is_empty());
    }

    #[test]
    fn panicking_init_is_a_load_error() {
        let rt = runtime_with(vec![module_fn(
            "exploding",
            |_scope| -> Result<(), Reason> { panic!("init exploded") },
        )]);

        let err = rt.spawn("exploding").unwrap_err();
        assert!(
            matches!(err, ModuleLoadError::Init { ref reason, .. } if *reason == json!("panic: init exploded"))
        );
        assert_eq!(rt.counts().live(), 0);
    }

    #[test]
    fn slow_init_times_out() {
        let registry = ModuleRegistry::new()
            .with(module_fn("slow", |_scope| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }))
            .unwrap();
        let config = RuntimeConfig {
            init_timeout_ms: Some(30),
            ..RuntimeConfig::default()
        };
        let rt = Runtime::with_config(Arc::new(registry), config).unwrap();

        let err = rt.spawn("slow").unwrap_err();
        assert!(matches!(err, ModuleLoadError::InitTimeout { ref module, .. } if module == "slow"));
        assert_eq!(rt.counts().live(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RuntimeConfig {
            thread_name_prefix: String::new(),
            ..RuntimeConfig::default()
        };
        let result = Runtime::with_config(Arc::new(ModuleRegistry::new()), config);
        assert!(matches!(result, Err(ConfigError::Invalid { field: "thread_name_prefix", .. })));
    }

    /// "pong" answers PING and fails on THROW; its onerror reports what it caught.
    fn pong(out: &Collector) -> Arc<dyn Module> {
        let out = out.clone();
        module_fn("pong", move |scope| {
            scope.set_onmessage(|_, event| {
                match event.data.as_str() {
                    Some("PING") => {
                        if let Some(sender) = event.source.and_then(|s| s.upgrade()) {
                            sender.post_message(json!("PONG"));
                        }
                    }
                    Some("THROW") => return Err(json!("B failed")),
                    _ => {}
                }
                Ok(())
            });
            let out = out.clone();
            scope.set_onerror(move |_, event| {
                out.push(json!({
                    "b_error": event.data,
                    "has_source": event.source.is_some(),
                }));
                Ok(())
            });
            Ok(())
        })
    }

    /// "ping" spawns its own pong, plays ten rounds, then makes pong throw.
    fn ping(out: &Collector) -> Arc<dyn Module> {
        let out = out.clone();
        module_fn("ping", move |scope| {
            let partner = scope
                .spawn("pong")
                .map_err(|e| json!(e.to_string()))?;
            let mut rounds = 0;
            let messages = out.clone();
            scope.set_onmessage(move |_, event| {
                match event.data.as_str() {
                    Some("START") => partner.post_message(json!("PING")),
                    Some("PONG") => {
                        rounds += 1;
                        messages.push(json!({ "pong": rounds }));
                        if rounds < 10 {
                            partner.post_message(json!("PING"));
                        } else {
                            partner.post_message(json!("THROW"));
                        }
                    }
                    Some("STATUS") => messages.push(json!("alive")),
                    _ => {}
                }
                Ok(())
            });
            let errors = out.clone();
            scope.set_onerror(move |_, event| {
                errors.push(json!({ "a_error": event.data }));
                Ok(())
            });
            Ok(())
        })
    }

    #[test]
    fn ping_pong_then_error_stays_inside_the_failing_worker() {
        let out = Collector::default();
        let rt = runtime_with(vec![ping(&out), pong(&out)]);
        let a = rt.spawn("ping").unwrap();
        assert_eq!(rt.counts().running, 2);

        a.post_message(json!("START"));
        let events = out.wait_for(11);

        let pongs: Vec<Value> = (1..=10).map(|n| json!({ "pong": n })).collect();
        assert_eq!(events[..10], pongs[..]);
        assert_eq!(events[10], json!({ "b_error": "B failed", "has_source": false }));

        // A keeps working after B's failure
        a.post_message(json!("STATUS"));
        let events = out.wait_for(1);
        assert_eq!(events.last(), Some(&json!("alive")));
        assert!(!events.iter().any(|e| e.get("a_error").is_some()));

        rt.shutdown_and_join();
    }

    #[test]
    fn fan_out_workers_keep_their_own_state() {
        let out = Collector::default();
        let echo = module_fn("echo", |scope| {
            let mut seen = 0;
            let me = scope.id().to_string();
            scope.set_onmessage(move |_, event| {
                seen += 1;
                if let Some(sender) = event.source.and_then(|s| s.upgrade()) {
                    sender.post_message(json!({ "i": event.data, "seen": seen, "worker": me }));
                }
                Ok(())
            });
            Ok(())
        });
        let hub = {
            let out = out.clone();
            module_fn("hub", move |scope| {
                for i in 0..8 {
                    let echo = scope.spawn("echo").map_err(|e| json!(e.to_string()))?;
                    echo.post_message(json!(i));
                }
                let out = out.clone();
                scope.set_onmessage(move |_, event| {
                    let source = event.source.map(|s| s.id().to_string());
                    out.push(json!({ "reply": event.data, "source": source }));
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![echo, hub]);
        let _hub = rt.spawn("hub").unwrap();

        let replies = out.wait_for(8);
        let mut indices: Vec<i64> = replies
            .iter()
            .map(|r| r["reply"]["i"].as_i64().unwrap())
            .collect();
        indices.sort();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());

        for reply in &replies {
            assert_eq!(reply["reply"]["seen"], json!(1));
            assert_eq!(reply["reply"]["worker"], reply["source"]);
        }
        let mut sources: Vec<&Value> = replies.iter().map(|r| &r["source"]).collect();
        sources.sort_by_key(|s| s.to_string());
        sources.dedup();
        assert_eq!(sources.len(), 8);

        rt.shutdown_and_join();
    }

    #[test]
    fn uncaught_error_without_onerror_keeps_the_loop_running() {
        let out = Collector::default();
        let fragile = {
            let out = out.clone();
            module_fn("fragile", move |scope| {
                let out = out.clone();
                scope.set_onmessage(move |_, event| {
                    if event.data == json!("bad") {
                        return Err(json!("rejected bad input"));
                    }
                    out.push(event.data);
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![fragile]);
        let worker = rt.spawn("fragile").unwrap();

        worker.post_message(json!("bad"));
        worker.post_message(json!("good"));
        assert_eq!(out.wait_for(1), vec![json!("good")]);
        assert_eq!(worker.state(), WorkerState::Running);
        rt.shutdown_and_join();
    }

    #[test]
    fn handler_panic_is_routed_to_onerror() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("panicky", move |scope| {
                scope.set_onmessage(|_, _event| -> Result<(), Reason> { panic!("kaboom") });
                let out = out.clone();
                scope.set_onerror(move |_, event| {
                    out.push(event.data);
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("panicky").unwrap();

        worker.post_message(json!(1));
        worker.post_message(json!(2));
        assert_eq!(out.wait_for(2), vec![json!("panic: kaboom"), json!("panic: kaboom")]);
        rt.shutdown_and_join();
    }

    #[test]
    fn post_error_reaches_onerror() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("listener", move |scope| {
                let on_message = out.clone();
                scope.set_onmessage(move |_, event| {
                    on_message.push(json!({ "message": event.data }));
                    Ok(())
                });
                let on_error = out.clone();
                scope.set_onerror(move |_, event| {
                    on_error.push(json!({ "error": event.data, "outside": event.source.is_none() }));
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("listener").unwrap();

        rt.post_error(&worker, json!("external"));
        rt.post_message(&worker, json!("data"));
        assert_eq!(
            out.wait_for(2),
            vec![
                json!({ "error": "external", "outside": true }),
                json!({ "message": "data" }),
            ]
        );
        rt.shutdown_and_join();
    }

    #[test]
    fn timeouts_and_intervals_fire_and_cancel() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("timers", move |scope| {
                let once = out.clone();
                scope.set_timeout(Duration::from_millis(20), move |_| {
                    once.push(json!("timeout"));
                    Ok(())
                });

                let never = out.clone();
                let cancelled = scope.set_timeout(Duration::from_millis(10), move |_| {
                    never.push(json!("cancelled timer fired"));
                    Ok(())
                });
                assert!(scope.clear_timeout(cancelled));

                let own_id: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));
                let ticks = out.clone();
                let mut n = 0;
                let id = {
                    let own_id = Rc::clone(&own_id);
                    scope.set_interval(Duration::from_millis(10), move |scope| {
                        n += 1;
                        ticks.push(json!({ "tick": n }));
                        if n == 3
                            && let Some(id) = own_id.get()
                        {
                            scope.clear_interval(id);
                        }
                        Ok(())
                    })
                };
                own_id.set(Some(id));
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let _worker = rt.spawn("timers").unwrap();

        out.wait_for(4);
        std::thread::sleep(Duration::from_millis(100));
        let events = out.snapshot();
        assert_eq!(events.len(), 4);

        let ticks: Vec<&Value> = events.iter().filter(|e| e.get("tick").is_some()).collect();
        assert_eq!(ticks, vec![&json!({"tick": 1}), &json!({"tick": 2}), &json!({"tick": 3})]);
        assert!(events.contains(&json!("timeout")));
        rt.shutdown_and_join();
    }

    #[test]
    fn timer_error_is_routed_to_onerror() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("failing-timer", move |scope| {
                let out = out.clone();
                scope.set_onerror(move |_, event| {
                    out.push(event.data);
                    Ok(())
                });
                scope.set_timeout(Duration::from_millis(5), |_| Err(json!("timer failed")));
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let _worker = rt.spawn("failing-timer").unwrap();

        assert_eq!(out.wait_for(1), vec![json!("timer failed")]);
        rt.shutdown_and_join();
    }

    #[test]
    fn terminate_stops_the_worker() {
        let out = Collector::default();
        let rt = runtime_with(vec![sink("sink", &out)]);
        let worker = rt.spawn("sink").unwrap();
        let id = worker.id();

        rt.terminate(&worker);
        assert!(worker.wait_terminated(WAIT));
        assert!(worker.is_terminated());
        rt.terminate(&worker);

        // dropped silently
        worker.post_message(json!("late"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(out.snapshot().is_empty());

        assert!(rt.get(id).is_none());
        assert_eq!(rt.counts().terminated, 1);
        rt.shutdown_and_join();
    }

    #[test]
    fn terminate_lets_the_running_handler_finish_and_drops_the_queue() {
        let out = Collector::default();
        let gate = Semaphore::new(0);
        let module = {
            let out = out.clone();
            let gate = gate.clone();
            module_fn("blocking", move |scope| {
                let out = out.clone();
                let gate = gate.clone();
                scope.set_onmessage(move |_, event| {
                    out.push(json!({ "started": event.data }));
                    if event.data == json!("block") {
                        gate.wait();
                        out.push(json!({ "finished": event.data }));
                    }
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("blocking").unwrap();

        worker.post_message(json!("block"));
        out.wait_for(1);
        for i in 0..3 {
            worker.post_message(json!(i));
        }
        worker.terminate();
        assert_eq!(worker.state(), WorkerState::Running);

        gate.signal_one();
        assert!(worker.wait_terminated(WAIT));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            out.snapshot(),
            vec![json!({ "started": "block" }), json!({ "finished": "block" })]
        );
        rt.shutdown_and_join();
    }

    #[test]
    fn far_future_timers_are_accepted_and_cancellable() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("far", move |scope| {
                let forever = scope.set_timeout(Duration::MAX, |_| Ok(()));
                let ticks = out.clone();
                scope.set_timeout(Duration::from_millis(5), move |_| {
                    ticks.push(json!("soon"));
                    Ok(())
                });

                let on_message = out.clone();
                let mut pending = Some(forever);
                scope.set_onmessage(move |scope, event| {
                    if let Some(id) = pending.take() {
                        on_message.push(json!({ "cleared": scope.clear_timeout(id) }));
                    }
                    let again = scope.set_interval(Duration::MAX, |_| Ok(()));
                    on_message.push(json!({ "interval": scope.clear_interval(again), "data": event.data }));
                    Ok(())
                });
                let on_error = out.clone();
                scope.set_onerror(move |_, event| {
                    on_error.push(json!({ "error": event.data }));
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("far").unwrap();

        assert_eq!(out.wait_for(1), vec![json!("soon")]);
        worker.post_message(json!(1));
        assert_eq!(
            out.wait_for(2)[1..],
            [json!({ "cleared": true }), json!({ "interval": true, "data": 1 })]
        );
        assert_eq!(worker.state(), WorkerState::Running);
        rt.shutdown_and_join();
    }

    #[test]
    fn worker_exits_once_idle_and_unreferenced() {
        let rt = runtime_with(vec![module_fn("idle", |_scope| Ok(()))]);
        let worker = rt.spawn("idle").unwrap();
        let weak = worker.downgrade();
        assert_eq!(weak.state(), WorkerState::Running);

        drop(worker);
        assert!(wait_until(|| weak.state() == WorkerState::Terminated));
        rt.shutdown_and_join();
    }

    #[test]
    fn pending_interval_keeps_an_unreferenced_worker_alive() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("ticker", move |scope| {
                let out = out.clone();
                scope.set_interval(Duration::from_millis(10), move |_| {
                    out.push(json!("tick"));
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("ticker").unwrap();
        let id = worker.id();
        drop(worker);

        out.wait_for(3);
        let worker = rt.get(id).expect("still running");
        assert_eq!(worker.state(), WorkerState::Running);

        worker.terminate();
        assert!(worker.wait_terminated(WAIT));
        rt.shutdown_and_join();
    }

    #[test]
    fn worker_can_close_itself() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("closer", move |scope| {
                let out = out.clone();
                scope.set_onmessage(move |scope, event| {
                    out.push(event.data.clone());
                    if event.data == json!("close") {
                        scope.close();
                    }
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("closer").unwrap();

        worker.post_message(json!("close"));
        assert!(worker.wait_terminated(WAIT));
        worker.post_message(json!("after close"));
        assert_eq!(out.snapshot(), vec![json!("close")]);
        rt.shutdown_and_join();
    }

    #[test]
    fn handler_replaced_from_inside_itself_takes_effect() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("switcher", move |scope| {
                let out = out.clone();
                scope.set_onmessage(move |scope, event| {
                    out.push(json!({ "first": event.data }));
                    let out = out.clone();
                    scope.set_onmessage(move |_, event| {
                        out.push(json!({ "second": event.data }));
                        Ok(())
                    });
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("switcher").unwrap();

        for i in 0..3 {
            worker.post_message(json!(i));
        }
        assert_eq!(
            out.wait_for(3),
            vec![
                json!({ "first": 0 }),
                json!({ "second": 1 }),
                json!({ "second": 2 }),
            ]
        );
        rt.shutdown_and_join();
    }

    #[test]
    fn shutdown_terminates_every_worker() {
        let out = Collector::default();
        let rt = runtime_with(vec![sink("sink", &out)]);
        let workers: Vec<Worker> = (0..3).map(|_| rt.spawn("sink").unwrap()).collect();

        assert_eq!(
            rt.counts(),
            WorkerCounts {
                starting: 0,
                running: 3,
                terminated: 0
            }
        );
        assert_eq!(rt.workers().len(), 3);

        rt.shutdown_and_join();
        assert!(workers.iter().all(Worker::is_terminated));
        assert_eq!(rt.counts().live(), 0);
    }

    #[test]
    fn promise_continuations_run_on_the_attaching_worker() {
        let out = Collector::default();
        let module = {
            let out = out.clone();
            module_fn("promiser", move |scope| {
                let out = out.clone();
                scope.set_onmessage(move |_, event| {
                    let deferred = Deferred::new();
                    let out = out.clone();
                    let _derived = deferred.promise().then(move |value: Value| {
                        let thread = std::thread::current().name().map(str::to_string);
                        out.push(json!({ "value": value, "thread": thread }));
                        Ok(Next::Value(()))
                    });
                    std::thread::spawn(move || {
                        deferred.resolve(event.data);
                    });
                    Ok(())
                });
                Ok(())
            })
        };
        let rt = runtime_with(vec![module]);
        let worker = rt.spawn("promiser").unwrap();

        worker.post_message(json!(42));
        let events = out.wait_for(1);
        assert_eq!(events[0]["value"], json!(42));
        let thread = events[0]["thread"].as_str().unwrap();
        assert!(thread.starts_with("strand-worker-"), "ran on {thread}");
        rt.shutdown_and_join();
    }
}
