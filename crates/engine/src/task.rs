//! Task – one engine-managed run of a nettest on its own worker thread.
//!
//! The host talks to a task only through the event queue, the
//! cancellation token and the completion flag. The worker owns the
//! producer side of the queue; it drops it when the run ends and only then
//! raises `done`, so a host that observes `done` can drain the rest of the
//! queue without blocking.

use crate::admission::Admission;
use crate::context::{ByteCounters, EngineContext, RunContext};
use crate::error::RunError;
use crate::event::{Emitter, TERMINATED};
use crate::runner::{self, RunRequest};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Started = 1,
    Running = 2,
    Done = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Queued,
            1 => TaskState::Started,
            2 => TaskState::Running,
            _ => TaskState::Done,
        }
    }
}

/// Shared view of a task's lifecycle state.
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// States only move forward; `Done` is final.
    pub fn set(&self, state: TaskState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

pub struct Task {
    cancel: CancellationToken,
    events: Mutex<UnboundedReceiver<String>>,
    done: Arc<AtomicBool>,
    state: StateCell,
    counters: Arc<ByteCounters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Spawn the worker. Never fails: setup errors become a well-formed
    /// event stream ending in `status.end`.
    pub fn start(settings_text: &str, engine: EngineContext, admission: Admission) -> Self {
        let (tx, rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let counters = Arc::new(ByteCounters::default());
        let done = Arc::new(AtomicBool::new(false));
        let state = StateCell::default();

        let req = RunRequest {
            settings_text: settings_text.to_string(),
            engine,
            admission,
            ctx: RunContext::new(cancel.clone(), Arc::clone(&counters)),
            state: state.clone(),
        };
        let fallback = tx.clone();
        let crash_tx = tx.clone();
        let emitter = Emitter::new(tx);
        let worker_done = Arc::clone(&done);
        let worker_state = state.clone();
        let worker_counters = Arc::clone(&counters);

        let spawned = std::thread::Builder::new()
            .name("nettask-worker".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt.block_on(runner::run(req, emitter)),
                        Err(e) => runner::abort(emitter, RunError::Worker(e.to_string())),
                    }
                }));
                // the runner's emitter is gone either way; this sender closes the queue
                match outcome {
                    Ok(()) => drop(crash_tx),
                    Err(payload) => runner::crashed(
                        Emitter::new(crash_tx),
                        RunError::Panic(panic_message(payload.as_ref())),
                        &worker_counters,
                    ),
                }
                worker_state.set(TaskState::Done);
                worker_done.store(true, Ordering::Release);
            });

        let worker = match spawned {
            Ok(handle) => {
                drop(fallback);
                Some(handle)
            }
            Err(e) => {
                runner::abort(Emitter::new(fallback), RunError::Worker(e.to_string()));
                state.set(TaskState::Done);
                done.store(true, Ordering::Release);
                None
            }
        };

        Self {
            cancel,
            events: Mutex::new(rx),
            done,
            state,
            counters,
            worker: Mutex::new(worker),
        }
    }

    /// Block until the next event, or return the terminated sentinel once
    /// the queue is closed. Must not be called from inside an async runtime.
    pub fn wait_for_next_event(&self) -> String {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .blocking_recv()
            .unwrap_or_else(|| TERMINATED.to_string())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    /// Discard events until the queue closes, then wait for the worker to
    /// exit. `done` is set when this returns.
    pub fn drain(&self) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.blocking_recv().is_some() {}
        drop(events);
        self.join();
    }

    fn join(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("nettask worker panicked");
                self.done.store(true, Ordering::Release);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;

    fn collect(task: &Task) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        loop {
            let text = task.wait_for_next_event();
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            if v["key"] == "status.terminated" {
                return out;
            }
            out.push(v);
        }
    }

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), TaskState::Queued);
        cell.set(TaskState::Running);
        cell.set(TaskState::Started);
        assert_eq!(cell.get(), TaskState::Running);
        cell.set(TaskState::Done);
        assert_eq!(cell.get(), TaskState::Done);
    }

    #[test]
    fn test_task_runs_to_done() {
        let fakes = Fakes::default();
        let task = Task::start(
            r#"{"name":"echo-nettest","inputs":["a"],"options":{"no_bouncer":true,"no_collector":true}}"#,
            fakes.context(),
            Admission::serial(),
        );
        let events = collect(&task);
        assert_eq!(events.first().unwrap()["key"], "status.queued");
        assert_eq!(events.last().unwrap()["key"], "status.end");
        task.drain();
        assert!(task.is_done());
        assert_eq!(task.state(), TaskState::Done);
        // terminated forever after
        assert_eq!(task.wait_for_next_event(), TERMINATED);
        assert_eq!(task.wait_for_next_event(), TERMINATED);
    }

    #[test]
    fn test_bad_settings_still_yield_stream() {
        let task = Task::start("{", Fakes::default().context(), Admission::serial());
        let keys: Vec<_> = collect(&task)
            .iter()
            .map(|e| e["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["status.queued", "failure.startup", "status.end"]);
    }

    #[test]
    fn test_interrupt_is_idempotent() {
        let admission = Admission::serial();
        let fakes = Fakes::default();
        // hold the only permit so the task stays queued
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let permit = rt.block_on(admission.acquire(&CancellationToken::new())).unwrap();

        let task = Task::start(
            r#"{"name":"echo-nettest","options":{"no_bouncer":true,"no_collector":true}}"#,
            fakes.context(),
            admission.clone(),
        );
        task.interrupt();
        task.interrupt();
        let events = collect(&task);
        assert_eq!(events[1]["key"], "failure.startup");
        assert_eq!(events[2]["value"]["failure"], "generic_error");
        drop(permit);
        task.drain();
        task.interrupt();
        assert!(task.is_done());
    }
}
