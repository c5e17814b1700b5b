//! Handle table – lets callers across a process or language boundary
//! reference live tasks by a small integer.
//!
//! Slot 0 is reserved, so 0 doubles as "no task". Free slots are kept in a
//! free list and the lowest one is handed out first. The lock is held only
//! while a slot is read, assigned or cleared, never while waiting on a task.

use crate::admission::Admission;
use crate::context::EngineContext;
use crate::event::TERMINATED;
use crate::task::Task;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Slots {
    entries: Vec<Option<Arc<Task>>>,
    free: BTreeSet<usize>,
}

pub struct HandleTable {
    engine: EngineContext,
    admission: Admission,
    slots: Mutex<Slots>,
}

impl HandleTable {
    /// Capacity and admission bound come from the engine configuration.
    pub fn new(engine: EngineContext) -> Self {
        let admission = Admission::new(engine.config().effective_concurrency());
        Self::with_admission(engine, admission)
    }

    /// Share `admission` with other tables (or hold it from the outside).
    pub fn with_admission(engine: EngineContext, admission: Admission) -> Self {
        let capacity = engine.config().effective_capacity();
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            engine,
            admission,
            slots: Mutex::new(Slots {
                entries,
                free: (1..capacity).collect(),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.slots().entries.len()
    }

    /// Number of handles currently assigned.
    pub fn live(&self) -> usize {
        let slots = self.slots();
        slots.entries.len() - 1 - slots.free.len()
    }

    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    /// Start a task and return its handle; 0 if `settings` is absent or the
    /// table is full.
    pub fn start(&self, settings: Option<&str>) -> u32 {
        let Some(text) = settings else {
            tracing::warn!("start called without settings");
            return 0;
        };
        let mut slots = self.slots();
        let Some(idx) = slots.free.pop_first() else {
            tracing::warn!(capacity = slots.entries.len(), "handle table is full");
            return 0;
        };
        let Ok(handle) = u32::try_from(idx) else {
            slots.free.insert(idx);
            return 0;
        };
        let task = Task::start(text, self.engine.clone(), self.admission.clone());
        slots.entries[idx] = Some(Arc::new(task));
        tracing::debug!(handle, "task started");
        handle
    }

    pub fn lookup(&self, handle: u32) -> Option<Arc<Task>> {
        let idx = usize::try_from(handle).ok()?;
        if idx == 0 {
            return None;
        }
        self.slots().entries.get(idx)?.clone()
    }

    /// Next event of `handle`; the terminated sentinel for unknown handles.
    pub fn wait_for_next_event(&self, handle: u32) -> String {
        match self.lookup(handle) {
            Some(task) => task.wait_for_next_event(),
            None => TERMINATED.to_string(),
        }
    }

    pub fn is_done(&self, handle: u32) -> bool {
        self.lookup(handle).map_or(true, |task| task.is_done())
    }

    pub fn interrupt(&self, handle: u32) {
        if let Some(task) = self.lookup(handle) {
            task.interrupt();
        }
    }

    /// Interrupt, drain until the worker has exited, then free the slot.
    pub fn destroy(&self, handle: u32) {
        let Some(task) = self.lookup(handle) else {
            return;
        };
        task.interrupt();
        task.drain();

        let idx = handle as usize;
        let mut slots = self.slots();
        let same = matches!(&slots.entries[idx], Some(current) if Arc::ptr_eq(current, &task));
        if same {
            slots.entries[idx] = None;
            slots.free.insert(idx);
            tracing::debug!(handle, "task destroyed");
        }
    }
}
