//! In-process connector and sink for the reference runtime.
//!
//! `QueueConnector` implements the engine's non-blocking dispatch handoff
//! with a plain queue: the engine pushes envelopes, the scenario driver
//! pops them, runs the mock agent, and feeds the completion signal back
//! through `PipelineEngine::complete`. This mirrors how a message-bus
//! transport behaves without any transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use arbiter_contracts::{
    error::ArbiterResult,
    message::{DispatchEnvelope, IntelligenceEvent},
    task::TaskId,
};
use arbiter_engine::{AgentConnector, EventSink};

/// A cloneable handle to the pending-envelope queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Mutex<VecDeque<DispatchEnvelope>>>,
}

impl DispatchQueue {
    /// Pop the oldest pending envelope, if any.
    pub fn pop(&self) -> Option<DispatchEnvelope> {
        self.inner.lock().ok()?.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|q| q.is_empty()).unwrap_or(true)
    }
}

/// A connector that queues envelopes for a scenario driver to consume.
pub struct QueueConnector {
    queue: Arc<Mutex<VecDeque<DispatchEnvelope>>>,
    cancelled: Arc<Mutex<Vec<TaskId>>>,
}

impl QueueConnector {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A handle to the pending queue, grabbed before the connector is
    /// boxed into the engine.
    pub fn queue(&self) -> DispatchQueue {
        DispatchQueue {
            inner: self.queue.clone(),
        }
    }

    /// Snapshot of the cancellation signals received so far.
    pub fn cancellations(&self) -> Arc<Mutex<Vec<TaskId>>> {
        self.cancelled.clone()
    }
}

impl Default for QueueConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentConnector for QueueConnector {
    fn dispatch(&self, envelope: &DispatchEnvelope) -> ArbiterResult<()> {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(envelope.clone());
        }
        Ok(())
    }

    fn cancel(&self, task_id: &TaskId) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(*task_id);
        }
    }
}

/// An event sink that collects terminal events for inspection.
pub struct CollectingSink {
    events: Arc<Mutex<Vec<IntelligenceEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A handle to the collected events, grabbed before boxing.
    pub fn events(&self) -> Arc<Mutex<Vec<IntelligenceEvent>>> {
        self.events.clone()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: &IntelligenceEvent) -> ArbiterResult<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}
