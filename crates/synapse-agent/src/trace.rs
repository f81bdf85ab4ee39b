//! Process-wide phase-event plumbing: a bounded trace ring for the admin
//! surface and a broadcast hub for streaming observers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use synapse_protocol::{AgentObserver, PhaseEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Retained phase events.
const TRACE_CAPACITY: usize = 100;

/// Bounded ring of the most recent phase events. One instance per
/// process, constructed at startup and shared by handle.
#[derive(Debug, Default)]
pub struct TraceLog {
    events: Mutex<VecDeque<PhaseEvent>>,
}

impl TraceLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: PhaseEvent) {
        let mut events = self.events.lock();
        if events.len() >= TRACE_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of the retained events, oldest first.
    pub fn recent(&self) -> Vec<PhaseEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// One completed request, as the admin surface sees it.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub project_id: String,
    pub session_id: String,
    pub user_query: String,
    pub final_answer: String,
    pub duration_ms: f64,
    /// The last fully composed model prompt, kept for inspection.
    pub full_prompt: String,
}

/// Retained interactions.
const INTERACTION_CAPACITY: usize = 50;

/// Bounded ring of completed requests, process-wide like the trace ring.
#[derive(Debug, Default)]
pub struct InteractionLog {
    records: Mutex<VecDeque<InteractionRecord>>,
}

impl InteractionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, record: InteractionRecord) {
        let mut records = self.records.lock();
        if records.len() >= INTERACTION_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot, oldest first.
    pub fn recent(&self) -> Vec<InteractionRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Fan-out of phase events to any number of streaming subscribers.
#[derive(Debug, Clone)]
pub struct PhaseHub {
    sender: broadcast::Sender<PhaseEvent>,
}

impl PhaseHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<PhaseEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl AgentObserver for PhaseHub {
    fn notify(&self, event: &PhaseEvent) {
        let _ = self.sender.send(event.clone());
    }
}
