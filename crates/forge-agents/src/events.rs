//! Run event fan-out.
//!
//! Two delivery paths share one publish call: registered observers (called
//! inline, panics swallowed) and a Tokio broadcast channel for async
//! consumers such as the CLI progress printer. A misbehaving observer must
//! never stall or kill the pipeline, so observer callbacks run under
//! `catch_unwind` and a full broadcast channel just drops the oldest events
//! for that subscriber.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use genpipe::{ScenarioStatus, TestSummary};

use crate::state::RunStage;

const CHANNEL_CAPACITY: usize = 256;

/// Everything observable about a run, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    StageChanged {
        run_id: Uuid,
        from: RunStage,
        to: RunStage,
        timestamp: DateTime<Utc>,
    },
    AnalysisCompleted {
        run_id: Uuid,
        language: String,
        scenario_count: usize,
        timestamp: DateTime<Utc>,
    },
    ScenarioStarted {
        run_id: Uuid,
        scenario_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    ScenarioCompleted {
        run_id: Uuid,
        scenario_id: String,
        status: ScenarioStatus,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    TestsCompleted {
        run_id: Uuid,
        summary: TestSummary,
        timestamp: DateTime<Utc>,
    },
    ProgressUpdated {
        run_id: Uuid,
        percent: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: Uuid,
        quality_score: f64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StageChanged { .. } => "stage_changed",
            Self::AnalysisCompleted { .. } => "analysis_completed",
            Self::ScenarioStarted { .. } => "scenario_started",
            Self::ScenarioCompleted { .. } => "scenario_completed",
            Self::TestsCompleted { .. } => "tests_completed",
            Self::ProgressUpdated { .. } => "progress_updated",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageChanged { run_id, .. }
            | Self::AnalysisCompleted { run_id, .. }
            | Self::ScenarioStarted { run_id, .. }
            | Self::ScenarioCompleted { run_id, .. }
            | Self::TestsCompleted { run_id, .. }
            | Self::ProgressUpdated { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => *run_id,
        }
    }
}

/// Synchronous run observer. Keep callbacks cheap; they run on the
/// pipeline task.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Observer registry plus broadcast fan-out.
pub struct ObserverHub {
    observers: RwLock<HashMap<Uuid, std::sync::Arc<dyn RunObserver>>>,
    sender: broadcast::Sender<RunEvent>,
}

impl ObserverHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            observers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Register an observer; the returned token unregisters it.
    pub fn attach(&self, observer: std::sync::Arc<dyn RunObserver>) -> Uuid {
        let token = Uuid::new_v4();
        self.observers.write().unwrap().insert(token, observer);
        token
    }

    /// Remove an observer. Returns `false` for an unknown token.
    pub fn detach(&self, token: Uuid) -> bool {
        self.observers.write().unwrap().remove(&token).is_some()
    }

    /// Broadcast receiver for async consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every observer and broadcast subscriber.
    ///
    /// Never fails: a panicking observer is logged and skipped, and a
    /// send with no receivers is fine.
    pub fn publish(&self, event: RunEvent) {
        let observers: Vec<_> = self.observers.read().unwrap().values().cloned().collect();
        for observer in observers {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if result.is_err() {
                warn!(event_type = event.event_type(), "Observer panicked, skipping");
            }
        }

        match self.sender.send(event.clone()) {
            Ok(count) => debug!(event_type = event.event_type(), receivers = count, "Event published"),
            Err(_) => debug!(event_type = event.event_type(), "Event published (no receivers)"),
        }
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl RunObserver for Recorder {
        fn on_event(&self, event: &RunEvent) {
            self.seen.lock().unwrap().push(event.event_type().to_string());
        }
    }

    fn started(run_id: Uuid) -> RunEvent {
        RunEvent::RunStarted {
            run_id,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn observers_receive_published_events() {
        let hub = ObserverHub::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        hub.attach(recorder.clone());

        hub.publish(started(Uuid::new_v4()));
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["run_started"]);
    }

    #[test]
    fn detached_observer_stops_receiving() {
        let hub = ObserverHub::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let token = hub.attach(recorder.clone());
        assert!(hub.detach(token));
        assert!(!hub.detach(token));

        hub.publish(started(Uuid::new_v4()));
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        struct Bomb;
        impl RunObserver for Bomb {
            fn on_event(&self, _event: &RunEvent) {
                panic!("observer bug");
            }
        }

        let hub = ObserverHub::new();
        hub.attach(Arc::new(Bomb));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        hub.attach(recorder.clone());

        hub.publish(started(Uuid::new_v4()));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_subscribers_see_events() {
        let hub = ObserverHub::new();
        let mut rx = hub.subscribe();
        let id = Uuid::new_v4();
        hub.publish(started(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), id);
        assert_eq!(event.event_type(), "run_started");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        struct Counter;
        impl RunObserver for Counter {
            fn on_event(&self, _event: &RunEvent) {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hub = ObserverHub::new();
        hub.publish(started(Uuid::new_v4()));
        hub.attach(Arc::new(Counter));
        hub.publish(started(Uuid::new_v4()));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
