//! Fan-out of job events to subscribers.
//!
//! Every subscriber owns an unbounded channel, so a slow consumer never loses
//! events and sees each job's events in the order they were published.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state_machine::{Job, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Completed,
    Error,
}

/// One published update. `job` is the snapshot right after the change.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: EventKind,
    /// Error text for `Error` events that did not come from a status change
    /// (stderr output, a worker-reported error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub job: Job,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    filter: Option<EventKind>,
    sender: mpsc::UnboundedSender<JobEvent>,
}

/// Publish/subscribe hub shared between the coordinator and its handles.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, job: &Job, kind: EventKind, message: Option<String>) {
        let event = JobEvent {
            job_id: job.id.clone(),
            kind,
            message,
            job: job.clone(),
            timestamp: Utc::now(),
        };

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Dropped receivers are pruned here.
        subscribers.retain(|sub| {
            if sub.filter.is_some_and(|kind| kind != event.kind) {
                return !sub.sender.is_closed();
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }

    /// Receives every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.add(None)
    }

    /// Receives only events of `kind`.
    pub fn subscribe_to(&self, kind: EventKind) -> mpsc::UnboundedReceiver<JobEvent> {
        self.add(Some(kind))
    }

    fn add(&self, filter: Option<EventKind>) -> mpsc::UnboundedReceiver<JobEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { filter, sender });
        receiver
    }
}
