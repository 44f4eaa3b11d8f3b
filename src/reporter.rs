use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::error;

const RECENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct ReportedFailure {
    pub worker_id: usize,
    pub cause: String,
    pub reported_at: String,
}

/// Sink for failures that escaped a worker's own handling.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    reported: AtomicU64,
    recent: Mutex<VecDeque<ReportedFailure>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, worker_id: usize, cause: &dyn Display) {
        let cause = cause.to_string();

        error!(
            severity = "fatal",
            worker_id,
            error = %cause,
            "Unexpected failure in consumer worker"
        );

        self.reported.fetch_add(1, Ordering::Relaxed);

        let failure = ReportedFailure {
            worker_id,
            cause,
            reported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        // A poisoned lock only means another reporter panicked mid-push.
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(failure);
    }

    pub fn reported_count(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn recent(&self) -> Vec<ReportedFailure> {
        match self.recent.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}
