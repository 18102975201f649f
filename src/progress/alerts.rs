//! Threshold alerts raised by the [`ProgressTracker`](super::ProgressTracker).

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::stage::StageIndex;
use crate::util::duration_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressAlert {
    pub id: String,
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<StageIndex>,
    /// Run time at which the alert was raised.
    #[serde(rename = "raised_at_ms", with = "duration_millis")]
    pub raised_at: Duration,
    pub timestamp: DateTime<Utc>,
    pub dismissed: bool,
}

/// Bounded alert history with per-(kind, title) de-duplication.
#[derive(Debug, Clone)]
pub(crate) struct AlertLog {
    alerts: VecDeque<ProgressAlert>,
    max_alerts: usize,
    dedup_window: Duration,
    next_id: u64,
}

impl AlertLog {
    pub(crate) fn new(max_alerts: usize, dedup_window: Duration) -> Self {
        Self {
            alerts: VecDeque::new(),
            max_alerts: max_alerts.max(1),
            dedup_window,
            next_id: 0,
        }
    }

    /// Raise an alert unless an undismissed one with the same kind and title
    /// was raised within the de-dup window. Returns whether it was added.
    pub(crate) fn raise(
        &mut self,
        kind: AlertKind,
        slug: &str,
        title: String,
        message: String,
        stage_index: Option<StageIndex>,
        at: Duration,
    ) -> bool {
        let duplicate = self.alerts.iter().any(|a| {
            a.kind == kind
                && a.title == title
                && !a.dismissed
                && at.saturating_sub(a.raised_at) < self.dedup_window
        });
        if duplicate {
            return false;
        }

        match kind {
            AlertKind::Warning | AlertKind::Error => warn!(%kind, %title, "{}", message),
            _ => info!(%kind, %title, "{}", message),
        }

        self.next_id += 1;
        self.alerts.push_back(ProgressAlert {
            id: format!("{}-{}", slug, self.next_id),
            kind,
            title,
            message,
            stage_index,
            raised_at: at,
            timestamp: Utc::now(),
            dismissed: false,
        });
        while self.alerts.len() > self.max_alerts {
            self.alerts.pop_front();
        }
        true
    }

    pub(crate) fn dismiss(&mut self, id: &str) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.dismissed = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn active(&self) -> Vec<ProgressAlert> {
        self.alerts.iter().filter(|a| !a.dismissed).cloned().collect()
    }

    pub(crate) fn all(&self) -> Vec<ProgressAlert> {
        self.alerts.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.alerts.clear();
        self.next_id = 0;
    }
}
