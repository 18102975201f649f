//! Failure classification and recovery decisions.
//!
//! The [`ErrorHandler`] is advisory: the engine records each failed attempt,
//! asks for a [`RecoveryResult`], and decides for itself what to do with it.
//! Alongside, the handler keeps a bounded history and a frequency map of
//! recurring `(kind, message prefix)` pairs for reporting. That bookkeeping
//! never influences a recovery decision.

mod strategies;

pub use strategies::{
    GenericRetry, NetworkBackoff, ParsingFallback, QuotaBackoff, RecoveryAction, RecoveryResult,
    RecoveryStrategy, TimeoutExtension,
};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::stage::StageIndex;
use crate::util::contains_any;

const MAX_HISTORY: usize = 100;
const PATTERN_PREFIX_LEN: usize = 50;
const TOP_PATTERNS: usize = 5;

/// Error taxonomy, derived from message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Api,
    Timeout,
    Parsing,
    Unknown,
}

impl ErrorKind {
    /// Keyword classification, checked in taxonomy order.
    pub fn classify(message: &str) -> Self {
        if contains_any(message, &["network", "connection", "fetch", "cors"]) {
            Self::Network
        } else if contains_any(
            message,
            &["api", "quota", "rate limit", "429", "too many requests", "unauthorized"],
        ) {
            Self::Api
        } else if contains_any(message, &["timeout", "timed out"]) {
            Self::Timeout
        } else if contains_any(message, &["json", "parse", "syntax"]) {
            Self::Parsing
        } else {
            Self::Unknown
        }
    }

    pub fn suggested_fix(self) -> &'static str {
        match self {
            Self::Network => "check connectivity and retry with backoff",
            Self::Api => "check credentials and quota usage, or spread load across keys",
            Self::Timeout => "raise the per-stage timeout or split the stage",
            Self::Parsing => "validate the response format or decode leniently",
            Self::Unknown => "inspect the stage logs for details",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::Timeout => "timeout",
            Self::Parsing => "parsing",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub stage_index: StageIndex,
    pub stage_name: String,
    /// 1-based attempt that failed.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// A recurring failure signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub kind: ErrorKind,
    pub prefix: String,
    pub frequency: u32,
    pub last_seen: DateTime<Utc>,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub total_errors: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_stage: BTreeMap<StageIndex, usize>,
    /// Up to five patterns seen more than once, most frequent first.
    pub common_patterns: Vec<ErrorPattern>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageErrorSummary {
    pub error_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_common_kind: Option<ErrorKind>,
}

/// Classifies failures and picks a recovery strategy.
#[derive(Debug)]
pub struct ErrorHandler {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    history: VecDeque<ErrorContext>,
    patterns: BTreeMap<(ErrorKind, String), ErrorPattern>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    /// Handler with the built-in strategies and a generic cap of 3 attempts.
    pub fn new() -> Self {
        Self::with_max_attempts(GenericRetry::default().max_attempts)
    }

    /// Handler with the built-in strategies, the catch-all giving up once
    /// `max_attempts` attempts have failed.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        let mut handler = Self::without_strategies();
        handler.add_strategy(Arc::new(QuotaBackoff::default()));
        handler.add_strategy(Arc::new(NetworkBackoff::default()));
        handler.add_strategy(Arc::new(ParsingFallback::default()));
        handler.add_strategy(Arc::new(TimeoutExtension::default()));
        handler.add_strategy(Arc::new(GenericRetry {
            max_attempts,
            ..GenericRetry::default()
        }));
        handler
    }

    /// Handler with no strategies: every failure is final.
    pub fn without_strategies() -> Self {
        Self {
            strategies: Vec::new(),
            history: VecDeque::new(),
            patterns: BTreeMap::new(),
        }
    }

    /// Register a strategy. Strategies stay sorted by descending priority;
    /// equal priorities keep registration order.
    pub fn add_strategy(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.push(strategy);
        self.strategies
            .sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    pub fn strategy_ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.id()).collect()
    }

    /// Classify and record a failed attempt.
    pub fn record(
        &mut self,
        stage_index: StageIndex,
        stage_name: &str,
        message: &str,
        attempt: u32,
    ) -> ErrorContext {
        let ctx = ErrorContext {
            stage_index,
            stage_name: stage_name.to_string(),
            attempt,
            timestamp: Utc::now(),
            kind: ErrorKind::classify(message),
            message: message.to_string(),
        };

        self.history.push_back(ctx.clone());
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }

        let prefix: String = message.chars().take(PATTERN_PREFIX_LEN).collect();
        self.patterns
            .entry((ctx.kind, prefix.clone()))
            .and_modify(|p| {
                p.frequency += 1;
                p.last_seen = ctx.timestamp;
            })
            .or_insert_with(|| ErrorPattern {
                kind: ctx.kind,
                prefix,
                frequency: 1,
                last_seen: ctx.timestamp,
                suggested_fix: ctx.kind.suggested_fix().to_string(),
            });

        debug!(
            stage = stage_index,
            attempt,
            kind = %ctx.kind,
            "Recorded stage error"
        );
        ctx
    }

    /// First strategy, by descending priority, that can handle `ctx`.
    pub fn recover(&self, ctx: &ErrorContext) -> RecoveryResult {
        match self.strategies.iter().find(|s| s.can_handle(ctx)) {
            Some(strategy) => {
                let result = strategy.recover(ctx);
                debug!(
                    stage = ctx.stage_index,
                    strategy = strategy.id(),
                    retry = result.retry_recommended,
                    "Selected recovery strategy"
                );
                result
            }
            None => {
                warn!(stage = ctx.stage_index, kind = %ctx.kind, "No recovery strategy matched");
                RecoveryResult::give_up("none", "No recovery strategy matched")
            }
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorContext> {
        self.history.iter()
    }

    pub fn analyze(&self) -> ErrorAnalysis {
        let mut by_kind = BTreeMap::new();
        let mut by_stage = BTreeMap::new();
        for ctx in &self.history {
            *by_kind.entry(ctx.kind).or_insert(0) += 1;
            *by_stage.entry(ctx.stage_index).or_insert(0) += 1;
        }

        let mut common_patterns: Vec<ErrorPattern> = self
            .patterns
            .values()
            .filter(|p| p.frequency > 1)
            .cloned()
            .collect();
        common_patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        common_patterns.truncate(TOP_PATTERNS);

        let mut recommendations = Vec::new();
        for (kind, advice) in [
            (ErrorKind::Network, "Harden network handling and retry automatically"),
            (ErrorKind::Api, "Monitor API usage and budget remote quota"),
            (ErrorKind::Timeout, "Raise stage timeouts or speed up slow stages"),
            (ErrorKind::Parsing, "Validate and normalise response formats"),
        ] {
            if by_kind.contains_key(&kind) {
                recommendations.push(advice.to_string());
            }
        }
        for pattern in common_patterns.iter().filter(|p| p.frequency > 3) {
            recommendations.push(format!(
                "Recurring {} error ({}x): {}",
                pattern.kind, pattern.frequency, pattern.suggested_fix
            ));
        }

        ErrorAnalysis {
            total_errors: self.history.len(),
            by_kind,
            by_stage,
            common_patterns,
            recommendations,
        }
    }

    pub fn stage_summary(&self, stage_index: StageIndex) -> StageErrorSummary {
        let errors: Vec<&ErrorContext> = self
            .history
            .iter()
            .filter(|e| e.stage_index == stage_index)
            .collect();

        let mut counts: BTreeMap<ErrorKind, usize> = BTreeMap::new();
        for e in &errors {
            *counts.entry(e.kind).or_insert(0) += 1;
        }
        // max_by_key keeps the last maximum; iterate in reverse so ties go to the first kind.
        let most_common_kind = counts
            .iter()
            .rev()
            .max_by_key(|(_, n)| **n)
            .map(|(k, _)| *k);

        StageErrorSummary {
            error_count: errors.len(),
            last_error: errors.last().map(|e| (*e).clone()),
            most_common_kind,
        }
    }

    /// Errors recorded within `window` of now.
    pub fn recent(&self, window: chrono::Duration) -> Vec<&ErrorContext> {
        let cutoff = Utc::now() - window;
        self.history.iter().filter(|e| e.timestamp >= cutoff).collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.patterns.clear();
    }
}
