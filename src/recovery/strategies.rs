//! Recovery strategies consulted by the [`ErrorHandler`](super::ErrorHandler).
//!
//! Abstraction over "what to do about this failure" so callers can plug in
//! domain-specific handling. Built-ins, highest priority first:
//!
//! | id                    | priority | handles                    | delay                  |
//! |-----------------------|----------|----------------------------|------------------------|
//! | `api-quota`           | 90       | quota / rate-limit api     | 60s flat               |
//! | `network-retry`       | 80       | network                    | `min(30s, 1s * 2^n)`   |
//! | `parsing-alternative` | 75       | parsing                    | 1s, lenient decode     |
//! | `timeout-extend`      | 70       | timeout                    | 2s, extend timeout     |
//! | `generic-retry`       | 50       | anything                   | 3s, capped attempts    |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ErrorContext, ErrorKind};
use crate::util::{contains_any, option_duration_millis};

/// A hint the engine applies to the next attempt of the failed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Multiply the stage's timeout by `factor` for the next attempt.
    ExtendTimeout { factor: f64 },
    /// Ask the executor to decode its response leniently.
    LenientDecode,
}

/// Decision returned by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Whether the strategy believes the failure is recoverable.
    pub success: bool,
    pub retry_recommended: bool,
    #[serde(
        rename = "delay_before_retry_ms",
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub delay_before_retry: Option<Duration>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RecoveryAction>,
    /// Id of the strategy that produced this result.
    pub strategy: String,
}

impl RecoveryResult {
    pub fn retry(strategy: &str, delay: Duration, message: impl Into<String>) -> Self {
        Self {
            success: true,
            retry_recommended: true,
            delay_before_retry: Some(delay),
            message: message.into(),
            action: None,
            strategy: strategy.to_string(),
        }
    }

    pub fn give_up(strategy: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            retry_recommended: false,
            delay_before_retry: None,
            message: message.into(),
            action: None,
            strategy: strategy.to_string(),
        }
    }

    pub fn with_action(mut self, action: RecoveryAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// A prioritized rule deciding whether and how to retry a classified failure.
pub trait RecoveryStrategy: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    /// Higher runs first.
    fn priority(&self) -> i32;
    fn can_handle(&self, ctx: &ErrorContext) -> bool;
    fn recover(&self, ctx: &ErrorContext) -> RecoveryResult;
}

/// Flat wait for quota or rate-limit flavoured api errors.
#[derive(Debug, Clone)]
pub struct QuotaBackoff {
    pub delay: Duration,
}

impl Default for QuotaBackoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
        }
    }
}

impl RecoveryStrategy for QuotaBackoff {
    fn id(&self) -> &str {
        "api-quota"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn can_handle(&self, ctx: &ErrorContext) -> bool {
        ctx.kind == ErrorKind::Api
            && contains_any(
                &ctx.message,
                &["quota", "rate limit", "429", "too many requests"],
            )
    }

    fn recover(&self, ctx: &ErrorContext) -> RecoveryResult {
        RecoveryResult::retry(
            self.id(),
            self.delay,
            format!(
                "Rate limited on stage {}; waiting {}s before retrying (consider another credential)",
                ctx.stage_index,
                self.delay.as_secs()
            ),
        )
    }
}

/// Exponential backoff for network errors.
#[derive(Debug, Clone)]
pub struct NetworkBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for NetworkBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl NetworkBackoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

impl RecoveryStrategy for NetworkBackoff {
    fn id(&self) -> &str {
        "network-retry"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn can_handle(&self, ctx: &ErrorContext) -> bool {
        ctx.kind == ErrorKind::Network
    }

    fn recover(&self, ctx: &ErrorContext) -> RecoveryResult {
        let delay = self.delay_for(ctx.attempt);
        RecoveryResult::retry(
            self.id(),
            delay,
            format!("Network error; retrying in {}ms", delay.as_millis()),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParsingFallback {
    pub delay: Duration,
}

impl Default for ParsingFallback {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }
}

impl RecoveryStrategy for ParsingFallback {
    fn id(&self) -> &str {
        "parsing-alternative"
    }

    fn priority(&self) -> i32 {
        75
    }

    fn can_handle(&self, ctx: &ErrorContext) -> bool {
        ctx.kind == ErrorKind::Parsing
    }

    fn recover(&self, _ctx: &ErrorContext) -> RecoveryResult {
        RecoveryResult::retry(
            self.id(),
            self.delay,
            "Response could not be decoded; retrying with lenient decoding",
        )
        .with_action(RecoveryAction::LenientDecode)
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutExtension {
    pub delay: Duration,
    pub factor: f64,
}

impl Default for TimeoutExtension {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            factor: 1.5,
        }
    }
}

impl RecoveryStrategy for TimeoutExtension {
    fn id(&self) -> &str {
        "timeout-extend"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn can_handle(&self, ctx: &ErrorContext) -> bool {
        ctx.kind == ErrorKind::Timeout
    }

    fn recover(&self, _ctx: &ErrorContext) -> RecoveryResult {
        RecoveryResult::retry(
            self.id(),
            self.delay,
            format!("Stage timed out; retrying with a {}x longer timeout", self.factor),
        )
        .with_action(RecoveryAction::ExtendTimeout {
            factor: self.factor,
        })
    }
}

/// Catch-all that retries until `max_attempts` attempts have failed.
#[derive(Debug, Clone)]
pub struct GenericRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for GenericRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

impl RecoveryStrategy for GenericRetry {
    fn id(&self) -> &str {
        "generic-retry"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn can_handle(&self, _ctx: &ErrorContext) -> bool {
        true
    }

    fn recover(&self, ctx: &ErrorContext) -> RecoveryResult {
        if ctx.attempt >= self.max_attempts {
            return RecoveryResult::give_up(
                self.id(),
                format!("Giving up after {} attempts", ctx.attempt),
            );
        }
        RecoveryResult::retry(
            self.id(),
            self.delay,
            format!(
                "Retrying (attempt {} of {})",
                ctx.attempt + 1,
                self.max_attempts
            ),
        )
    }
}
