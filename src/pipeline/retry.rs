//! Retry policy for JSON inference calls.
//!
//! ## Why a plan instead of a loop with mutation?
//!
//! Each attempt is fully described by its number: which prompt variant to
//! send and at which temperature. [`RetryPolicy::plan`] computes that
//! mapping, so the policy is testable without a service and [`call_json`]
//! only has to decide *whether* to go on.
//!
//! ## Failure classes
//!
//! | Outcome                 | Action                                           |
//! |-------------------------|--------------------------------------------------|
//! | valid JSON              | return                                           |
//! | no JSON / invalid JSON  | next attempt with the escalated prompt           |
//! | timeout                 | one extra try after `timeout_backoff`, then fail |
//! | rate limit / transport  | exponential backoff, consumes an attempt         |
//! | authentication          | fail immediately                                 |
//!
//! With 500 ms base backoff and two retries the transient wait sequence is
//! 500 ms → 1 s.

use crate::config::ExtractionConfig;
use crate::error::ServiceError;
use crate::payload::decode_json_object;
use crate::pipeline::vision::{ModelTier, VisionRequest, VisionService};
use crate::prompts;
use image::DynamicImage;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Which prompt an attempt sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    Initial,
    /// The prompt plus explicit feedback that the previous answer was unusable.
    Escalated,
}

/// Everything that varies between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptPlan {
    /// 1-indexed attempt number.
    pub number: u32,
    pub prompt: PromptVariant,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub temperature: f32,
    pub retry_temperature: f32,
    pub fixed_temperature: Option<f32>,
    pub backoff_ms: u64,
    pub timeout_backoff_ms: u64,
    pub call_timeout: Duration,
    pub max_tokens: usize,
}

impl RetryPolicy {
    /// Extraction calls: `1 + max_retries` attempts.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: config.max_retries + 1,
            temperature: config.temperature,
            retry_temperature: config.retry_temperature,
            fixed_temperature: config.fixed_temperature,
            backoff_ms: config.retry_backoff_ms,
            timeout_backoff_ms: config.timeout_backoff_ms,
            call_timeout: config.api_timeout(),
            max_tokens: config.max_tokens,
        }
    }

    /// Classification: a quick look, never retried for content.
    pub fn single_attempt(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: 1,
            ..Self::from_config(config)
        }
    }

    /// Plan for attempt `number`, or `None` once the budget is spent.
    pub fn plan(&self, number: u32) -> Option<AttemptPlan> {
        if number == 0 || number > self.max_attempts {
            return None;
        }
        let (prompt, temperature) = if number == 1 {
            (PromptVariant::Initial, self.temperature)
        } else {
            (PromptVariant::Escalated, self.retry_temperature)
        };
        Some(AttemptPlan {
            number,
            prompt,
            temperature: self.fixed_temperature.unwrap_or(temperature),
        })
    }

    /// Delay before attempt `number` after a transient failure.
    pub fn backoff(&self, number: u32) -> Duration {
        let exp = number.saturating_sub(2).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(2u64.pow(exp)))
    }
}

/// Result of a call whose attempts all ran.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonCallOutcome {
    /// The accepted object, or the last decoded (schema-invalid) one.
    pub value: Option<Value>,
    pub valid: bool,
    pub attempts: u32,
    /// Requests actually sent, including the timeout retry.
    pub calls: u32,
}

/// A transport failure that ended the call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub error: ServiceError,
    pub attempts: u32,
    pub calls: u32,
}

/// What to send, independent of the attempt.
#[derive(Debug, Clone, Copy)]
pub struct JsonCall<'a> {
    pub tier: ModelTier,
    pub image: &'a DynamicImage,
    pub system: &'a str,
    pub prompt: &'a str,
    /// Log prefix, e.g. `Page 3 segment 2`.
    pub label: &'a str,
}

/// Drive one JSON call through the retry policy.
///
/// `accept` decides whether a decoded object is good enough to stop.
pub async fn call_json<F>(
    service: &dyn VisionService,
    policy: &RetryPolicy,
    call: JsonCall<'_>,
    accept: F,
) -> Result<JsonCallOutcome, CallFailure>
where
    F: Fn(&Value) -> bool,
{
    let mut last_value: Option<Value> = None;
    let mut calls = 0u32;
    let mut timeout_retry_used = false;
    let mut number = 1u32;

    while let Some(plan) = policy.plan(number) {
        let prompt = match plan.prompt {
            PromptVariant::Initial => call.prompt.to_string(),
            PromptVariant::Escalated => prompts::escalate(call.prompt, plan.number),
        };
        let request = VisionRequest {
            tier: call.tier,
            image: call.image,
            system: call.system,
            prompt: &prompt,
            temperature: plan.temperature,
            max_tokens: policy.max_tokens,
        };

        calls += 1;
        let result = match timeout(policy.call_timeout, service.infer(request)).await {
            Ok(r) => r,
            Err(_) => Err(ServiceError::Timeout {
                secs: policy.call_timeout.as_secs(),
            }),
        };

        match result {
            Ok(raw) => match decode_json_object(&raw) {
                Some(value) if accept(&value) => {
                    debug!("{}: accepted on attempt {}", call.label, plan.number);
                    return Ok(JsonCallOutcome {
                        value: Some(value),
                        valid: true,
                        attempts: plan.number,
                        calls,
                    });
                }
                Some(value) => {
                    warn!(
                        "{}: attempt {}/{} returned JSON that violates the schema",
                        call.label, plan.number, policy.max_attempts
                    );
                    last_value = Some(value);
                }
                None => {
                    warn!(
                        "{}: attempt {}/{} returned no JSON object ({} chars)",
                        call.label,
                        plan.number,
                        policy.max_attempts,
                        raw.len()
                    );
                }
            },
            Err(ServiceError::Timeout { secs }) if !timeout_retry_used => {
                timeout_retry_used = true;
                warn!(
                    "{}: timed out after {}s, one more try in {}ms",
                    call.label, secs, policy.timeout_backoff_ms
                );
                sleep(Duration::from_millis(policy.timeout_backoff_ms)).await;
                continue;
            }
            Err(error) if error.is_transient() && policy.plan(number + 1).is_some() => {
                let backoff = policy.backoff(number + 1);
                warn!(
                    "{}: retry {}/{} after {}ms ({})",
                    call.label,
                    number,
                    policy.max_attempts - 1,
                    backoff.as_millis(),
                    error
                );
                sleep(backoff).await;
            }
            Err(error) => {
                return Err(CallFailure {
                    error,
                    attempts: plan.number,
                    calls,
                });
            }
        }
        number += 1;
    }

    Ok(JsonCallOutcome {
        value: last_value,
        valid: false,
        attempts: number.saturating_sub(1),
        calls,
    })
}
