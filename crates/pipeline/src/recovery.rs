//! Error classification and recovery policy.
//!
//! [`classify`] turns a [`StageError`] into an [`ErrorType`] by matching its
//! lower-cased message and type name against ordered pattern groups (first
//! match wins). [`ErrorHandler::handle_error`] then consults the per-type
//! [`RecoveryPolicy`] and a retry counter keyed by `(stage, error type)` to
//! decide between retrying with exponential backoff, falling back to a weaker
//! model tier, skipping the stage, or giving up.
//!
//! ## Policy table
//!
//! | Error type | Max retries | Base delay | Fallback | Truncate |
//! |------------|-------------|------------|----------|----------|
//! | `llm_timeout` | 3 | 2.0s | yes | no |
//! | `rate_limit` | 5 | 5.0s | yes | no |
//! | `api_error` | 3 | 1.0s | yes | no |
//! | `validation_error` | 2 | 0.5s | no | no |
//! | `syntax_error` | 2 | 0.5s | no | no |
//! | `context_length` | 2 | 1.0s | no | yes |
//! | `connection_error` | 3 | 2.0s | no | no |
//! | `authentication_error` | 0 | — | no | no |
//! | `unknown` | 1 | 1.0s | no | no |

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ModelTier, Stage, StageError, WorkflowState};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Failure taxonomy used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    LlmTimeout,
    RateLimit,
    ApiError,
    ValidationError,
    SyntaxError,
    ContextLength,
    ConnectionError,
    AuthenticationError,
    Unknown,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::LlmTimeout => "llm_timeout",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::ApiError => "api_error",
            ErrorType::ValidationError => "validation_error",
            ErrorType::SyntaxError => "syntax_error",
            ErrorType::ContextLength => "context_length",
            ErrorType::ConnectionError => "connection_error",
            ErrorType::AuthenticationError => "authentication_error",
            ErrorType::Unknown => "unknown",
        }
    }

    /// Default policy for this error type.
    pub fn policy(self) -> RecoveryPolicy {
        let p = |max_retries, base_delay_secs, allow_fallback, truncate_state| RecoveryPolicy {
            max_retries,
            base_delay: Duration::from_secs_f64(base_delay_secs),
            allow_fallback,
            truncate_state,
        };
        match self {
            ErrorType::LlmTimeout => p(3, 2.0, true, false),
            ErrorType::RateLimit => p(5, 5.0, true, false),
            ErrorType::ApiError => p(3, 1.0, true, false),
            ErrorType::ValidationError => p(2, 0.5, false, false),
            ErrorType::SyntaxError => p(2, 0.5, false, false),
            ErrorType::ContextLength => p(2, 1.0, false, true),
            ErrorType::ConnectionError => p(3, 2.0, false, false),
            ErrorType::AuthenticationError => p(0, 0.0, false, false),
            ErrorType::Unknown => p(1, 1.0, false, false),
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered pattern groups; the first group with a matching phrase or status
/// code wins.
const PATTERNS: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::LlmTimeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ErrorType::RateLimit,
        &["rate limit", "rate_limit", "ratelimit", "too many requests", "quota exceeded"],
    ),
    (
        ErrorType::ContextLength,
        &[
            "context length",
            "context_length",
            "context window",
            "maximum context",
            "token limit",
            "too many tokens",
            "prompt is too long",
        ],
    ),
    (
        ErrorType::AuthenticationError,
        &["authentication", "unauthorized", "invalid api key", "api key", "forbidden"],
    ),
    (
        ErrorType::ConnectionError,
        &["connection", "network", "unreachable", "dns", "broken pipe", "reset by peer"],
    ),
    (ErrorType::ValidationError, &["validation"]),
    (ErrorType::SyntaxError, &["syntax"]),
    (
        ErrorType::ApiError,
        &["api error", "apierror", "api_error", "internal server error", "service unavailable", "overloaded"],
    ),
];

/// HTTP status codes per group. Matched only as standalone tokens, so
/// `"HTTP 429"` counts and `"item_4290"` does not.
const STATUS_CODES: &[(ErrorType, &[&str])] = &[
    (ErrorType::RateLimit, &["429"]),
    (ErrorType::AuthenticationError, &["401", "403"]),
    (ErrorType::ApiError, &["500", "502", "503"]),
];

/// Classifies a failure by its message and type name.
pub fn classify(error: &StageError) -> ErrorType {
    let haystack = format!("{} {}", error.message, error.kind).to_lowercase();
    PATTERNS
        .iter()
        .map(|(t, phrases)| (*t, phrases.iter().any(|p| haystack.contains(p))))
        .find(|(t, phrase)| *phrase || codes_for(*t).iter().any(|c| contains_token(&haystack, c)))
        .map_or(ErrorType::Unknown, |(t, _)| t)
}

fn codes_for(error_type: ErrorType) -> &'static [&'static str] {
    STATUS_CODES
        .iter()
        .find(|(t, _)| *t == error_type)
        .map_or(&[][..], |(_, codes)| *codes)
}

/// `true` if `token` occurs in `haystack` with no word character on either side.
fn contains_token(haystack: &str, token: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(token).any(|(at, _)| {
        let before = haystack[..at].chars().next_back();
        let after = haystack[at + token.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

// ---------------------------------------------------------------------------
// Policy and configuration
// ---------------------------------------------------------------------------

/// How one error type is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every subsequent retry.
    pub base_delay: Duration,
    /// Whether to move to a weaker model tier once retries are exhausted.
    pub allow_fallback: bool,
    /// Whether to shrink oversized state fields before retrying.
    pub truncate_state: bool,
}

/// Engine-wide recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// When `false`, every failure propagates unchanged.
    pub enabled: bool,
    /// Upper bound applied on top of every per-type `max_retries`.
    pub global_max_retries: u32,
    /// Stages that are skipped (empty update) rather than failed once
    /// recovery is exhausted.
    pub skip_exhausted_stages: HashSet<Stage>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_max_retries: 3,
            skip_exhausted_stages: HashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Truncation
// ---------------------------------------------------------------------------

/// Appended to any field shortened by [`truncate_state`].
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Per-field character limits applied on context-length failures.
pub const PLAN_LIMIT: usize = 4000;
pub const CODE_LIMIT: usize = 8000;
pub const TEST_RESULTS_LIMIT: usize = 4000;
pub const REVIEW_FEEDBACK_LIMIT: usize = 2000;

/// Shortens `text` to at most `limit` characters, ending with
/// [`TRUNCATION_MARKER`]. Returns `true` if the text was changed.
pub fn truncate_field(text: &mut String, limit: usize) -> bool {
    if text.chars().count() <= limit {
        return false;
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.chars().count());
    let cut = text.char_indices().nth(keep).map_or(text.len(), |(i, _)| i);
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    true
}

/// Returns a copy of `state` with oversized text fields truncated, plus the
/// names of the fields that were shortened.
pub fn truncate_state(state: &WorkflowState) -> (WorkflowState, Vec<&'static str>) {
    let mut out = state.clone();
    let mut changed = Vec::new();
    if truncate_field(&mut out.plan, PLAN_LIMIT) {
        changed.push("plan");
    }
    if truncate_field(&mut out.code, CODE_LIMIT) {
        changed.push("code");
    }
    if truncate_field(&mut out.test_results, TEST_RESULTS_LIMIT) {
        changed.push("test_results");
    }
    if truncate_field(&mut out.review_feedback, REVIEW_FEEDBACK_LIMIT) {
        changed.push("review_feedback");
    }
    (out, changed)
}

// ---------------------------------------------------------------------------
// Recovery decision
// ---------------------------------------------------------------------------

/// The handler's decision for one failure.
///
/// The flags are informative rather than exclusive; callers check them in the
/// order retry, fallback, skip.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub error_type: ErrorType,
    pub should_retry: bool,
    pub should_fallback: bool,
    pub should_skip: bool,
    pub retry_delay: Duration,
    /// Retry attempt number this action schedules (1-based), or the exhausted count.
    pub current_retry: u32,
    pub max_retries: u32,
    pub fallback_model_tier: Option<ModelTier>,
    /// State to retry with, when recovery changed it.
    pub modified_state: Option<WorkflowState>,
    pub recovery_notes: Vec<String>,
}

impl RecoveryAction {
    fn give_up(error_type: ErrorType, current_retry: u32, max_retries: u32, note: String) -> Self {
        Self {
            error_type,
            should_retry: false,
            should_fallback: false,
            should_skip: false,
            retry_delay: Duration::ZERO,
            current_retry,
            max_retries,
            fallback_model_tier: None,
            modified_state: None,
            recovery_notes: vec![note],
        }
    }

    /// Retry delay in (fractional) seconds.
    pub fn retry_delay_seconds(&self) -> f64 {
        self.retry_delay.as_secs_f64()
    }
}

/// Classifies failures and tracks retry counters for one workflow run.
///
/// Counters live behind a mutex so a handler can be shared between stages;
/// the recommended scope is one handler per task.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    config: RecoveryConfig,
    counters: Mutex<HashMap<(Stage, ErrorType), u32>>,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Decides how to recover from `error` raised by `stage`.
    pub fn handle_error(
        &self,
        error: &StageError,
        stage: Stage,
        state: &WorkflowState,
        current_model_tier: &str,
    ) -> RecoveryAction {
        let error_type = classify(error);
        let policy = error_type.policy();
        let max_retries = policy.max_retries.min(self.config.global_max_retries);

        if !self.config.enabled {
            return RecoveryAction::give_up(
                error_type,
                0,
                max_retries,
                "Error recovery is disabled".to_string(),
            );
        }

        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let count = counters.entry((stage, error_type)).or_insert(0);

        if *count >= max_retries {
            let exhausted = *count;
            drop(counters);
            return self.exhausted(error_type, stage, exhausted, max_retries, policy, current_model_tier);
        }

        let attempt = *count;
        *count += 1;
        drop(counters);

        let delay = policy.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let mut notes = vec![format!(
            "Retry {}/{} for {} in {} after {:.2}s",
            attempt + 1,
            max_retries,
            error_type,
            stage,
            delay.as_secs_f64()
        )];

        let modified_state = if policy.truncate_state {
            let (truncated, fields) = truncate_state(state);
            if !fields.is_empty() {
                notes.push(format!("Truncated oversized fields: {}", fields.join(", ")));
            }
            Some(truncated)
        } else {
            None
        };

        tracing::info!(
            stage = %stage,
            error_type = %error_type,
            attempt = attempt + 1,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        RecoveryAction {
            error_type,
            should_retry: true,
            should_fallback: false,
            should_skip: false,
            retry_delay: delay,
            current_retry: attempt + 1,
            max_retries,
            fallback_model_tier: None,
            modified_state,
            recovery_notes: notes,
        }
    }

    fn exhausted(
        &self,
        error_type: ErrorType,
        stage: Stage,
        count: u32,
        max_retries: u32,
        policy: RecoveryPolicy,
        current_model_tier: &str,
    ) -> RecoveryAction {
        if policy.allow_fallback {
            if let Some(tier) = ModelTier::fallback_from_name(current_model_tier) {
                tracing::warn!(
                    stage = %stage,
                    error_type = %error_type,
                    from = current_model_tier,
                    to = %tier,
                    "Retries exhausted; falling back to weaker model tier"
                );
                let mut action = RecoveryAction::give_up(
                    error_type,
                    count,
                    max_retries,
                    format!("Falling back from {current_model_tier} to {tier} for {stage}"),
                );
                action.should_fallback = true;
                action.fallback_model_tier = Some(tier);
                return action;
            }
        }

        let skip = self.config.skip_exhausted_stages.contains(&stage);
        tracing::warn!(
            stage = %stage,
            error_type = %error_type,
            retries = count,
            skip,
            "Recovery exhausted"
        );
        let note = if skip {
            format!("Recovery exhausted for {error_type} in {stage}; skipping stage")
        } else {
            format!("Recovery exhausted for {error_type} in {stage} after {count} retries")
        };
        let mut action = RecoveryAction::give_up(error_type, count, max_retries, note);
        action.should_skip = skip;
        action
    }

    /// Clears every retry counter for `stage` (called on its first success
    /// after failures, and before re-running it on a fallback tier).
    pub fn reset_stage(&self, stage: Stage) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.retain(|(s, _), _| *s != stage);
    }

    /// Clears every retry counter.
    pub fn reset_all(&self) {
        self.counters.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Current retry count for `(stage, error_type)`.
    pub fn retry_count(&self, stage: Stage, error_type: ErrorType) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(stage, error_type))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskId;

    fn err(kind: &str, message: &str) -> StageError {
        StageError::new(kind, message)
    }

    fn state() -> WorkflowState {
        WorkflowState::new(TaskId::new(1), "task")
    }

    #[test]
    fn test_classify_pattern_groups() {
        assert_eq!(classify(&err("Error", "request timed out")), ErrorType::LlmTimeout);
        assert_eq!(classify(&err("RateLimitError", "slow down")), ErrorType::RateLimit);
        assert_eq!(
            classify(&err("BadRequest", "maximum context length is 200000 tokens")),
            ErrorType::ContextLength
        );
        assert_eq!(classify(&err("Error", "Invalid API key")), ErrorType::AuthenticationError);
        assert_eq!(classify(&err("Error", "connection refused")), ErrorType::ConnectionError);
        assert_eq!(classify(&err("ValidationError", "field missing")), ErrorType::ValidationError);
        assert_eq!(classify(&err("Error", "SyntaxError in generated code")), ErrorType::SyntaxError);
        assert_eq!(classify(&err("APIError", "upstream failed")), ErrorType::ApiError);
        assert_eq!(classify(&err("Error", "something odd")), ErrorType::Unknown);
    }

    #[test]
    fn test_status_codes_match_only_as_whole_tokens() {
        assert_eq!(classify(&err("HTTPError", "HTTP 429 from upstream")), ErrorType::RateLimit);
        assert_eq!(classify(&err("Error", "status=401")), ErrorType::AuthenticationError);
        assert_eq!(classify(&err("Error", "got 503: try later")), ErrorType::ApiError);

        assert_eq!(classify(&err("ValueError", "expected 4013 rows")), ErrorType::Unknown);
        assert_eq!(classify(&err("KeyError", "missing key item_5003")), ErrorType::Unknown);
        assert_eq!(classify(&err("Error", "parsed 1429 lines then stopped")), ErrorType::Unknown);
    }

    #[test]
    fn test_first_matching_group_wins() {
        // Mentions both a timeout and a connection; timeout is checked first.
        assert_eq!(
            classify(&err("Error", "connection timeout")),
            ErrorType::LlmTimeout
        );
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let e = err("Error", "connection refused");
        let delays: Vec<Duration> = (0..3)
            .map(|_| handler.handle_error(&e, Stage::Coder, &state(), "sonnet").retry_delay)
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_exhausted_retries_fall_back_one_tier() {
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let e = err("Error", "request timed out");
        for _ in 0..3 {
            assert!(handler.handle_error(&e, Stage::Planner, &state(), "opus").should_retry);
        }
        let action = handler.handle_error(&e, Stage::Planner, &state(), "opus");
        assert!(action.should_fallback);
        assert!(!action.should_retry);
        assert_eq!(action.fallback_model_tier, Some(ModelTier::Sonnet));
    }

    #[test]
    fn test_no_fallback_past_haiku() {
        let handler = ErrorHandler::new(RecoveryConfig {
            global_max_retries: 0,
            ..RecoveryConfig::default()
        });
        let action = handler.handle_error(&err("Error", "timed out"), Stage::Coder, &state(), "haiku");
        assert!(!action.should_fallback);
        assert!(!action.should_retry);
        assert_eq!(action.fallback_model_tier, None);
    }

    #[test]
    fn test_authentication_is_never_retried() {
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let action =
            handler.handle_error(&err("AuthError", "unauthorized"), Stage::Coder, &state(), "opus");
        assert_eq!(action.error_type, ErrorType::AuthenticationError);
        assert!(!action.should_retry && !action.should_fallback);
    }

    #[test]
    fn test_disabled_recovery_is_a_no_op() {
        let handler = ErrorHandler::new(RecoveryConfig {
            enabled: false,
            ..RecoveryConfig::default()
        });
        let action = handler.handle_error(&err("Error", "timed out"), Stage::Coder, &state(), "opus");
        assert!(!action.should_retry && !action.should_fallback && !action.should_skip);
        assert!(action.recovery_notes[0].contains("disabled"));
        assert_eq!(handler.retry_count(Stage::Coder, ErrorType::LlmTimeout), 0);
    }

    #[test]
    fn test_context_length_truncates_plan() {
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let mut s = state();
        s.plan = "p".repeat(10_000);
        let action = handler.handle_error(
            &err("BadRequest", "context length exceeded"),
            Stage::Coder,
            &s,
            "sonnet",
        );
        assert!(action.should_retry);
        let plan = &action.modified_state.unwrap().plan;
        assert!(plan.chars().count() <= 4001);
        assert!(plan.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut text = "é".repeat(5000);
        assert!(truncate_field(&mut text, 4000));
        assert_eq!(text.chars().count(), 4000);
        let mut short = "short".to_string();
        assert!(!truncate_field(&mut short, 4000));
    }

    #[test]
    fn test_skip_on_exhaustion_for_configured_stage() {
        let mut skip = HashSet::new();
        skip.insert(Stage::Tester);
        let handler = ErrorHandler::new(RecoveryConfig {
            skip_exhausted_stages: skip,
            ..RecoveryConfig::default()
        });
        let e = err("SyntaxError", "bad test file");
        handler.handle_error(&e, Stage::Tester, &state(), "sonnet");
        handler.handle_error(&e, Stage::Tester, &state(), "sonnet");
        let action = handler.handle_error(&e, Stage::Tester, &state(), "sonnet");
        assert!(action.should_skip);
    }

    #[test]
    fn test_reset_stage_clears_only_that_stage() {
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let e = err("Error", "timed out");
        handler.handle_error(&e, Stage::Coder, &state(), "opus");
        handler.handle_error(&e, Stage::Tester, &state(), "opus");
        handler.reset_stage(Stage::Coder);
        assert_eq!(handler.retry_count(Stage::Coder, ErrorType::LlmTimeout), 0);
        assert_eq!(handler.retry_count(Stage::Tester, ErrorType::LlmTimeout), 1);
        handler.reset_all();
        assert_eq!(handler.retry_count(Stage::Tester, ErrorType::LlmTimeout), 0);
    }
}
