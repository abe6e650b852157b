//! Shared value types for the Kiln workflow domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (e.g. confidence is in `[0.0, 1.0]`, the
//! model-tier fallback chain only ever moves towards cheaper tiers) and
//! participate in domain computations.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// One step of the code-generation pipeline.
///
/// The graph is fixed: `planner → coder → tester → reviewer`, with the reviewer
/// able to loop back to the coder. The virtual START/END markers are not stages;
/// see [`crate::routing::Next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Turns the task description into an implementation plan.
    Planner,
    /// Writes (or revises) code from the plan and any review feedback.
    Coder,
    /// Produces and analyses tests for the generated code.
    Tester,
    /// Issues a verdict on the result (single reviewer or council).
    Reviewer,
}

impl Stage {
    /// All stages in their fixed pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Planner, Stage::Coder, Stage::Tester, Stage::Reviewer];

    /// Stable lower-case name used in logs, events, and checkpoints.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Coder => "coder",
            Stage::Tester => "tester",
            Stage::Reviewer => "reviewer",
        }
    }

    /// The stage that follows this one on the happy path, if any.
    pub fn successor(self) -> Option<Stage> {
        match self {
            Stage::Planner => Some(Stage::Coder),
            Stage::Coder => Some(Stage::Tester),
            Stage::Tester => Some(Stage::Reviewer),
            Stage::Reviewer => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planner" => Ok(Stage::Planner),
            "coder" => Ok(Stage::Coder),
            "tester" => Ok(Stage::Tester),
            "reviewer" => Ok(Stage::Reviewer),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Model tiers
// ---------------------------------------------------------------------------

/// Capability tier of the model backing a stage or judge.
///
/// The core never selects concrete models; it only knows the ordering used for
/// fallback: `opus → sonnet → haiku → (none)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Most capable tier.
    Opus,
    /// Balanced tier; the default for every stage.
    #[default]
    Sonnet,
    /// Cheapest tier; the end of the fallback chain.
    Haiku,
}

impl ModelTier {
    /// Stable lower-case tier name.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Opus => "opus",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Haiku => "haiku",
        }
    }

    /// The next weaker tier, or `None` once the chain is exhausted.
    pub fn fallback(self) -> Option<ModelTier> {
        match self {
            ModelTier::Opus => Some(ModelTier::Sonnet),
            ModelTier::Sonnet => Some(ModelTier::Haiku),
            ModelTier::Haiku => None,
        }
    }

    /// Fallback target for a tier given by name.
    ///
    /// Unknown names fall back to [`ModelTier::Haiku`].
    pub fn fallback_from_name(name: &str) -> Option<ModelTier> {
        match name.parse::<ModelTier>() {
            Ok(tier) => tier.fallback(),
            Err(_) => Some(ModelTier::Haiku),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opus" => Ok(ModelTier::Opus),
            "sonnet" => Ok(ModelTier::Sonnet),
            "haiku" => Ok(ModelTier::Haiku),
            other => Err(format!("unknown model tier '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Token and cost types
// ---------------------------------------------------------------------------

/// Number of tokens consumed in an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenCount(u64);

impl TokenCount {
    /// Creates a [`TokenCount`] from a raw integer.
    pub fn new(count: u64) -> Self {
        Self(count)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TokenCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for TokenCount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::iter::Sum for TokenCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, t| acc + t)
    }
}

// ---------------------------------------------------------------------------

/// Monetary cost of LLM token usage, expressed in US dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenCost(f64);

impl TokenCost {
    /// Creates a [`TokenCost`] from a raw float value (USD).
    ///
    /// Returns `None` if `value` is negative, infinite, or NaN.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value >= 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Creates a [`TokenCost`] of exactly zero.
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Returns the underlying `f64` value (USD).
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for TokenCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.6}", self.0)
    }
}

impl std::ops::Add for TokenCost {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::iter::Sum for TokenCost {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, c| acc + c)
    }
}

// ---------------------------------------------------------------------------
// Score types
// ---------------------------------------------------------------------------

/// A confidence value in the range `[0.0, 1.0]`.
///
/// Produced by each judge and by the council's weighted mean.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Creates a [`Confidence`], returning `None` if `value` is outside
    /// the valid range `[0.0, 1.0]`.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Creates a [`Confidence`] by clamping `value` into `[0.0, 1.0]`.
    ///
    /// Non-finite input maps to `0.0`.
    pub fn clamped(value: f64) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self(0.0)
        }
    }

    /// Zero confidence.
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Returns the score as an `f64` in `[0.0, 1.0]`.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Confidence::new(value).ok_or_else(|| format!("confidence {value} outside [0.0, 1.0]"))
    }
}

impl From<Confidence> for f64 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_chain_is_monotonic_and_terminates() {
        let mut tier = Some(ModelTier::Opus);
        let mut seen = Vec::new();
        while let Some(t) = tier {
            assert!(!seen.contains(&t), "fallback chain revisited {t}");
            seen.push(t);
            tier = t.fallback();
        }
        assert_eq!(seen, vec![ModelTier::Opus, ModelTier::Sonnet, ModelTier::Haiku]);
    }

    #[test]
    fn test_unknown_tier_falls_back_to_haiku() {
        assert_eq!(ModelTier::fallback_from_name("gpt-large"), Some(ModelTier::Haiku));
        assert_eq!(ModelTier::fallback_from_name("HAIKU"), None);
        assert_eq!(ModelTier::fallback_from_name("opus"), Some(ModelTier::Sonnet));
    }

    #[test]
    fn test_confidence_rejects_out_of_range() {
        assert!(Confidence::new(1.01).is_none());
        assert!(Confidence::new(f64::NAN).is_none());
        assert_eq!(Confidence::clamped(-3.0).as_f64(), 0.0);
        assert!(serde_json::from_str::<Confidence>("1.5").is_err());
    }

    #[test]
    fn test_stage_round_trips_through_name() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!(Stage::Reviewer.successor(), None);
    }
}
