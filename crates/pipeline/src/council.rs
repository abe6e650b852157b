//! Council verdict aggregation.
//!
//! A council is a panel of independently invoked judges, each with a weight.
//! [`aggregate`] combines their verdicts into one [`CouncilResult`]:
//!
//! 1. Vote weight per verdict; the leader is the heaviest verdict, ties broken
//!    conservatively (`REJECT > REVISE > APPROVE`).
//! 2. Council confidence is the weight-averaged judge confidence.
//! 3. An APPROVE lead must clear the confidence threshold on both its vote
//!    weight and the council confidence, or it is downgraded to REVISE.
//! 4. A REJECT lead is downgraded to REVISE unless every judge rejected, when
//!    the council requires unanimous rejection.
//! 5. A REVISE lead passes through unchanged.
//!
//! Judges that fail are never dropped; see [`JudgeVerdict::from_failure`].

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Confidence, JudgeName, ModelTier, PipelineError, StageError, TokenCost, TokenCount};

/// Allowed deviation of the summed judge weights from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Default confidence floor for approval.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Verdicts and issues
// ---------------------------------------------------------------------------

/// Outcome of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Ship it.
    Approve,
    /// Send back to the coder with feedback.
    Revise,
    /// Abandon this attempt.
    Reject,
}

impl Verdict {
    /// Upper-case token as it appears in review text.
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "APPROVE",
            Verdict::Revise => "REVISE",
            Verdict::Reject => "REJECT",
        }
    }

    /// Rank used to break ties: higher is more conservative.
    fn conservatism(self) -> u8 {
        match self {
            Verdict::Approve => 0,
            Verdict::Revise => 1,
            Verdict::Reject => 2,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Verdict::Approve),
            "REVISE" => Ok(Verdict::Revise),
            "REJECT" => Ok(Verdict::Reject),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

/// Severity of a review finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl IssueSeverity {
    const ALL: [IssueSeverity; 4] = [
        IssueSeverity::Critical,
        IssueSeverity::High,
        IssueSeverity::Medium,
        IssueSeverity::Low,
    ];

    fn as_str(self) -> &'static str {
        match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::High => "high",
            IssueSeverity::Medium => "medium",
            IssueSeverity::Low => "low",
        }
    }
}

/// A single finding raised by a judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    /// Free-form category tag (e.g. `"security"`, `"correctness"`).
    pub category: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One seat on the council.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub name: JudgeName,
    /// Display label (e.g. `"Security Auditor"`).
    pub persona: String,
    /// Opaque to the engine; passed through to the judge implementation.
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model_tier: ModelTier,
    /// Share of the vote in `[0.0, 1.0]`; a council's weights sum to 1.0.
    pub weight: f64,
}

/// Council membership and aggregation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilConfig {
    pub judges: Vec<JudgeConfig>,
    pub confidence_threshold: f64,
    /// Only a unanimous REJECT survives aggregation.
    pub require_unanimous_reject: bool,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            judges: default_panel(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            require_unanimous_reject: true,
        }
    }
}

impl CouncilConfig {
    /// Validates the council, failing fast on programming errors:
    /// no judges, empty or duplicate names, weights outside `[0, 1]`, weights
    /// not summing to 1.0 ± 0.01, or a threshold outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.judges.is_empty() {
            return Err(PipelineError::config("council must have at least one judge"));
        }
        let mut names = HashSet::new();
        for judge in &self.judges {
            if judge.name.as_str().is_empty() {
                return Err(PipelineError::config("judge name must not be empty"));
            }
            if !names.insert(judge.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate judge name '{}'",
                    judge.name
                )));
            }
            if !judge.weight.is_finite() || !(0.0..=1.0).contains(&judge.weight) {
                return Err(PipelineError::config(format!(
                    "judge '{}' weight {} outside [0.0, 1.0]",
                    judge.name, judge.weight
                )));
            }
        }
        let sum: f64 = self.judges.iter().map(|j| j.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PipelineError::config(format!(
                "judge weights must sum to 1.0 (±{WEIGHT_SUM_TOLERANCE}), got {sum:.4}"
            )));
        }
        if !self.confidence_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.confidence_threshold)
        {
            return Err(PipelineError::config(format!(
                "confidence threshold {} outside [0.0, 1.0]",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    /// Looks up a judge's configuration by name.
    pub fn judge(&self, name: &JudgeName) -> Option<&JudgeConfig> {
        self.judges.iter().find(|j| &j.name == name)
    }
}

/// The built-in three-judge panel.
pub fn default_panel() -> Vec<JudgeConfig> {
    let judge = |name: &'static str, persona: &str, prompt: &str, tier: ModelTier, weight: f64| {
        JudgeConfig {
            name: JudgeName::from_literal(name),
            persona: persona.to_string(),
            system_prompt: prompt.to_string(),
            model_tier: tier,
            weight,
        }
    };
    vec![
        judge(
            "security",
            "Security Auditor",
            "Review the change for vulnerabilities, unsafe input handling, and secret exposure.",
            ModelTier::Opus,
            0.35,
        ),
        judge(
            "architecture",
            "Architecture Reviewer",
            "Review the change for design quality, maintainability, and fit with the plan.",
            ModelTier::Sonnet,
            0.30,
        ),
        judge(
            "testing",
            "Test Engineer",
            "Review the change for test coverage, edge cases, and correctness of results.",
            ModelTier::Sonnet,
            0.35,
        ),
    ]
}

// ---------------------------------------------------------------------------
// Judge verdicts
// ---------------------------------------------------------------------------

/// Resource usage reported for one judge invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeUsage {
    pub tokens: TokenCount,
    pub latency_ms: u64,
    pub cost: TokenCost,
}

/// One judge's verdict. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub judge_name: JudgeName,
    pub verdict: Verdict,
    pub confidence: Confidence,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub usage: JudgeUsage,
}

impl JudgeVerdict {
    /// Creates a verdict with no issues, strengths, or usage recorded.
    pub fn new(judge_name: JudgeName, verdict: Verdict, confidence: Confidence) -> Self {
        Self {
            judge_name,
            verdict,
            confidence,
            issues: Vec::new(),
            reasoning: String::new(),
            strengths: Vec::new(),
            action_items: Vec::new(),
            usage: JudgeUsage::default(),
        }
    }

    /// Conservative stand-in for a judge that failed: REVISE at zero
    /// confidence with one issue describing the failure.
    pub fn from_failure(judge_name: JudgeName, error: &StageError) -> Self {
        let description = format!("Judge '{judge_name}' failed to produce a verdict: {error}");
        Self {
            issues: vec![Issue {
                severity: IssueSeverity::High,
                category: "judge_error".to_string(),
                description: description.clone(),
            }],
            reasoning: description,
            ..Self::new(judge_name, Verdict::Revise, Confidence::zero())
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// How the judges agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    /// Every judge returned the same verdict.
    Unanimous,
    /// A verdict held more than half the vote weight.
    Majority,
    /// Two verdicts had equal top weight; the conservative one won.
    TieBroken,
    /// A downgrade happened, or the leader held only a plurality.
    Dissent,
}

impl ConsensusType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsensusType::Unanimous => "unanimous",
            ConsensusType::Majority => "majority",
            ConsensusType::TieBroken => "tie_broken",
            ConsensusType::Dissent => "dissent",
        }
    }
}

impl std::fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summed vote weight per verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub approve: f64,
    pub revise: f64,
    pub reject: f64,
}

impl VoteTally {
    fn add(&mut self, verdict: Verdict, weight: f64) {
        match verdict {
            Verdict::Approve => self.approve += weight,
            Verdict::Revise => self.revise += weight,
            Verdict::Reject => self.reject += weight,
        }
    }

    /// Weight behind `verdict`.
    pub fn weight(&self, verdict: Verdict) -> f64 {
        match verdict {
            Verdict::Approve => self.approve,
            Verdict::Revise => self.revise,
            Verdict::Reject => self.reject,
        }
    }

    /// The leading verdict and whether its lead is shared with another verdict.
    ///
    /// Equal weights resolve to the more conservative verdict.
    pub fn leader(&self) -> (Verdict, bool) {
        let mut ranked = [Verdict::Reject, Verdict::Revise, Verdict::Approve];
        ranked.sort_by(|a, b| {
            self.weight(*b)
                .partial_cmp(&self.weight(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.conservatism().cmp(&a.conservatism()))
        });
        let top = ranked[0];
        let tied = (self.weight(top) - self.weight(ranked[1])).abs() < EPSILON
            && self.weight(top) > 0.0;
        (top, tied)
    }
}

/// The council's combined decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilResult {
    pub final_verdict: Verdict,
    /// Leading verdict before any threshold or unanimity downgrade.
    pub majority_verdict: Verdict,
    pub confidence_score: Confidence,
    pub consensus_type: ConsensusType,
    /// Judges whose verdict differs from the pre-downgrade leader.
    pub dissenting_opinions: Vec<JudgeName>,
    pub vote_tally: VoteTally,
    pub conclusion: String,
    pub verdicts: Vec<JudgeVerdict>,
    /// Wall-clock duration of the whole council review.
    pub elapsed_ms: u64,
    pub total_tokens: TokenCount,
    pub total_cost: TokenCost,
}

impl CouncilResult {
    /// Compact JSON for `metadata.council`: decisions and usage, no reasoning text.
    pub fn detail(&self) -> Value {
        let judges: Vec<Value> = self
            .verdicts
            .iter()
            .map(|v| {
                json!({
                    "judge": v.judge_name,
                    "verdict": v.verdict,
                    "confidence": v.confidence,
                    "issues": v.issues.len(),
                })
            })
            .collect();
        json!({
            "final_verdict": self.final_verdict,
            "majority_verdict": self.majority_verdict,
            "confidence_score": self.confidence_score,
            "consensus_type": self.consensus_type,
            "dissenting_opinions": self.dissenting_opinions,
            "vote_tally": self.vote_tally,
            "judges": judges,
            "elapsed_ms": self.elapsed_ms,
            "total_tokens": self.total_tokens,
            "total_cost": self.total_cost,
        })
    }
}

/// Combines judge verdicts under `config`'s weights and policy.
///
/// Verdicts from judges not in `config` carry zero weight.
pub fn aggregate(config: &CouncilConfig, verdicts: Vec<JudgeVerdict>) -> CouncilResult {
    let mut tally = VoteTally::default();
    let mut confidence = 0.0;
    for v in &verdicts {
        let weight = match config.judge(&v.judge_name) {
            Some(judge) => judge.weight,
            None => {
                tracing::warn!(judge = %v.judge_name, "Verdict from unconfigured judge ignored");
                0.0
            }
        };
        tally.add(v.verdict, weight);
        confidence += weight * v.confidence.as_f64();
    }
    let confidence = Confidence::clamped(confidence);
    let threshold = config.confidence_threshold;

    let (majority, tied) = if verdicts.is_empty() {
        (Verdict::Revise, false)
    } else {
        tally.leader()
    };
    let unanimous = !verdicts.is_empty() && verdicts.iter().all(|v| v.verdict == majority);

    let final_verdict = match majority {
        Verdict::Approve
            if tally.approve + EPSILON < threshold || confidence.as_f64() + EPSILON < threshold =>
        {
            Verdict::Revise
        }
        Verdict::Reject
            if config.require_unanimous_reject
                && !verdicts.iter().all(|v| v.verdict == Verdict::Reject) =>
        {
            Verdict::Revise
        }
        other => other,
    };
    let downgraded = final_verdict != majority;

    let consensus_type = if unanimous {
        ConsensusType::Unanimous
    } else if downgraded || verdicts.is_empty() {
        ConsensusType::Dissent
    } else if tied {
        ConsensusType::TieBroken
    } else if tally.weight(majority) <= 0.5 + EPSILON {
        ConsensusType::Dissent
    } else {
        ConsensusType::Majority
    };

    let dissenting_opinions = verdicts
        .iter()
        .filter(|v| v.verdict != majority)
        .map(|v| v.judge_name.clone())
        .collect();

    tracing::debug!(
        majority = %majority,
        final_verdict = %final_verdict,
        consensus = %consensus_type,
        confidence = confidence.as_f64(),
        "Council votes aggregated"
    );

    let mut result = CouncilResult {
        final_verdict,
        majority_verdict: majority,
        confidence_score: confidence,
        consensus_type,
        dissenting_opinions,
        vote_tally: tally,
        conclusion: String::new(),
        total_tokens: verdicts.iter().map(|v| v.usage.tokens).sum(),
        total_cost: verdicts.iter().map(|v| v.usage.cost).sum(),
        elapsed_ms: verdicts.iter().map(|v| v.usage.latency_ms).max().unwrap_or(0),
        verdicts,
    };
    result.conclusion = conclusion(config, &result);
    result
}

/// Human-readable summary of a council decision.
pub fn conclusion(config: &CouncilConfig, result: &CouncilResult) -> String {
    let mut out = String::from("Council Review\n==============\n");
    for v in &result.verdicts {
        let persona = config
            .judge(&v.judge_name)
            .map_or(v.judge_name.as_str(), |j| j.persona.as_str());
        out.push_str(&format!(
            "- {persona} ({}): {} (confidence {})\n",
            v.judge_name, v.verdict, v.confidence
        ));
    }

    let counts: Vec<String> = IssueSeverity::ALL
        .iter()
        .map(|sev| {
            let n = result
                .verdicts
                .iter()
                .flat_map(|v| &v.issues)
                .filter(|i| i.severity == *sev)
                .count();
            format!("{n} {}", sev.as_str())
        })
        .collect();
    out.push_str(&format!("\nIssues: {}\n", counts.join(", ")));

    out.push_str(&format!(
        "\nFinal verdict: {} (consensus: {}, confidence: {})\n",
        result.final_verdict, result.consensus_type, result.confidence_score
    ));
    if !result.dissenting_opinions.is_empty() {
        let names: Vec<&str> = result.dissenting_opinions.iter().map(JudgeName::as_str).collect();
        out.push_str(&format!("Dissenting: {}\n", names.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> JudgeName {
        JudgeName::new(s).unwrap()
    }

    fn council(weights: &[f64]) -> CouncilConfig {
        CouncilConfig {
            judges: weights
                .iter()
                .enumerate()
                .map(|(i, w)| JudgeConfig {
                    name: name(&format!("judge{}", i + 1)),
                    persona: format!("Persona {}", i + 1),
                    system_prompt: String::new(),
                    model_tier: ModelTier::Sonnet,
                    weight: *w,
                })
                .collect(),
            confidence_threshold: 0.7,
            require_unanimous_reject: true,
        }
    }

    fn votes(cast: &[(Verdict, f64)]) -> Vec<JudgeVerdict> {
        cast.iter()
            .enumerate()
            .map(|(i, (v, c))| {
                JudgeVerdict::new(name(&format!("judge{}", i + 1)), *v, Confidence::new(*c).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_weighted_approve_below_threshold_is_downgraded() {
        let config = council(&[0.35, 0.30, 0.35]);
        let result = aggregate(
            &config,
            votes(&[(Verdict::Approve, 1.0), (Verdict::Approve, 1.0), (Verdict::Revise, 0.6)]),
        );
        assert_eq!(result.final_verdict, Verdict::Revise);
        assert_eq!(result.majority_verdict, Verdict::Approve);
        assert_eq!(result.consensus_type, ConsensusType::Dissent);
        assert_eq!(result.dissenting_opinions, vec![name("judge3")]);
        assert!((result.confidence_score.as_f64() - 0.86).abs() < 1e-9);
    }

    #[test]
    fn test_unanimous_verdict_has_no_dissent() {
        let config = council(&[0.35, 0.30, 0.35]);
        for verdict in [Verdict::Approve, Verdict::Revise, Verdict::Reject] {
            let result = aggregate(&config, votes(&[(verdict, 0.9), (verdict, 0.8), (verdict, 0.95)]));
            assert_eq!(result.final_verdict, verdict);
            assert_eq!(result.consensus_type, ConsensusType::Unanimous);
            assert!(result.dissenting_opinions.is_empty());
        }
    }

    #[test]
    fn test_non_unanimous_reject_is_downgraded() {
        let config = council(&[0.4, 0.4, 0.2]);
        let result = aggregate(
            &config,
            votes(&[(Verdict::Reject, 0.9), (Verdict::Reject, 0.9), (Verdict::Approve, 0.9)]),
        );
        assert_eq!(result.final_verdict, Verdict::Revise);
        assert_eq!(result.consensus_type, ConsensusType::Dissent);
        assert_eq!(result.dissenting_opinions, vec![name("judge3")]);
    }

    #[test]
    fn test_reject_majority_kept_when_unanimity_not_required() {
        let mut config = council(&[0.4, 0.4, 0.2]);
        config.require_unanimous_reject = false;
        let result = aggregate(
            &config,
            votes(&[(Verdict::Reject, 0.9), (Verdict::Reject, 0.9), (Verdict::Approve, 0.9)]),
        );
        assert_eq!(result.final_verdict, Verdict::Reject);
        assert_eq!(result.consensus_type, ConsensusType::Majority);
    }

    #[test]
    fn test_low_confidence_approve_majority_is_downgraded() {
        let config = council(&[0.4, 0.4, 0.2]);
        let result = aggregate(
            &config,
            votes(&[(Verdict::Approve, 0.5), (Verdict::Approve, 0.5), (Verdict::Revise, 0.9)]),
        );
        assert_eq!(result.vote_tally.approve, 0.8);
        assert_eq!(result.final_verdict, Verdict::Revise);
    }

    #[test]
    fn test_confident_approve_majority_passes() {
        let config = council(&[0.4, 0.4, 0.2]);
        let result = aggregate(
            &config,
            votes(&[(Verdict::Approve, 0.9), (Verdict::Approve, 0.9), (Verdict::Revise, 0.5)]),
        );
        assert_eq!(result.final_verdict, Verdict::Approve);
        assert_eq!(result.consensus_type, ConsensusType::Majority);
    }

    #[test]
    fn test_tie_prefers_conservative_verdict() {
        let config = council(&[0.5, 0.5]);
        let result = aggregate(&config, votes(&[(Verdict::Approve, 0.9), (Verdict::Revise, 0.9)]));
        assert_eq!(result.majority_verdict, Verdict::Revise);
        assert_eq!(result.final_verdict, Verdict::Revise);
        assert_eq!(result.consensus_type, ConsensusType::TieBroken);
        assert_eq!(result.dissenting_opinions, vec![name("judge1")]);
    }

    #[test]
    fn test_three_way_split_is_deterministic() {
        let config = council(&[0.4, 0.3, 0.3]);
        let result = aggregate(
            &config,
            votes(&[(Verdict::Approve, 0.9), (Verdict::Revise, 0.9), (Verdict::Reject, 0.9)]),
        );
        assert_eq!(result.majority_verdict, Verdict::Approve);
        assert_eq!(result.final_verdict, Verdict::Revise);
        assert_eq!(result.consensus_type, ConsensusType::Dissent);
        assert_eq!(result.dissenting_opinions.len(), 2);
    }

    #[test]
    fn test_failed_judge_counts_as_conservative_revise() {
        let failed = JudgeVerdict::from_failure(name("judge2"), &StageError::new("Timeout", "no reply"));
        assert_eq!(failed.verdict, Verdict::Revise);
        assert_eq!(failed.confidence.as_f64(), 0.0);
        assert_eq!(failed.issues.len(), 1);
        assert!(failed.issues[0].description.contains("no reply"));
    }

    #[test]
    fn test_conclusion_lists_personas_and_issue_counts() {
        let config = council(&[0.5, 0.5]);
        let mut vs = votes(&[(Verdict::Approve, 0.9), (Verdict::Approve, 0.8)]);
        vs[0].issues.push(Issue {
            severity: IssueSeverity::Low,
            category: "style".into(),
            description: "naming".into(),
        });
        let result = aggregate(&config, vs);
        assert!(result.conclusion.contains("Persona 1 (judge1): APPROVE (confidence 0.90)"));
        assert!(result.conclusion.contains("0 critical, 0 high, 0 medium, 1 low"));
        assert!(result.conclusion.contains("Final verdict: APPROVE (consensus: unanimous"));
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        assert!(council(&[0.35, 0.30, 0.35]).validate().is_ok());
        assert!(council(&[0.5, 0.3]).validate().is_err());
        assert!(council(&[0.995, 0.0]).validate().is_ok());
        assert!(council(&[1.2, -0.2]).validate().is_err());
        assert!(CouncilConfig { judges: vec![], ..CouncilConfig::default() }.validate().is_err());
    }

    #[test]
    fn test_default_panel_is_valid() {
        let config = CouncilConfig::default();
        config.validate().unwrap();
        let sum: f64 = config.judges.iter().map(|j| j.weight).sum();
        assert!((0.99..=1.01).contains(&sum));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = council(&[0.5, 0.5]);
        config.judges[1].name = name("judge1");
        assert!(config.validate().is_err());
    }
}
