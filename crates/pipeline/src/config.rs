//! Engine configuration.
//!
//! Deserialised from JSON with every field optional; [`EngineConfig::validate`]
//! is called by every constructor that consumes a config, so a malformed
//! council or interrupt table fails before any task runs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    CouncilConfig, InterruptConfig, ModelTier, PipelineError, RecoveryConfig, Stage, Topology,
    MAX_REVIEW_ITERATIONS,
};

/// Default wall-clock budget for one `invoke`.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_review_iterations: u32,
    pub timeout_seconds: u64,
    pub topology: Topology,
    pub recovery: RecoveryConfig,
    pub council: CouncilConfig,
    pub interrupts: InterruptConfig,
    /// Starting model tier per stage; stages not listed use the default tier.
    pub stage_model_tiers: BTreeMap<Stage, ModelTier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_review_iterations: MAX_REVIEW_ITERATIONS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            topology: Topology::default(),
            recovery: RecoveryConfig::default(),
            council: CouncilConfig::default(),
            interrupts: InterruptConfig::default(),
            stage_model_tiers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.council.validate()?;
        self.interrupts.validate()?;
        Ok(())
    }

    /// Starting tier for `stage`.
    pub fn model_tier(&self, stage: Stage) -> ModelTier {
        self.stage_model_tiers
            .get(&stage)
            .copied()
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Parses a JSON document; absent fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            PipelineError::config(format!("invalid engine configuration: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_review_iterations, 3);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.model_tier(Stage::Planner), ModelTier::Sonnet);
    }

    #[test]
    fn test_partial_document_overrides_fields() {
        let config = EngineConfig::from_json(
            r#"{
                "topology": "supervised",
                "timeout_seconds": 60,
                "recovery": { "skip_exhausted_stages": ["tester"] },
                "stage_model_tiers": { "planner": "opus" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.topology, Topology::Supervised);
        assert_eq!(config.timeout_seconds, 60);
        assert!(config.recovery.enabled);
        assert!(config.recovery.skip_exhausted_stages.contains(&Stage::Tester));
        assert_eq!(config.model_tier(Stage::Planner), ModelTier::Opus);
    }

    #[test]
    fn test_bad_judge_weights_fail_fast() {
        let err = EngineConfig::from_json(
            r#"{ "council": { "judges": [
                { "name": "a", "persona": "A", "system_prompt": "", "model_tier": "opus", "weight": 0.5 },
                { "name": "b", "persona": "B", "system_prompt": "", "model_tier": "opus", "weight": 0.2 }
            ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationError { .. }));
    }
}
