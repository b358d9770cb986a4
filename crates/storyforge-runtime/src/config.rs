//! Layered runtime configuration (§4.15, §10): compiled-in defaults →
//! `storyforge.toml` → `STORYFORGE_*` environment variables → CLI flags.
//! Loading fails fast on a present-but-invalid key rather than silently
//! falling back to a different default (§4.15).

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Controls how much weight the LLM review stage of the state updater
/// carries (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReviewMode {
    /// No review at all; the raw parsed STATE update applies as-is.
    Off,
    /// Stage A deterministic checks only; no LLM call.
    #[default]
    DeterministicOnly,
    /// Stage B runs but its patch is only logged, never applied.
    LlmShadow,
    /// Stage B's patch replaces the update before it is applied.
    LlmEnforce,
}

/// Recap/compaction tuning constants (§4.6), overridable for tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecapConfig {
    pub recent_window: i64,
    pub min_uncompacted_for_trigger: i64,
    pub recap_char_cap: usize,
    pub recap_meta_compact_target: usize,
}

impl Default for RecapConfig {
    fn default() -> Self {
        Self {
            recent_window: 20,
            min_uncompacted_for_trigger: 20,
            recap_char_cap: 8000,
            recap_meta_compact_target: 3000,
        }
    }
}

/// NPC-evolution cadence (§4.13.3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NpcEvolutionConfig {
    pub interval_turns: u64,
    pub cooldown_seconds: u64,
}

impl Default for NpcEvolutionConfig {
    fn default() -> Self {
        Self {
            interval_turns: 3,
            cooldown_seconds: 120,
        }
    }
}

fn default_data_root() -> PathBuf {
    storyforge_core::Workspace::discover(None).root().to_path_buf()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default)]
    pub state_review_mode: StateReviewMode,
    #[serde(default)]
    pub recap: RecapConfig,
    #[serde(default)]
    pub npc_evolution: NpcEvolutionConfig,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_true")]
    pub web_search: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            state_review_mode: StateReviewMode::default(),
            recap: RecapConfig::default(),
            npc_evolution: NpcEvolutionConfig::default(),
            provider: String::new(),
            web_search: true,
        }
    }
}

impl RuntimeConfig {
    /// Loads `defaults → file → env → nothing`, validating every layer as
    /// it applies. Use [`RuntimeConfig::apply_env`] afterwards if the
    /// caller also wants environment overrides, and set CLI-flag overrides
    /// directly on the returned struct — flags are the highest-priority
    /// layer and are applied by the CLI driver, not here.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = toml_path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| RuntimeError::Config {
                    key: path.display().to_string(),
                    source: "file",
                    message: e.to_string(),
                })?;
                config = toml::from_str(&text).map_err(|e| RuntimeError::Config {
                    key: path.display().to_string(),
                    source: "file",
                    message: e.to_string(),
                })?;
            }
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `STORYFORGE_*` environment variable overrides in place.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("STORYFORGE_HOME") {
            if !v.is_empty() {
                self.data_root = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("STORYFORGE_STATE_REVIEW_MODE") {
            self.state_review_mode = match v.as_str() {
                "off" => StateReviewMode::Off,
                "deterministic_only" => StateReviewMode::DeterministicOnly,
                "llm_shadow" => StateReviewMode::LlmShadow,
                "llm_enforce" => StateReviewMode::LlmEnforce,
                other => {
                    return Err(RuntimeError::Config {
                        key: "STORYFORGE_STATE_REVIEW_MODE".to_string(),
                        source: "env",
                        message: format!("unrecognized state review mode {other:?}"),
                    });
                }
            };
        }
        if let Ok(v) = std::env::var("STORYFORGE_RECAP_CHAR_CAP") {
            self.recap.recap_char_cap = v.parse().map_err(|_| RuntimeError::Config {
                key: "STORYFORGE_RECAP_CHAR_CAP".to_string(),
                source: "env",
                message: format!("{v:?} is not a valid positive integer"),
            })?;
        }
        if let Ok(v) = std::env::var("STORYFORGE_PROVIDER") {
            self.provider = v;
        }
        if let Ok(v) = std::env::var("STORYFORGE_WEB_SEARCH") {
            self.web_search = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.recap.recap_char_cap == 0 {
            return Err(RuntimeError::Config {
                key: "recap.recap_char_cap".to_string(),
                source: "file",
                message: "must be a positive number of characters".to_string(),
            });
        }
        if self.recap.recent_window <= 0 {
            return Err(RuntimeError::Config {
                key: "recap.recent_window".to_string(),
                source: "file",
                message: "must be positive".to_string(),
            });
        }
        if self.recap.recap_meta_compact_target == 0
            || self.recap.recap_meta_compact_target > self.recap.recap_char_cap
        {
            return Err(RuntimeError::Config {
                key: "recap.recap_meta_compact_target".to_string(),
                source: "file",
                message: "must be positive and not exceed recap_char_cap".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.recap.recent_window, 20);
        assert_eq!(config.recap.min_uncompacted_for_trigger, 20);
        assert_eq!(config.recap.recap_char_cap, 8000);
        assert_eq!(config.recap.recap_meta_compact_target, 3000);
        assert_eq!(config.npc_evolution.interval_turns, 3);
        assert_eq!(config.npc_evolution.cooldown_seconds, 120);
        assert_eq!(config.state_review_mode, StateReviewMode::DeterministicOnly);
    }

    #[test]
    fn negative_recap_char_cap_from_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyforge.toml");
        std::fs::write(&path, "[recap]\nrecap_char_cap = 0\n").unwrap();
        let err = RuntimeConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }

    #[test]
    fn env_override_of_unrecognized_review_mode_is_a_typed_error() {
        let mut config = RuntimeConfig::default();
        std::env::set_var("STORYFORGE_STATE_REVIEW_MODE", "not_a_mode");
        let err = config.apply_env().unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
        std::env::remove_var("STORYFORGE_STATE_REVIEW_MODE");
    }
}
