use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Resource limits and loop parameters for a single inference run.
///
/// Defaults match the reference deployment on 4 GB-class phones. A model
/// directory may carry an `inference.json` overriding any subset of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeBudget {
    /// Minimum available RAM (MiB) required to run the vision encoder.
    pub vision_min_free_mib: u64,
    /// Available-RAM floor (MiB) checked periodically during decode.
    pub decode_min_free_mib: u64,
    /// Decode steps between RAM checks.
    pub ram_check_interval: usize,
    /// Positions per prefill chunk; caps the intermediate logits tensor.
    pub prefill_chunk: usize,
    /// Token limit applied when the caller passes a non-positive value.
    pub default_max_tokens: usize,
    /// Size of the recent-token window the repetition penalty scans.
    pub repetition_window: usize,
}

impl Default for RuntimeBudget {
    fn default() -> Self {
        Self {
            vision_min_free_mib: 600,
            decode_min_free_mib: 200,
            ram_check_interval: 20,
            prefill_chunk: 16,
            default_max_tokens: 512,
            repetition_window: 128,
        }
    }
}

const BUDGET_FILE: &str = "inference.json";

impl RuntimeBudget {
    /// Load the budget for a model directory, falling back to defaults when
    /// `inference.json` is absent or malformed.
    pub fn load(model_dir: &Path) -> Self {
        let path = model_dir.join(BUDGET_FILE);
        if !path.is_file() {
            return Self::default();
        }
        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Self>(&text).map_err(Into::into))
        {
            Ok(budget) => budget,
            Err(err) => {
                warn!("ignoring unreadable {}: {err:#}", path.display());
                Self::default()
            }
        }
    }

    /// Map the caller-supplied token limit onto an effective one.
    pub fn normalize_max_tokens(&self, requested: i32) -> usize {
        if requested <= 0 {
            self.default_max_tokens
        } else {
            requested as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let budget = RuntimeBudget::default();
        assert_eq!(budget.vision_min_free_mib, 600);
        assert_eq!(budget.decode_min_free_mib, 200);
        assert_eq!(budget.ram_check_interval, 20);
        assert_eq!(budget.prefill_chunk, 16);
        assert_eq!(budget.default_max_tokens, 512);
        assert_eq!(budget.repetition_window, 128);
    }

    #[test]
    fn non_positive_max_tokens_falls_back() {
        let budget = RuntimeBudget::default();
        assert_eq!(budget.normalize_max_tokens(0), 512);
        assert_eq!(budget.normalize_max_tokens(-7), 512);
        assert_eq!(budget.normalize_max_tokens(16), 16);
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("inference.json"),
            r#"{"vision_min_free_mib": 900, "prefill_chunk": 8}"#,
        )?;
        let budget = RuntimeBudget::load(dir.path());
        assert_eq!(budget.vision_min_free_mib, 900);
        assert_eq!(budget.prefill_chunk, 8);
        assert_eq!(budget.decode_min_free_mib, 200);
        Ok(())
    }

    #[test]
    fn malformed_override_is_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("inference.json"), "not json")?;
        let budget = RuntimeBudget::load(dir.path());
        assert_eq!(budget.default_max_tokens, 512);
        Ok(())
    }
}
