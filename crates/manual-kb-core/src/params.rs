//! Tuning knobs for conflict detection and drafting, decoupled from
//! application config. The app crate fills this in from its TOML file.

use crate::error::{ManualError, Result};

/// Default instructions handed to the drafting backend.
pub const DEFAULT_INSTRUCTIONS: &str = "Turn the consultation into a support manual entry. \
Return 1 to 3 keywords copied verbatim from the consultation, a one-sentence topic, \
a background section, and a guideline section. Use only facts stated in the \
consultation and reuse its wording where possible.";

#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Number of index candidates fetched per conflict check.
    pub top_k: usize,
    /// Minimum similarity for an index hit to be considered at all. May sit
    /// above `supplement_threshold`; scores between the two then count as
    /// NEW.
    pub search_floor: f64,
    /// At or above this score a draft is a near-duplicate (SIMILAR).
    pub similar_threshold: f64,
    /// At or above this score (and below `similar_threshold`) a draft
    /// SUPPLEMENTs an approved manual and needs review.
    pub supplement_threshold: f64,
    /// Instructions used when a caller does not supply their own.
    pub instructions: String,
    /// Attempts before a retry job is marked dead.
    pub retry_max_attempts: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            top_k: 3,
            search_floor: 0.70,
            similar_threshold: 0.95,
            supplement_threshold: 0.70,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            retry_max_attempts: 5,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(ManualError::validation("top_k must be >= 1"));
        }
        for (name, value) in [
            ("search_floor", self.search_floor),
            ("similar_threshold", self.similar_threshold),
            ("supplement_threshold", self.supplement_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ManualError::validation(format!(
                    "{} must be in [0.0, 1.0]",
                    name
                )));
            }
        }
        if self.supplement_threshold > self.similar_threshold {
            return Err(ManualError::validation(
                "supplement_threshold must not exceed similar_threshold",
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ManualError::validation("retry_max_attempts must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let params = EngineParams {
            supplement_threshold: 0.97,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn floor_may_sit_above_supplement_band() {
        let params = EngineParams {
            search_floor: 0.85,
            ..Default::default()
        };
        params.validate().unwrap();
    }
}
