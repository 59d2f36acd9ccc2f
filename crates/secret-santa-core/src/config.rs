use serde::{Deserialize, Serialize};

use crate::error::PairingError;
use crate::search::SearchLimits;

pub const DEFAULT_DIAGNOSTIC_SAMPLE_SIZE: usize = 5;

/// Tunables for one pairing run. Every field has a default, so an empty
/// config document is valid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PairingConfig {
    pub search: SearchLimits,
    /// How many high-conflict participants an unsolvable report names.
    pub diagnostic_sample_size: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { search: SearchLimits::default(), diagnostic_sample_size: DEFAULT_DIAGNOSTIC_SAMPLE_SIZE }
    }
}

impl PairingConfig {
    /// # Errors
    /// Returns [`PairingError::Config`] when a placement cap of zero is set.
    pub fn validate(&self) -> Result<(), PairingError> {
        if self.search.max_placements == Some(0) {
            return Err(PairingError::Config(
                "search.max_placements MUST be >= 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_max_placements(mut self, max_placements: Option<u64>) -> Self {
        self.search.max_placements = max_placements;
        self
    }
}
