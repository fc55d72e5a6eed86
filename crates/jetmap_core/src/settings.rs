use serde::{Deserialize, Serialize};

use crate::error::{DaError, Result};

/// Controls for [`crate::Mapping::inverse_with`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InversionSettings {
    /// Correction rounds allowed. `None` means `order + 2`: each round fixes
    /// one more weight, so an exact inverse needs about `order` of them.
    pub max_iterations: Option<usize>,
    /// Relative size below which the residual `f∘z - id` counts as zero. A map
    /// that moves the reference point by more than this is inverted about the
    /// image point instead.
    pub tolerance: f64,
}

impl Default for InversionSettings {
    fn default() -> Self {
        Self {
            max_iterations: None,
            tolerance: 1e-10,
        }
    }
}

impl InversionSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_iterations == Some(0) {
            return Err(DaError::InvalidEnvironment(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(DaError::InvalidEnvironment(
                "tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn iteration_limit(&self, order: u32) -> usize {
        self.max_iterations.unwrap_or(order as usize + 2)
    }
}

/// Controls for the Lie exponential series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesSettings {
    pub max_terms: usize,
    pub tolerance: f64,
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            max_terms: 100,
            tolerance: 1e-15,
        }
    }
}

impl SeriesSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_terms == 0 {
            return Err(DaError::InvalidEnvironment(
                "max_terms must be greater than zero".to_string(),
            ));
        }
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(DaError::InvalidEnvironment(
                "tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
