//! Engine configuration flags

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VeldError;

/// Which SkinnerJoin implementation drives adaptive joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SkinnerMode {
    /// One emitted driver whose join order is permuted in place.
    #[default]
    Permute,
    /// A per-ordering code cache filled by on-the-fly recompilation.
    Recompile,
}

impl FromStr for SkinnerMode {
    type Err = VeldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permute" => Ok(SkinnerMode::Permute),
            "recompile" => Ok(SkinnerMode::Recompile),
            other => Err(VeldError::config_error(format!(
                "unknown skinner mode '{other}' (expected 'permute' or 'recompile')"
            ))),
        }
    }
}

/// Engine-wide configuration, passed by reference into the planner and
/// translator factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub skinner: SkinnerMode,
    /// When false, single-table filters plan as plain ScanSelect instead of
    /// SkinnerScanSelect.
    pub adaptive_scan: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self { skinner: SkinnerMode::Permute, adaptive_scan: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skinner_mode_parses() {
        assert_eq!("permute".parse::<SkinnerMode>().unwrap(), SkinnerMode::Permute);
        assert_eq!("recompile".parse::<SkinnerMode>().unwrap(), SkinnerMode::Recompile);
    }

    #[test]
    fn test_unknown_skinner_mode_is_fatal() {
        assert!("hybrid".parse::<SkinnerMode>().is_err());
    }
}
