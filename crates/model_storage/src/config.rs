//! Builder configuration.

use std::env;

/// Environment variable that turns on strict consistency checking.
pub const STRICT_ENV_VAR: &str = "WORKSPACE_MODEL_STRICT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageConfig {
    /// Run a full consistency check after every mutation and panic on the
    /// first broken invariant.
    pub strict_consistency: bool,
}

impl StorageConfig {
    #[must_use]
    pub fn with_strict_consistency(mut self, strict: bool) -> Self {
        self.strict_consistency = strict;
        self
    }

    /// Read settings from the environment. `WORKSPACE_MODEL_STRICT=1` or
    /// `=true` enables strict checking.
    #[must_use]
    pub fn from_env() -> Self {
        let strict_consistency = env::var(STRICT_ENV_VAR)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        Self { strict_consistency }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true")
}
