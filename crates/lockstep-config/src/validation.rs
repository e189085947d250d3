// SPDX-FileCopyrightText: 2026 Lockstep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Validates semantic constraints that cannot be expressed via serde attributes.

use crate::diagnostic::ConfigError;
use crate::model::LockstepConfig;

/// Upper bound for `storage.busy_timeout_ms` (ten minutes).
pub const MAX_BUSY_TIMEOUT_MS: u64 = 600_000;

/// Validate a deserialized configuration for semantic correctness.
///
/// Returns `Ok(())` if all validations pass, or `Err(Vec<ConfigError>)` with
/// all collected validation errors (does not fail fast).
pub fn validate_config(config: &LockstepConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.storage.database_path.trim().is_empty() {
        errors.push(ConfigError::Validation {
            message: "storage.database_path must not be empty".to_string(),
        });
    }

    if config.storage.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS {
        errors.push(ConfigError::Validation {
            message: format!(
                "storage.busy_timeout_ms must be at most {MAX_BUSY_TIMEOUT_MS}, got {}",
                config.storage.busy_timeout_ms
            ),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&LockstepConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let toml_str = r#"
[storage]
database_path = "   "
busy_timeout_ms = 9999999
"#;
        let config: LockstepConfig = toml::from_str(toml_str).unwrap();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("database_path"));
        assert!(errors[1].to_string().contains("busy_timeout_ms"));
    }

    #[test]
    fn timeout_at_limit_is_accepted() {
        let toml_str = format!("[storage]\nbusy_timeout_ms = {MAX_BUSY_TIMEOUT_MS}\n");
        let config: LockstepConfig = toml::from_str(&toml_str).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn unknown_downgrade_policy_is_rejected_by_serde() {
        let toml_str = r#"
[migration]
downgrade = "shrug"
"#;
        assert!(toml::from_str::<LockstepConfig>(toml_str).is_err());
    }
}
