// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Settings utilities
//!
//! This module provides utility functions for working with the settings file,
//! including rule validation and schema output.

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::debug;

use super::{Config, CONFIG_SCHEMA};

/// Output the embedded JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line.
///
/// # Example
///
/// ```bash
/// ./roaster-logger --show-config-schema > settings_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).context("Failed to parse JSON schema")?;
    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;
    println!("{}", formatted_schema);
    Ok(())
}

/// Validates the settings against rules that aren't covered by the JSON schema.
///
/// # Validation Rules
///
/// - **Port ids**: non-empty and unique across the `ports` list
/// - **Port parameters**: every port passes [`super::PortConfig::validate`]
/// - **Log directory**: must not be empty
/// - **License**: the recheck interval must be positive
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    if config.app.log_dir.as_os_str().is_empty() {
        anyhow::bail!("app.log_dir must not be empty");
    }

    if config.license.recheck_interval_secs == 0 {
        anyhow::bail!("license.recheck_interval_secs must be positive");
    }

    let mut seen = HashSet::new();
    for port in &config.ports {
        port.validate()?;
        if !seen.insert(port.id.as_str()) {
            anyhow::bail!("Duplicate port id '{}'", port.id);
        }
    }

    Ok(())
}
