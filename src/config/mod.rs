// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Settings management for the roaster logger
//!
//! This module provides functionality for loading, validating, and saving the
//! settings file. The settings are backed by a YAML file and validated against
//! an embedded JSON schema before being deserialized.
//!
//! ## Settings Structure
//!
//! - `app`: application name and the directory receiving cycle logs and markers
//! - `logging`: default log level when no command line flag is given
//! - `writer`: log segment rotation and durability settings
//! - `license`: local subscription check consulted by every session
//! - `ports`: the configured Modbus ports, keyed by their id
//!
//! ## Usage
//!
//! ```no_run
//! use roaster_logger::config::Config;
//! use std::path::Path;
//!
//! // Load settings from file, creates a default if not found
//! let config = Config::from_file(Path::new("config/settings.yaml")).unwrap();
//!
//! for port in &config.ports {
//!     println!("{} -> {}", port.id, port.device);
//! }
//! ```

pub mod port;
pub mod utils;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use port::{Parity, PortAction, PortConfig, PortPatch, RegisterMap, RunOverrides};
pub use utils::{output_config_schema, validate_specific_rules};

/// Embedded JSON schema used to validate settings files
pub(crate) const CONFIG_SCHEMA: &str = include_str!("../../resources/config.schema.json");

/// Root settings structure.
///
/// Every section falls back to its default when absent from the file, so a
/// minimal settings file only needs the `ports` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Log segment rotation and durability settings.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Local subscription check.
    ///
    /// When disabled every session is permitted.
    #[serde(default)]
    pub license: LicenseConfig,

    /// Configured ports. Port ids are unique.
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// Application level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Display name of the installation
    pub name: String,
    /// Directory receiving cycle logs and the `sessions/` marker directory
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "roaster-logger".to_string(),
            log_dir: PathBuf::from("data/logs"),
        }
    }
}

/// Default log level, used when neither `--verbose` nor `--quiet` is given
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parse the configured level, falling back to `Info` on an unknown value
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

/// Log writer settings
///
/// # Fields
///
/// * `max_segment_bytes` - Rotate once the active segment reaches this size (0 disables)
/// * `max_segment_age_secs` - Rotate once the active segment is this old
/// * `compress_segments` - Archive rotated segments as zip files
/// * `sync_on_append` - Force data to stable storage after every record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriterConfig {
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
    #[serde(default)]
    pub max_segment_age_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub compress_segments: bool,
    #[serde(default)]
    pub sync_on_append: bool,
}

fn default_max_segment_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
            max_segment_age_secs: None,
            compress_segments: true,
            sync_on_append: false,
        }
    }
}

/// Subscription settings consumed by the license gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LicenseConfig {
    /// Enforce the subscription check
    #[serde(default)]
    pub enabled: bool,
    /// End of the subscription; absent means no expiry
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// How often a running session consults the gate again
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
}

fn default_recheck_interval() -> u64 {
    60
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expires_at: None,
            recheck_interval_secs: default_recheck_interval(),
        }
    }
}

impl Config {
    /// Load settings from a file.
    ///
    /// A missing file is replaced by the default settings, which are written
    /// to `path` so the user has something to edit.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Settings file not found at {:?}, creating default", path);
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading settings from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file at {:?}", path))?;
        let config = Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(config)
    }

    /// Parse, schema-validate and rule-check settings held in a YAML string
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        // First step: convert YAML to a generic Value
        let yaml_value: serde_yml::Value =
            serde_yml::from_str(contents).context("Failed to parse YAML settings")?;

        // An empty document is a valid, all-default settings file
        let json_value = match yaml_value {
            serde_yml::Value::Null => serde_json::Value::Object(Default::default()),
            other => serde_json::to_value(&other)
                .context("Failed to convert YAML to JSON for validation")?,
        };

        check_schema(&json_value)?;

        let config: Config = serde_json::from_value(json_value)
            .context("Failed to deserialize settings")?;

        validate_specific_rules(&config)?;
        Ok(config)
    }

    /// Check these settings the way [`Config::from_yaml_str`] checks a file
    pub fn validate(&self) -> Result<()> {
        let json_value =
            serde_json::to_value(self).context("Failed to convert settings for validation")?;
        check_schema(&json_value)?;
        validate_specific_rules(self)
    }

    /// Save the settings to a file.
    ///
    /// Settings that would not load back are refused. The YAML is written to a
    /// temporary file next to `path` and renamed over it, so a concurrent
    /// reader never sees a partial file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.validate()
            .with_context(|| format!("Refusing to save invalid settings to {:?}", path))?;
        let yaml = serde_yml::to_string(self).context("Failed to serialize settings to YAML")?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create settings directory {:?}", parent))?;

        let mut file = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temporary settings file in {:?}", parent))?;
        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write settings to {:?}", file.path()))?;
        file.as_file()
            .sync_all()
            .context("Failed to sync settings file")?;
        file.persist(path)
            .with_context(|| format!("Failed to replace settings file at {:?}", path))?;
        Ok(())
    }

    /// Directory holding the per-port session markers
    pub fn sessions_dir(&self) -> PathBuf {
        self.app.log_dir.join("sessions")
    }

    /// Look up a port by id
    pub fn port(&self, id: &str) -> Option<&PortConfig> {
        self.ports.iter().find(|port| port.id == id)
    }

    /// Add a port or update an existing one.
    ///
    /// A new port needs every transport field; an update changes only the
    /// fields present in `patch`. The resulting settings are validated before
    /// anything is changed.
    pub fn upsert_port(&mut self, patch: PortPatch) -> Result<(PortAction, PortConfig)> {
        let (action, port) = match self.port(&patch.id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.apply_patch(patch);
                (PortAction::Updated, updated)
            }
            None => (PortAction::Added, PortConfig::from_patch(patch)?),
        };
        port.validate()?;

        let mut candidate = self.clone();
        match candidate.ports.iter_mut().find(|p| p.id == port.id) {
            Some(slot) => *slot = port.clone(),
            None => candidate.ports.push(port.clone()),
        }
        candidate.validate()?;

        *self = candidate;
        debug!("Port {} {}", port.id, action);
        Ok((action, port))
    }

    /// Remove a port by id, returning whether it existed
    pub fn remove_port(&mut self, id: &str) -> bool {
        let before = self.ports.len();
        self.ports.retain(|port| port.id != id);
        self.ports.len() != before
    }
}

/// Validate a settings document against the embedded schema
fn check_schema(json_value: &serde_json::Value) -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).context("Failed to parse JSON schema")?;
    let validator = jsonschema::draft202012::options()
        .should_validate_formats(true)
        .build(&schema)?;

    if let Err(error) = validator.validate(json_value) {
        error!("Settings validation error before deserialization");
        anyhow::bail!("Settings validation failed: {}", error);
    }
    Ok(())
}
