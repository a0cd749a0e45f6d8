// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! License gate
//!
//! The session asks a [`LicenseGate`] whether logging is permitted before it
//! starts and again every `recheck_interval_secs` while it runs.

use chrono::{DateTime, Utc};

use crate::config::LicenseConfig;

/// Answer of a license check
#[derive(Debug, Clone, PartialEq)]
pub struct LicenseStatus {
    pub permitted: bool,
    /// Why logging is refused, or a note about a permitted license
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LicenseStatus {
    pub fn permitted() -> Self {
        Self {
            permitted: true,
            reason: None,
            expires_at: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            permitted: false,
            reason: Some(reason.into()),
            expires_at: None,
        }
    }

    /// Reason to report when logging is refused
    pub fn denial_reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "license check failed".to_string())
    }
}

/// Source of truth for "is logging permitted now?"
pub trait LicenseGate: Send + Sync {
    fn check(&self) -> LicenseStatus;
}

/// Gate backed by the `license` section of the settings
#[derive(Debug, Clone)]
pub struct SettingsLicense {
    config: LicenseConfig,
    clock: fn() -> DateTime<Utc>,
}

impl SettingsLicense {
    pub fn new(config: LicenseConfig) -> Self {
        Self::with_clock(config, Utc::now)
    }

    pub fn with_clock(config: LicenseConfig, clock: fn() -> DateTime<Utc>) -> Self {
        Self { config, clock }
    }
}

impl LicenseGate for SettingsLicense {
    fn check(&self) -> LicenseStatus {
        if !self.config.enabled {
            return LicenseStatus::permitted();
        }
        match self.config.expires_at {
            None => LicenseStatus::permitted(),
            Some(expiry) if (self.clock)() < expiry => LicenseStatus {
                permitted: true,
                reason: None,
                expires_at: Some(expiry),
            },
            Some(expiry) => LicenseStatus {
                permitted: false,
                reason: Some(format!("subscription expired on {}", expiry.to_rfc3339())),
                expires_at: Some(expiry),
            },
        }
    }
}

/// Gate with a fixed answer, for demos and tests
#[derive(Debug, Clone)]
pub struct StaticLicense(pub LicenseStatus);

impl StaticLicense {
    pub fn permitted() -> Self {
        Self(LicenseStatus::permitted())
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self(LicenseStatus::denied(reason))
    }
}

impl LicenseGate for StaticLicense {
    fn check(&self) -> LicenseStatus {
        self.0.clone()
    }
}
