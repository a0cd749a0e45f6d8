// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus port configuration
//!
//! A [`PortConfig`] describes one physical or virtual Modbus endpoint: the
//! serial transport parameters, the slave addressing, the register window to
//! poll and the retry policy applied by the bus client.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Serial parity, written as `N`, `E` or `O` in the settings file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        };
        f.write_str(letter)
    }
}

impl std::str::FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" | "n" => Ok(Parity::None),
            "E" | "e" => Ok(Parity::Even),
            "O" | "o" => Ok(Parity::Odd),
            other => Err(format!("invalid parity '{other}', expected N, E or O")),
        }
    }
}

/// How raw registers are turned into decoded values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMap {
    /// `value` is the raw register at `value_index`
    Default,
    /// `value` is the register at `value_index` divided by ten (0.1 °C controllers)
    Tenths,
}

impl RegisterMap {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(RegisterMap::Default),
            "tenths" => Ok(RegisterMap::Tenths),
            other => anyhow::bail!("unknown register map '{}'", other),
        }
    }

    /// Raw register units per decoded unit
    pub fn divisor(&self) -> f64 {
        match self {
            RegisterMap::Default => 1.0,
            RegisterMap::Tenths => 10.0,
        }
    }
}

/// Result of adding or updating a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAction {
    Added,
    Updated,
}

impl fmt::Display for PortAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortAction::Added => f.write_str("added"),
            PortAction::Updated => f.write_str("updated"),
        }
    }
}

/// Configuration of one Modbus port.
///
/// Sessions never hold a reference into the settings: they take a clone with
/// the per-run overrides applied (see [`PortConfig::with_overrides`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortConfig {
    /// Unique, non-empty port id
    pub id: String,
    /// Serial device (`/dev/ttyUSB0`, `COM3`) or `host:port` for Modbus TCP
    pub device: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub stopbits: u8,
    pub bytesize: u8,
    /// Per-operation timeout in seconds
    pub timeout: f64,
    /// Default seconds between polls when the run gives no interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Modbus unit (slave) id
    pub unit_id: u8,
    #[serde(default = "default_register_map")]
    pub register_map: String,
    #[serde(default)]
    pub read_address: u16,
    #[serde(default = "default_read_count")]
    pub read_count: u16,
    #[serde(default)]
    pub value_index: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay: f64,
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_read_retry_delay")]
    pub read_retry_delay: f64,
    #[serde(default = "default_enabled")]
    pub reconnect_on_read_error: bool,
    /// Extra parameters understood by specific clients (`noise`, `seed` for the stub)
    #[serde(default)]
    pub client_params: BTreeMap<String, serde_json::Value>,
}

fn default_poll_interval() -> f64 {
    1.0
}
fn default_register_map() -> String {
    "default".to_string()
}
fn default_read_count() -> u16 {
    1
}
fn default_enabled() -> bool {
    true
}
fn default_connect_retries() -> u32 {
    3
}
fn default_connect_retry_delay() -> f64 {
    1.0
}
fn default_read_retries() -> u32 {
    1
}
fn default_read_retry_delay() -> f64 {
    0.2
}

/// Partial port description used by the add/update commands
#[derive(Debug, Clone, Default)]
pub struct PortPatch {
    pub id: String,
    pub device: Option<String>,
    pub baudrate: Option<u32>,
    pub parity: Option<Parity>,
    pub stopbits: Option<u8>,
    pub bytesize: Option<u8>,
    pub timeout: Option<f64>,
    pub poll_interval: Option<f64>,
    pub unit_id: Option<u8>,
    pub register_map: Option<String>,
    pub read_address: Option<u16>,
    pub read_count: Option<u16>,
    pub value_index: Option<usize>,
    pub enabled: Option<bool>,
    pub connect_retries: Option<u32>,
    pub connect_retry_delay: Option<f64>,
    pub read_retries: Option<u32>,
    pub read_retry_delay: Option<f64>,
    pub reconnect_on_read_error: Option<bool>,
}

/// Per-run overrides given on the `start-cycle` command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub timeout: Option<f64>,
    pub connect_retries: Option<u32>,
    pub read_retries: Option<u32>,
    pub read_address: Option<u16>,
    pub read_count: Option<u16>,
}

fn positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        anyhow::bail!("{} must be a positive number, got {}", name, value);
    }
    Ok(())
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        anyhow::bail!("{} must not be negative, got {}", name, value);
    }
    Ok(())
}

/// Largest register window a single Modbus read may request
pub const MAX_READ_COUNT: u16 = 125;

/// Port ids name the marker file of their sessions, so they are restricted
/// to characters that are safe in a file name
pub fn is_valid_port_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Convert a number of seconds, rejecting values a `Duration` cannot hold
pub fn duration_from_secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|err| anyhow::anyhow!("{} of {} seconds is out of range: {}", name, value, err))
}

/// Convert a strictly positive number of seconds into a non-zero `Duration`
pub fn positive_duration(name: &str, value: f64) -> Result<Duration> {
    positive(name, value)?;
    let duration = duration_from_secs(name, value)?;
    if duration.is_zero() {
        anyhow::bail!("{} of {} seconds is below one nanosecond", name, value);
    }
    Ok(duration)
}

// validated ports never reach the clamps
fn saturating_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl PortConfig {
    /// Build a new port from a patch carrying every transport field
    pub fn from_patch(patch: PortPatch) -> Result<Self> {
        let mut missing = Vec::new();
        if patch.device.is_none() {
            missing.push("device");
        }
        if patch.baudrate.is_none() {
            missing.push("baudrate");
        }
        if patch.parity.is_none() {
            missing.push("parity");
        }
        if patch.stopbits.is_none() {
            missing.push("stopbits");
        }
        if patch.bytesize.is_none() {
            missing.push("bytesize");
        }
        if patch.timeout.is_none() {
            missing.push("timeout");
        }
        if patch.unit_id.is_none() {
            missing.push("unit_id");
        }
        if !missing.is_empty() {
            anyhow::bail!(
                "Port '{}' is missing required field(s): {}",
                patch.id,
                missing.join(", ")
            );
        }

        let mut port = PortConfig {
            id: patch.id.clone(),
            device: String::new(),
            baudrate: 0,
            parity: Parity::None,
            stopbits: 0,
            bytesize: 0,
            timeout: 0.0,
            poll_interval: default_poll_interval(),
            unit_id: 0,
            register_map: default_register_map(),
            read_address: 0,
            read_count: default_read_count(),
            value_index: 0,
            enabled: true,
            connect_retries: default_connect_retries(),
            connect_retry_delay: default_connect_retry_delay(),
            read_retries: default_read_retries(),
            read_retry_delay: default_read_retry_delay(),
            reconnect_on_read_error: true,
            client_params: BTreeMap::new(),
        };
        port.apply_patch(patch);
        Ok(port)
    }

    /// Overwrite the fields present in `patch`
    pub fn apply_patch(&mut self, patch: PortPatch) {
        if let Some(device) = patch.device {
            self.device = device;
        }
        if let Some(baudrate) = patch.baudrate {
            self.baudrate = baudrate;
        }
        if let Some(parity) = patch.parity {
            self.parity = parity;
        }
        if let Some(stopbits) = patch.stopbits {
            self.stopbits = stopbits;
        }
        if let Some(bytesize) = patch.bytesize {
            self.bytesize = bytesize;
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = timeout;
        }
        if let Some(poll_interval) = patch.poll_interval {
            self.poll_interval = poll_interval;
        }
        if let Some(unit_id) = patch.unit_id {
            self.unit_id = unit_id;
        }
        if let Some(register_map) = patch.register_map {
            self.register_map = register_map;
        }
        if let Some(read_address) = patch.read_address {
            self.read_address = read_address;
        }
        if let Some(read_count) = patch.read_count {
            self.read_count = read_count;
        }
        if let Some(value_index) = patch.value_index {
            self.value_index = value_index;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(retries) = patch.connect_retries {
            self.connect_retries = retries;
        }
        if let Some(delay) = patch.connect_retry_delay {
            self.connect_retry_delay = delay;
        }
        if let Some(retries) = patch.read_retries {
            self.read_retries = retries;
        }
        if let Some(delay) = patch.read_retry_delay {
            self.read_retry_delay = delay;
        }
        if let Some(reconnect) = patch.reconnect_on_read_error {
            self.reconnect_on_read_error = reconnect;
        }
    }

    /// Immutable snapshot for one run with the command line overrides applied
    pub fn with_overrides(&self, overrides: &RunOverrides) -> PortConfig {
        let mut snapshot = self.clone();
        if let Some(timeout) = overrides.timeout {
            snapshot.timeout = timeout;
        }
        if let Some(retries) = overrides.connect_retries {
            snapshot.connect_retries = retries;
        }
        if let Some(retries) = overrides.read_retries {
            snapshot.read_retries = retries;
        }
        if let Some(address) = overrides.read_address {
            snapshot.read_address = address;
        }
        if let Some(count) = overrides.read_count {
            snapshot.read_count = count;
        }
        snapshot
    }

    /// Check the invariants of a single port
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Port id must not be empty");
        }
        if !is_valid_port_id(&self.id) {
            anyhow::bail!(
                "Port id '{}' may only contain letters, digits, '_' and '-'",
                self.id
            );
        }
        if self.device.trim().is_empty() {
            anyhow::bail!("Port '{}': device must not be empty", self.id);
        }
        if self.baudrate == 0 {
            anyhow::bail!("Port '{}': baudrate must be positive", self.id);
        }
        if !matches!(self.stopbits, 1 | 2) {
            anyhow::bail!("Port '{}': stopbits must be 1 or 2, got {}", self.id, self.stopbits);
        }
        if !(5..=8).contains(&self.bytesize) {
            anyhow::bail!("Port '{}': bytesize must be 5..=8, got {}", self.id, self.bytesize);
        }
        if self.read_count == 0 || self.read_count > MAX_READ_COUNT {
            anyhow::bail!(
                "Port '{}': read_count must be 1..={}, got {}",
                self.id,
                MAX_READ_COUNT,
                self.read_count
            );
        }
        if self.value_index >= usize::from(self.read_count) {
            anyhow::bail!(
                "Port '{}': value_index {} is outside the {} register(s) read",
                self.id,
                self.value_index,
                self.read_count
            );
        }
        positive_duration(&format!("Port '{}': timeout", self.id), self.timeout)?;
        positive_duration(&format!("Port '{}': poll_interval", self.id), self.poll_interval)?;
        for (field, value) in [
            ("connect_retry_delay", self.connect_retry_delay),
            ("read_retry_delay", self.read_retry_delay),
        ] {
            let name = format!("Port '{}': {}", self.id, field);
            non_negative(&name, value)?;
            duration_from_secs(&name, value)?;
        }
        RegisterMap::parse(&self.register_map)
            .map_err(|err| anyhow::anyhow!("Port '{}': {}", self.id, err))?;
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        saturating_duration(self.timeout)
    }

    pub fn connect_retry_delay_duration(&self) -> Duration {
        saturating_duration(self.connect_retry_delay)
    }

    pub fn read_retry_delay_duration(&self) -> Duration {
        saturating_duration(self.read_retry_delay)
    }

    /// Look up an unsigned integer client parameter
    pub fn client_param_u64(&self, key: &str) -> Option<u64> {
        self.client_params.get(key).and_then(serde_json::Value::as_u64)
    }

    /// One-line summary used by `ports list`
    pub fn summary(&self) -> String {
        format!(
            "{}: {} baud={} parity={} stopbits={} bytesize={} unit_id={}{}",
            self.id,
            self.device,
            self.baudrate,
            self.parity,
            self.stopbits,
            self.bytesize,
            self.unit_id,
            if self.enabled { "" } else { " (disabled)" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> PortConfig {
        PortConfig::from_patch(PortPatch {
            id: "roaster_1".to_string(),
            device: Some("COM3".to_string()),
            baudrate: Some(9600),
            parity: Some(Parity::Even),
            stopbits: Some(1),
            bytesize: Some(8),
            timeout: Some(0.5),
            unit_id: Some(7),
            read_count: Some(4),
            ..PortPatch::default()
        })
        .expect("complete patch")
    }

    #[test]
    fn overrides_do_not_touch_the_original() {
        let original = port();
        let snapshot = original.with_overrides(&RunOverrides {
            timeout: Some(2.0),
            connect_retries: Some(9),
            read_retries: Some(0),
            ..RunOverrides::default()
        });
        assert_eq!(snapshot.timeout, 2.0);
        assert_eq!(snapshot.connect_retries, 9);
        assert_eq!(snapshot.read_retries, 0);
        assert_eq!(original.timeout, 0.5);
        assert_eq!(original.connect_retries, 3);
    }

    #[test]
    fn validation_rejects_non_positive_numbers() {
        let mut bad = port();
        bad.timeout = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.baudrate = 0;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.poll_interval = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.id = "  ".to_string();
        assert!(bad.validate().is_err());

        assert!(port().validate().is_ok());
    }

    #[test]
    fn validation_checks_value_index_and_register_map() {
        let mut bad = port();
        bad.value_index = 4;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.register_map = "fahrenheit".to_string();
        assert!(bad.validate().is_err());

        let mut ok = port();
        ok.register_map = "tenths".to_string();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unrepresentable_durations() {
        let mut bad = port();
        bad.timeout = 1e20;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.poll_interval = 1e-10;
        assert!(bad.validate().is_err());

        let mut bad = port();
        bad.read_retry_delay = 1e30;
        assert!(bad.validate().is_err());

        let mut huge = port();
        huge.connect_retry_delay = f64::MAX;
        assert_eq!(huge.connect_retry_delay_duration(), Duration::MAX);
    }

    #[test]
    fn positive_duration_bounds() {
        assert_eq!(
            positive_duration("interval", 0.25).expect("in range"),
            Duration::from_millis(250)
        );
        assert!(positive_duration("interval", 1e-10).is_err());
        assert!(positive_duration("interval", 1e20).is_err());
        assert!(positive_duration("interval", 0.0).is_err());
    }

    #[test]
    fn validation_limits_read_count_and_port_id() {
        let mut bad = port();
        bad.read_count = MAX_READ_COUNT + 1;
        assert!(bad.validate().is_err());

        let mut ok = port();
        ok.read_count = MAX_READ_COUNT;
        assert!(ok.validate().is_ok());

        for id in ["roaster.1", "roaster 1", "../roaster", "röster"] {
            let mut bad = port();
            bad.id = id.to_string();
            assert!(bad.validate().is_err(), "{id} accepted");
        }
        let mut ok = port();
        ok.id = "Roaster-2_b".to_string();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn parity_parses_letters() {
        assert_eq!("E".parse::<Parity>(), Ok(Parity::Even));
        assert_eq!("n".parse::<Parity>(), Ok(Parity::None));
        assert!("X".parse::<Parity>().is_err());
        assert_eq!(Parity::Odd.to_string(), "O");
    }

    #[test]
    fn summary_marks_disabled_ports() {
        let mut p = port();
        p.enabled = false;
        assert_eq!(
            p.summary(),
            "roaster_1: COM3 baud=9600 parity=E stopbits=1 bytesize=8 unit_id=7 (disabled)"
        );
    }
}
