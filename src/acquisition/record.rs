// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Log record schema
//!
//! A cycle log is a sequence of JSON lines, each one a [`LogEntry`]:
//!
//! ```text
//! {"kind":"run", ...}      run header, written once when the file is opened
//! {"kind":"sample", ...}   one polled reading per line
//! {"kind":"end", ...}      run summary, absent when the process died
//! ```
//!
//! Only `sample` lines are records. Fields added after schema version 1 are
//! optional and default to absent, so older files keep parsing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RegisterMap;
use crate::session::SessionStatus;

/// Current record schema version
pub const SCHEMA_VERSION: u32 = 1;

fn schema_v1() -> u32 {
    1
}

fn one_attempt() -> u32 {
    1
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    /// First read attempt succeeded
    Ok,
    /// Succeeded after at least one retry
    Retried,
    /// Every attempt failed; `registers` is empty
    Error,
}

/// One polled reading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleRecord {
    #[serde(default = "schema_v1")]
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub cycle_name: String,
    pub port_id: String,
    /// Zero-based index within the run
    pub sequence: u64,
    pub registers: Vec<u16>,
    #[serde(default)]
    pub decoded: BTreeMap<String, f64>,
    pub status: SampleStatus,
    #[serde(default = "one_attempt")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity shared by every record of a run
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub cycle_name: String,
    pub port_id: String,
    pub register_map: RegisterMap,
    pub value_index: usize,
}

impl RecordContext {
    /// Record for a successful read
    pub fn sample(
        &self,
        sequence: u64,
        timestamp: DateTime<Utc>,
        registers: Vec<u16>,
        attempts: u32,
    ) -> SampleRecord {
        let decoded = decode(&registers, self.register_map, self.value_index);
        SampleRecord {
            schema_version: SCHEMA_VERSION,
            timestamp,
            cycle_name: self.cycle_name.clone(),
            port_id: self.port_id.clone(),
            sequence,
            registers,
            decoded,
            status: if attempts > 1 {
                SampleStatus::Retried
            } else {
                SampleStatus::Ok
            },
            attempts,
            error: None,
        }
    }

    /// Record for a read whose retries were exhausted
    pub fn failed(
        &self,
        sequence: u64,
        timestamp: DateTime<Utc>,
        attempts: u32,
        error: String,
    ) -> SampleRecord {
        SampleRecord {
            schema_version: SCHEMA_VERSION,
            timestamp,
            cycle_name: self.cycle_name.clone(),
            port_id: self.port_id.clone(),
            sequence,
            registers: Vec::new(),
            decoded: BTreeMap::new(),
            status: SampleStatus::Error,
            attempts,
            error: Some(error),
        }
    }
}

/// Map raw registers to named values
pub fn decode(registers: &[u16], map: RegisterMap, value_index: usize) -> BTreeMap<String, f64> {
    let mut decoded = BTreeMap::new();
    if let Some(raw) = registers.get(value_index) {
        decoded.insert("value".to_string(), f64::from(*raw) / map.divisor());
    }
    decoded
}

/// Header written at the start of every run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    #[serde(default = "schema_v1")]
    pub schema_version: u32,
    pub cycle_name: String,
    pub port_id: String,
    pub started_at: DateTime<Utc>,
    pub interval_secs: f64,
    /// Planned iterations, absent for an open-ended run
    #[serde(default)]
    pub iterations: Option<u64>,
    pub client: String,
    pub unit_id: u8,
    pub read_address: u16,
    pub read_count: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Trailer written when a run ends cleanly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub status: SessionStatus,
    pub samples: u64,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One line of a cycle log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    Run(RunMetadata),
    Sample(SampleRecord),
    End(RunSummary),
}

impl LogEntry {
    /// Serialize to a single JSON line without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn as_sample(&self) -> Option<&SampleRecord> {
        match self {
            LogEntry::Sample(record) => Some(record),
            _ => None,
        }
    }
}
