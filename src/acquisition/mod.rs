// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Acquisition output
//!
//! This module turns register reads into [`SampleRecord`]s and persists them
//! in per-run cycle logs.

pub mod record;
pub mod writer;

pub use record::{
    decode, LogEntry, RecordContext, RunMetadata, RunSummary, SampleRecord, SampleStatus,
    SCHEMA_VERSION,
};
pub use writer::{list_segments, read_lines, read_records, read_run, CycleLogWriter};
