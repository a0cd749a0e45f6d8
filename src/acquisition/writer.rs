// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Cycle log writer
//!
//! Every run owns one logical log, identified by its *stem*
//! `{cycle}_{YYYYmmddTHHMMSS.mmm}`. The segment being written is always
//! `{stem}.log`; when the rotation threshold is crossed the segment is closed
//! and archived as `{stem}.{NNNN}.zip` (or renamed to `{stem}.{NNNN}.log`
//! when compression is disabled), then a fresh `{stem}.log` is opened.
//!
//! ```text
//! test_20240101T120000.000.0001.zip   first rotated segment
//! test_20240101T120000.000.0002.zip   second rotated segment
//! test_20240101T120000.000.log        active (or last) segment
//! ```
//!
//! Readers use [`list_segments`] and [`read_run`], which only consider
//! newline-terminated lines so a log can be tailed while it is being written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::acquisition::record::{LogEntry, RunMetadata, RunSummary, SampleRecord};
use crate::config::WriterConfig;
use crate::error::WriteError;

/// Upper bound on `-N` suffixes tried before giving up on a stem
const MAX_STEM_SUFFIX: u32 = 10_000;

/// Append-only writer for one cycle log
pub struct CycleLogWriter {
    dir: PathBuf,
    stem: String,
    config: WriterConfig,
    file: Option<File>,
    segment_bytes: u64,
    segment_opened: Instant,
    rotated: u32,
    records: u64,
}

impl CycleLogWriter {
    /// Create the log for a new run and write its header.
    ///
    /// The stem is derived from the cycle name and the start time. When a file
    /// with that stem already exists (two runs started within the same
    /// millisecond) `-1`, `-2`, ... is appended until an unused name is found.
    pub fn open(dir: &Path, metadata: &RunMetadata, config: WriterConfig) -> Result<Self, WriteError> {
        fs::create_dir_all(dir).map_err(|e| WriteError::io(dir, e))?;

        let base = base_stem(&metadata.cycle_name, metadata.started_at);
        let mut suffix = 0;
        let (stem, file) = loop {
            let stem = if suffix == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, suffix)
            };
            let path = dir.join(format!("{}.log", stem));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (stem, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && suffix < MAX_STEM_SUFFIX => {
                    debug!("Log file {:?} exists, trying next suffix", path);
                    suffix += 1;
                }
                Err(e) => return Err(WriteError::io(path, e)),
            }
        };

        let mut writer = Self {
            dir: dir.to_path_buf(),
            stem,
            config,
            file: Some(file),
            segment_bytes: 0,
            segment_opened: Instant::now(),
            rotated: 0,
            records: 0,
        };
        writer.write_entry(&LogEntry::Run(metadata.clone()))?;
        writer.flush()?;
        info!("Opened cycle log {:?}", writer.path());
        Ok(writer)
    }

    /// Stem shared by every segment of this run
    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active segment
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    /// Number of sample records appended so far
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Every segment of this run, oldest first
    pub fn segments(&self) -> Result<Vec<PathBuf>, WriteError> {
        list_segments(&self.dir, &self.stem)
    }

    /// Append one record.
    ///
    /// Once this returns `Ok` the line has been handed to the operating system;
    /// with `sync_on_append` it has also reached stable storage.
    pub fn append(&mut self, record: &SampleRecord) -> Result<(), WriteError> {
        self.write_entry(&LogEntry::Sample(record.clone()))?;
        self.records += 1;
        if self.config.sync_on_append {
            self.flush()?;
        }
        if self.rotation_due() {
            self.rotate()?;
        }
        Ok(())
    }

    /// Force appended data to stable storage
    pub fn flush(&mut self) -> Result<(), WriteError> {
        let path = self.path();
        let file = self.file.as_mut().ok_or_else(|| WriteError::Closed(path.clone()))?;
        file.flush().map_err(|e| WriteError::io(&path, e))?;
        file.sync_data().map_err(|e| WriteError::io(&path, e))
    }

    /// Write the run summary and close the active segment.
    ///
    /// Everything appended before is on stable storage when this returns.
    /// Closing twice is a no-op.
    pub fn close(&mut self, summary: &RunSummary) -> Result<(), WriteError> {
        if self.file.is_none() {
            return Ok(());
        }
        let path = self.path();
        let result = self
            .write_entry(&LogEntry::End(summary.clone()))
            .and_then(|_| match self.file.as_mut() {
                Some(file) => file.sync_all().map_err(|e| WriteError::io(&path, e)),
                None => Ok(()),
            });
        self.file = None;
        match &result {
            Ok(()) => info!(
                "Closed cycle log {:?} ({} records, {} rotated segment(s))",
                path, self.records, self.rotated
            ),
            Err(e) => warn!("Cycle log {:?} closed with error: {}", path, e),
        }
        result
    }

    fn write_entry(&mut self, entry: &LogEntry) -> Result<(), WriteError> {
        let path = self.path();
        let file = self.file.as_mut().ok_or_else(|| WriteError::Closed(path.clone()))?;
        let mut line = entry.to_line()?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|e| WriteError::io(&path, e))?;
        self.segment_bytes += line.len() as u64;
        Ok(())
    }

    fn rotation_due(&self) -> bool {
        let by_size = self.config.max_segment_bytes > 0
            && self.segment_bytes >= self.config.max_segment_bytes;
        let by_age = self
            .config
            .max_segment_age_secs
            .is_some_and(|secs| self.segment_opened.elapsed().as_secs() >= secs);
        by_size || by_age
    }

    /// Close the active segment, archive it and open the next one
    fn rotate(&mut self) -> Result<(), WriteError> {
        let active = self.path();
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| WriteError::io(&active, e))?;
        }

        let number = self.rotated + 1;
        let segment_name = format!("{}.{:04}", self.stem, number);
        let archived = if self.config.compress_segments {
            let archive = self.dir.join(format!("{}.zip", segment_name));
            compress_segment(&active, &archive, &format!("{}.log", segment_name))?;
            fs::remove_file(&active).map_err(|e| WriteError::io(&active, e))?;
            archive
        } else {
            let renamed = self.dir.join(format!("{}.log", segment_name));
            fs::rename(&active, &renamed).map_err(|e| WriteError::io(&renamed, e))?;
            renamed
        };
        self.rotated = number;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&active)
            .map_err(|e| WriteError::io(&active, e))?;
        self.file = Some(file);
        self.segment_bytes = 0;
        self.segment_opened = Instant::now();
        debug!("Rotated cycle log segment to {:?}", archived);
        Ok(())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` by `_`
pub(crate) fn file_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{cycle}_{YYYYmmddTHHMMSS.mmm}` for a run started at `started_at`
pub fn base_stem(cycle_name: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        file_safe_name(cycle_name),
        started_at.format("%Y%m%dT%H%M%S%.3f")
    )
}

fn compress_segment(source: &Path, archive: &Path, entry_name: &str) -> Result<(), WriteError> {
    let archive_err = |source| WriteError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let mut input = File::open(source).map_err(|e| WriteError::io(source, e))?;
    let output = File::create(archive).map_err(|e| WriteError::io(archive, e))?;
    let mut zip = ZipWriter::new(output);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    zip.start_file(entry_name, options).map_err(archive_err)?;
    io::copy(&mut input, &mut zip).map_err(|e| WriteError::io(archive, e))?;
    let output = zip.finish().map_err(archive_err)?;
    output.sync_all().map_err(|e| WriteError::io(archive, e))
}

/// Parse the segment number out of `{stem}.{NNNN}.zip` / `{stem}.{NNNN}.log`
fn segment_number(file_name: &str, stem: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('.')?;
    let digits = rest
        .strip_suffix(".zip")
        .or_else(|| rest.strip_suffix(".log"))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Every segment of the run `stem` in `dir`: rotated segments by number, then
/// the active segment if present.
pub fn list_segments(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, WriteError> {
    let mut numbered = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| WriteError::io(dir, e))? {
        let entry = entry.map_err(|e| WriteError::io(dir, e))?;
        let name = entry.file_name();
        if let Some(number) = name.to_str().and_then(|n| segment_number(n, stem)) {
            numbered.push((number, entry.path()));
        }
    }
    numbered.sort();

    let mut segments: Vec<PathBuf> = numbered.into_iter().map(|(_, path)| path).collect();
    let active = dir.join(format!("{}.log", stem));
    if active.is_file() {
        segments.push(active);
    }
    Ok(segments)
}

fn read_segment(path: &Path) -> Result<String, WriteError> {
    let mut contents = String::new();
    if path.extension().is_some_and(|ext| ext == "zip") {
        let file = File::open(path).map_err(|e| WriteError::io(path, e))?;
        let archive_err = |source| WriteError::Archive {
            path: path.to_path_buf(),
            source,
        };
        let mut archive = ZipArchive::new(file).map_err(archive_err)?;
        let mut entry = archive.by_index(0).map_err(archive_err)?;
        entry
            .read_to_string(&mut contents)
            .map_err(|e| WriteError::io(path, e))?;
    } else {
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|e| WriteError::io(path, e))?;
    }
    Ok(contents)
}

/// Complete lines of the run, in write order, without their newline.
///
/// A trailing partial line (a write in progress) is left out.
pub fn read_lines(dir: &Path, stem: &str) -> Result<Vec<String>, WriteError> {
    let mut lines = Vec::new();
    for segment in list_segments(dir, stem)? {
        let contents = read_segment(&segment)?;
        let complete = match contents.rfind('\n') {
            Some(end) => &contents[..=end],
            None => "",
        };
        lines.extend(complete.lines().map(str::to_string));
    }
    Ok(lines)
}

/// Every entry of the run: header, samples and summary when present
pub fn read_run(dir: &Path, stem: &str) -> Result<Vec<LogEntry>, WriteError> {
    read_lines(dir, stem)?
        .iter()
        .map(|line| LogEntry::from_line(line).map_err(WriteError::from))
        .collect()
}

/// Only the sample records of the run
pub fn read_records(dir: &Path, stem: &str) -> Result<Vec<SampleRecord>, WriteError> {
    Ok(read_run(dir, stem)?
        .into_iter()
        .filter_map(|entry| match entry {
            LogEntry::Sample(record) => Some(record),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::record::{RecordContext, SCHEMA_VERSION};
    use crate::config::RegisterMap;
    use crate::session::SessionStatus;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn metadata(cycle: &str) -> RunMetadata {
        RunMetadata {
            schema_version: SCHEMA_VERSION,
            cycle_name: cycle.to_string(),
            port_id: "p1".to_string(),
            started_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            interval_secs: 0.5,
            iterations: Some(3),
            client: "stub".to_string(),
            unit_id: 1,
            read_address: 0,
            read_count: 2,
            host: None,
            pid: None,
        }
    }

    fn sample(seq: u64) -> SampleRecord {
        RecordContext {
            cycle_name: "test".to_string(),
            port_id: "p1".to_string(),
            register_map: RegisterMap::Default,
            value_index: 0,
        }
        .sample(seq, Utc::now(), vec![seq as u16, 1], 1)
    }

    fn summary(samples: u64) -> RunSummary {
        RunSummary {
            status: SessionStatus::Stopped,
            samples,
            ended_at: Utc::now(),
            reason: None,
        }
    }

    #[test]
    fn stem_sanitizes_cycle_name() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(base_stem("light roast/2", ts), "light_roast_2_20240305T070809.000");
    }

    #[test]
    fn closed_log_reads_back_byte_identical() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("test"), WriterConfig::default())?;
        let records: Vec<SampleRecord> = (0..5).map(sample).collect();
        for record in &records {
            writer.append(record)?;
        }
        writer.close(&summary(5))?;

        let lines = read_lines(dir.path(), writer.stem())?;
        assert_eq!(lines.len(), 7);
        for (line, record) in lines[1..6].iter().zip(&records) {
            assert_eq!(line, &LogEntry::Sample(record.clone()).to_line()?);
        }
        assert_eq!(read_records(dir.path(), writer.stem())?, records);
        Ok(())
    }

    #[test]
    fn same_tick_runs_get_distinct_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let first = CycleLogWriter::open(dir.path(), &metadata("test"), WriterConfig::default())?;
        let second = CycleLogWriter::open(dir.path(), &metadata("test"), WriterConfig::default())?;
        assert_ne!(first.path(), second.path());
        assert_eq!(second.stem(), format!("{}-1", first.stem()));
        // the active file of one run is not a segment of the other
        assert_eq!(list_segments(dir.path(), first.stem())?, vec![first.path()]);
        Ok(())
    }

    #[test]
    fn rotation_archives_segments_in_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = WriterConfig {
            max_segment_bytes: 1,
            ..WriterConfig::default()
        };
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("rot"), config)?;
        for seq in 0..3 {
            writer.append(&sample(seq))?;
        }
        writer.close(&summary(3))?;

        let segments = writer.segments()?;
        let names: Vec<String> = segments
            .iter()
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        let stem = writer.stem().to_string();
        assert_eq!(
            names,
            vec![
                format!("{stem}.0001.zip"),
                format!("{stem}.0002.zip"),
                format!("{stem}.0003.zip"),
                format!("{stem}.log"),
            ]
        );

        let sequences: Vec<u64> = read_records(dir.path(), &stem)?
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        let entries = read_run(dir.path(), &stem)?;
        assert!(matches!(entries.first(), Some(LogEntry::Run(_))));
        assert!(matches!(entries.last(), Some(LogEntry::End(_))));
        Ok(())
    }

    #[test]
    fn aged_segment_rotates_with_sync_on_append() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = WriterConfig {
            max_segment_bytes: 0,
            max_segment_age_secs: Some(1),
            sync_on_append: true,
            ..WriterConfig::default()
        };
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("aged"), config)?;
        writer.append(&sample(0))?;
        writer.append(&sample(1))?;
        assert_eq!(writer.segments()?, vec![writer.path()]);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        writer.append(&sample(2))?;
        writer.append(&sample(3))?;
        let stem = writer.stem().to_string();
        assert_eq!(
            writer.segments()?,
            vec![dir.path().join(format!("{stem}.0001.zip")), writer.path()]
        );

        // synced records are readable before the run is closed
        let sequences: Vec<u64> = read_records(dir.path(), &stem)?
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);

        writer.close(&summary(4))?;
        assert_eq!(read_records(dir.path(), &stem)?.len(), 4);
        Ok(())
    }

    #[test]
    fn rotation_without_compression_renames() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = WriterConfig {
            max_segment_bytes: 1,
            compress_segments: false,
            ..WriterConfig::default()
        };
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("plain"), config)?;
        writer.append(&sample(0))?;
        let renamed = dir.path().join(format!("{}.0001.log", writer.stem()));
        assert!(renamed.is_file());
        assert_eq!(read_records(dir.path(), writer.stem())?.len(), 1);
        Ok(())
    }

    #[test]
    fn active_log_is_readable_and_partial_line_skipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("tail"), WriterConfig::default())?;
        writer.append(&sample(0))?;
        writer.append(&sample(1))?;
        writer.flush()?;
        assert_eq!(read_records(dir.path(), writer.stem())?.len(), 2);

        let mut raw = OpenOptions::new().append(true).open(writer.path())?;
        raw.write_all(br#"{"kind":"sample","timest"#)?;
        assert_eq!(read_records(dir.path(), writer.stem())?.len(), 2);
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_append_after_close_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut writer = CycleLogWriter::open(dir.path(), &metadata("c"), WriterConfig::default())?;
        writer.close(&summary(0))?;
        writer.close(&summary(0))?;
        assert!(writer.is_closed());
        assert!(matches!(writer.append(&sample(0)), Err(WriteError::Closed(_))));
        let ends = read_run(dir.path(), writer.stem())?
            .iter()
            .filter(|e| matches!(e, LogEntry::End(_)))
            .count();
        assert_eq!(ends, 1);
        Ok(())
    }

    #[test]
    fn unwritable_directory_is_a_write_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"")?;
        let result = CycleLogWriter::open(&blocker, &metadata("x"), WriterConfig::default());
        assert!(matches!(result, Err(WriteError::Io { .. })));
        Ok(())
    }
}
