// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Logging sessions
//!
//! A [`Session`] is one logging run against one port. It is the only component
//! that decides whether a failure is fatal and that reports the final status.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──► running ──► stopped
//!                │   └──► stopping ──► stopped   (stop request, marker removed,
//!                │                                license lapsed)
//!                └──► failed                      (fatal write error)
//! pending ──► failed                              (connect retries exhausted)
//! ```
//!
//! Starting a session validates the port snapshot, consults the license gate,
//! connects the bus client, opens the cycle log and finally publishes the
//! session marker. Configuration and license errors leave the session
//! `pending`: nothing was opened and no file was created.
//!
//! The poll loop runs on a fixed schedule anchored at the first tick, so a slow
//! read delays one sample without shifting the following ones. Before each
//! sample it checks the [`StopHandle`], the session marker and, every
//! `recheck_interval_secs`, the license gate.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use roaster_logger::config::Config;
//! use roaster_logger::session::{CycleRequest, Session, SettingsLicense};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_file("config/settings.yaml")?;
//! let license = Arc::new(SettingsLicense::new(config.license.clone()));
//! let mut request = CycleRequest::new("light-roast", "roaster_1");
//! request.iterations = Some(3);
//! request.interval = Some(0.5);
//!
//! let mut session = Session::new(&config, request, license);
//! let report = session.run().await?;
//! println!("{} samples in {:?}", report.samples, report.files);
//! # Ok(())
//! # }
//! ```

pub mod license;
pub mod marker;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::acquisition::{CycleLogWriter, RecordContext, RunMetadata, RunSummary, SCHEMA_VERSION};
use crate::config::{Config, PortConfig, RegisterMap, RunOverrides, WriterConfig};
use crate::config::port::positive_duration;
use crate::error::{BusError, SessionError, WriteError};
use crate::modbus::{BusClient, ClientKind, Transport};

pub use license::{LicenseGate, LicenseStatus, SettingsLicense, StaticLicense};
pub use marker::{MarkerEntry, MarkerStore, SessionMarker};

/// Iterations of a `start-cycle` run when none is given
pub const DEFAULT_ITERATIONS: u64 = 5;

/// Status of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to log and how
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub cycle_name: String,
    pub port_id: String,
    /// Number of samples; `None` runs until stopped
    pub iterations: Option<u64>,
    /// Seconds between samples; `None` uses the port's `poll_interval`
    pub interval: Option<f64>,
    pub overrides: RunOverrides,
    pub client: ClientKind,
}

impl CycleRequest {
    pub fn new(cycle_name: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            cycle_name: cycle_name.into(),
            port_id: port_id.into(),
            iterations: Some(DEFAULT_ITERATIONS),
            interval: None,
            overrides: RunOverrides::default(),
            client: ClientKind::default(),
        }
    }
}

/// Cooperative stop request shared with signal handlers
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop before its next sample
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stop_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of a session that reached `stopped`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub cycle_name: String,
    pub port_id: String,
    /// Sample records written, error samples included
    pub samples: u64,
    pub error_samples: u64,
    /// Segments of the cycle log, oldest first
    pub files: Vec<PathBuf>,
    /// Why the run ended before its planned iterations
    pub reason: Option<String>,
}

/// Validated parameters of one run
struct RunPlan {
    port: PortConfig,
    interval: Duration,
    interval_secs: f64,
    register_map: RegisterMap,
}

/// One logging run
pub struct Session {
    request: CycleRequest,
    /// Snapshot taken at construction, later settings edits do not apply
    port: Option<PortConfig>,
    log_dir: PathBuf,
    writer_config: WriterConfig,
    markers: MarkerStore,
    license: Arc<dyn LicenseGate>,
    license_recheck: Duration,
    transport: Option<Box<dyn Transport>>,
    stop: StopHandle,
    status: SessionStatus,
    error_samples: u64,
}

impl Session {
    pub fn new(config: &Config, request: CycleRequest, license: Arc<dyn LicenseGate>) -> Self {
        Self {
            port: config.port(&request.port_id).cloned(),
            request,
            log_dir: config.app.log_dir.clone(),
            writer_config: config.writer.clone(),
            markers: MarkerStore::new(config.sessions_dir()),
            license,
            license_recheck: Duration::from_secs(config.license.recheck_interval_secs),
            transport: None,
            stop: StopHandle::new(),
            status: SessionStatus::Pending,
            error_samples: 0,
        }
    }

    /// Use this transport instead of the one selected by the request's client
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_license_recheck(mut self, every: Duration) -> Self {
        self.license_recheck = every;
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn request(&self) -> &CycleRequest {
        &self.request
    }

    fn prepare(&self) -> Result<RunPlan, SessionError> {
        if self.request.cycle_name.trim().is_empty() {
            return Err(SessionError::Config("cycle name must not be empty".to_string()));
        }
        let port = self.port.as_ref().ok_or_else(|| {
            SessionError::Config(format!("unknown port '{}'", self.request.port_id))
        })?;
        if !port.enabled {
            return Err(SessionError::Config(format!("port '{}' is disabled", port.id)));
        }

        let port = port.with_overrides(&self.request.overrides);
        port.validate()
            .map_err(|e| SessionError::Config(format!("{:#}", e)))?;
        let register_map =
            RegisterMap::parse(&port.register_map).map_err(|e| SessionError::Config(e.to_string()))?;

        let interval_secs = self.request.interval.unwrap_or(port.poll_interval);
        let interval = positive_duration("interval", interval_secs)
            .map_err(|e| SessionError::Config(e.to_string()))?;

        Ok(RunPlan {
            port,
            interval,
            interval_secs,
            register_map,
        })
    }

    /// Run the session to completion.
    ///
    /// Returns a report once the session is `stopped`. Errors returned after the
    /// bus was opened leave the session `failed`; the cycle log is closed and
    /// the marker removed on every path.
    pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
        let plan = self.prepare()?;
        let port_id = plan.port.id.clone();

        let license = self.license.check();
        if !license.permitted {
            let reason = license.denial_reason();
            warn!("Logging on port '{}' refused: {}", port_id, reason);
            return Err(SessionError::LicenseDenied { reason });
        }

        let marker_path = self.markers.path_for(&port_id);
        if marker_path.exists() {
            return Err(SessionError::AlreadyActive {
                port_id,
                marker: marker_path,
            });
        }

        let transport = self
            .transport
            .take()
            .unwrap_or_else(|| self.request.client.create_transport());
        let mut bus = BusClient::new(plan.port.clone(), transport);
        info!(
            "Starting cycle '{}' on port '{}' ({} client)",
            self.request.cycle_name, port_id, self.request.client
        );
        if let Err(err) = bus.connect().await {
            self.status = SessionStatus::Failed;
            bus.close().await;
            return Err(SessionError::Connection(err));
        }

        let started_at = Utc::now();
        let host = hostname::get().ok().and_then(|h| h.into_string().ok());
        let metadata = RunMetadata {
            schema_version: SCHEMA_VERSION,
            cycle_name: self.request.cycle_name.clone(),
            port_id: port_id.clone(),
            started_at,
            interval_secs: plan.interval_secs,
            iterations: self.request.iterations,
            client: self.request.client.to_string(),
            unit_id: plan.port.unit_id,
            read_address: plan.port.read_address,
            read_count: plan.port.read_count,
            host: host.clone(),
            pid: Some(std::process::id()),
        };
        let mut writer = match CycleLogWriter::open(&self.log_dir, &metadata, self.writer_config.clone()) {
            Ok(writer) => writer,
            Err(err) => {
                self.status = SessionStatus::Failed;
                bus.close().await;
                return Err(err.into());
            }
        };

        let marker = SessionMarker {
            cycle_name: self.request.cycle_name.clone(),
            port_id: port_id.clone(),
            started_at,
            pid: std::process::id(),
            host,
            log_file: writer.path(),
        };
        if let Err(err) = self.markers.create(&marker) {
            self.status = SessionStatus::Failed;
            let summary = RunSummary {
                status: SessionStatus::Failed,
                samples: 0,
                ended_at: Utc::now(),
                reason: Some(err.to_string()),
            };
            if let Err(close_err) = writer.close(&summary) {
                warn!("Failed to close {:?}: {}", writer.path(), close_err);
            }
            bus.close().await;
            return Err(err);
        }

        self.status = SessionStatus::Running;
        info!(
            "Session '{}' running on port '{}', logging to {:?}",
            marker.cycle_name,
            port_id,
            writer.path()
        );

        let outcome = self.poll(&mut bus, &mut writer, &marker, &plan).await;
        bus.close().await;
        self.finish(outcome, &mut writer, &marker)
    }

    /// Close the log, release the marker and settle the final status
    fn finish(
        &mut self,
        outcome: Result<Option<String>, WriteError>,
        writer: &mut CycleLogWriter,
        marker: &SessionMarker,
    ) -> Result<SessionReport, SessionError> {
        let (mut status, mut reason, mut failure) = match outcome {
            Ok(reason) => (SessionStatus::Stopped, reason, None),
            Err(err) => {
                error!("Session '{}' failed: {}", marker.cycle_name, err);
                (SessionStatus::Failed, Some(err.to_string()), Some(err))
            }
        };

        let summary = RunSummary {
            status,
            samples: writer.records(),
            ended_at: Utc::now(),
            reason: reason.clone(),
        };
        if let Err(err) = writer.close(&summary) {
            error!("Failed to close cycle log {:?}: {}", writer.path(), err);
            if failure.is_none() {
                status = SessionStatus::Failed;
                reason = Some(err.to_string());
                failure = Some(err);
            }
        }

        // only release the marker we published; a stop may have removed it
        // and another session may have claimed the port since
        if self.markers.owns(marker) {
            if let Err(err) = self.markers.remove(&marker.port_id) {
                error!("Failed to remove session marker: {}", err);
            }
        }
        self.status = status;

        let mut files = writer.segments().unwrap_or_else(|err| {
            warn!("Cannot list log segments: {}", err);
            Vec::new()
        });
        if files.is_empty() {
            files.push(writer.path());
        }
        info!(
            "Session '{}' on port '{}' {} after {} sample(s)",
            marker.cycle_name,
            marker.port_id,
            status,
            writer.records()
        );

        match failure {
            Some(source) => Err(SessionError::Write { source, files }),
            None => Ok(SessionReport {
                status,
                cycle_name: marker.cycle_name.clone(),
                port_id: marker.port_id.clone(),
                samples: writer.records(),
                error_samples: self.error_samples,
                files,
                reason,
            }),
        }
    }

    /// Poll until the planned iterations are done or a stop condition is seen.
    ///
    /// Returns the stop reason, `None` when all iterations completed.
    async fn poll(
        &mut self,
        bus: &mut BusClient,
        writer: &mut CycleLogWriter,
        marker: &SessionMarker,
        plan: &RunPlan,
    ) -> Result<Option<String>, WriteError> {
        let stop = self.stop.clone();
        let context = RecordContext {
            cycle_name: self.request.cycle_name.clone(),
            port_id: plan.port.id.clone(),
            register_map: plan.register_map,
            value_index: plan.port.value_index,
        };
        let mut ticker = tokio::time::interval(plan.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut license_checked = Instant::now();
        let mut sequence: u64 = 0;

        loop {
            if self.request.iterations.is_some_and(|n| sequence >= n) {
                return Ok(None);
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.stopped() => {}
            }

            if let Some(reason) = self.stop_reason(&stop, marker, &mut license_checked) {
                self.status = SessionStatus::Stopping;
                info!("Stopping session '{}': {}", marker.cycle_name, reason);
                return Ok(Some(reason));
            }

            let timestamp = Utc::now();
            let record = match bus.read().await {
                Ok(read) => context.sample(sequence, timestamp, read.values, read.attempts),
                Err(err) => {
                    let attempts = match &err {
                        BusError::Read { attempts, .. } => *attempts,
                        _ => 1,
                    };
                    warn!("Sample {} of '{}' recorded as error: {}", sequence, marker.cycle_name, err);
                    self.error_samples += 1;
                    context.failed(sequence, timestamp, attempts, err.to_string())
                }
            };
            writer.append(&record)?;
            debug!("Sample {} written ({:?})", sequence, record.status);
            sequence += 1;
        }
    }

    fn stop_reason(
        &self,
        stop: &StopHandle,
        marker: &SessionMarker,
        license_checked: &mut Instant,
    ) -> Option<String> {
        if stop.is_stop_requested() {
            return Some("stop requested".to_string());
        }
        if !self.markers.owns(marker) {
            return Some("session marker removed".to_string());
        }
        if license_checked.elapsed() >= self.license_recheck {
            *license_checked = Instant::now();
            let status = self.license.check();
            if !status.permitted {
                return Some(format!("license no longer valid: {}", status.denial_reason()));
            }
        }
        None
    }
}
