// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Command line interface
//!
//! Argument definitions and command handlers for the `roaster-logger`
//! binary. Handlers write their report to the given output so they can be
//! driven from tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};

use crate::config::{self, Config, Parity, PortPatch, RunOverrides};
use crate::error::SessionError;
use crate::modbus::ClientKind;
use crate::session::{
    CycleRequest, MarkerEntry, MarkerStore, Session, SettingsLicense, StopHandle,
    DEFAULT_ITERATIONS,
};

/// Default settings location, relative to the working directory
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.yaml";

/// Coffee roaster data logger for Modbus temperature controllers
#[derive(Debug, Parser)]
#[command(name = "roaster-logger", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file (YAML format)
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    pub settings: PathBuf,

    /// Path to a settings file to validate and exit
    #[arg(long)]
    pub validate_config: Option<PathBuf>,

    /// Output the settings schema as JSON and exit
    #[arg(long)]
    pub show_config_schema: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log a roast cycle from one port
    StartCycle(StartCycleArgs),

    /// Manage the configured ports
    Ports {
        #[command(subcommand)]
        action: PortsCommand,
    },

    /// List the sessions claimed by markers
    Status,

    /// Clear session markers so running sessions stop at their next sample
    Stop {
        /// Only clear the marker of this port
        #[arg(long)]
        port_id: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct StartCycleArgs {
    #[arg(long)]
    pub port_id: String,

    #[arg(long)]
    pub cycle_name: String,

    /// Number of samples to log
    #[arg(long, default_value_t = DEFAULT_ITERATIONS, conflicts_with = "continuous")]
    pub iterations: u64,

    /// Log until stopped
    #[arg(long)]
    pub continuous: bool,

    /// Seconds between samples (defaults to the port poll interval)
    #[arg(long)]
    pub interval: Option<f64>,

    /// First holding register to read
    #[arg(long)]
    pub address: Option<u16>,

    /// Number of holding registers to read
    #[arg(long)]
    pub count: Option<u16>,

    /// Per-operation timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    #[arg(long)]
    pub connect_retries: Option<u32>,

    #[arg(long)]
    pub read_retries: Option<u32>,

    /// Bus client: stub, rtu or tcp
    #[arg(long, default_value_t = ClientKind::Stub)]
    pub client: ClientKind,
}

impl StartCycleArgs {
    pub fn to_request(&self) -> CycleRequest {
        let mut request = CycleRequest::new(self.cycle_name.clone(), self.port_id.clone());
        request.iterations = if self.continuous {
            None
        } else {
            Some(self.iterations)
        };
        request.interval = self.interval;
        request.client = self.client;
        request.overrides = RunOverrides {
            timeout: self.timeout,
            connect_retries: self.connect_retries,
            read_retries: self.read_retries,
            read_address: self.address,
            read_count: self.count,
        };
        request
    }
}

#[derive(Debug, Subcommand)]
pub enum PortsCommand {
    /// Print one line per configured port
    List,
    /// Add a port; every transport field is required
    Add(PortArgs),
    /// Change the given fields of an existing port
    Update(PortArgs),
    /// Remove a port
    Remove {
        #[arg(long)]
        port_id: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct PortArgs {
    #[arg(long)]
    pub port_id: String,
    /// Serial device, or host:port for the tcp client
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub baudrate: Option<u32>,
    /// N, E or O
    #[arg(long)]
    pub parity: Option<Parity>,
    #[arg(long)]
    pub stopbits: Option<u8>,
    #[arg(long)]
    pub bytesize: Option<u8>,
    #[arg(long)]
    pub timeout: Option<f64>,
    #[arg(long)]
    pub poll_interval: Option<f64>,
    #[arg(long)]
    pub unit_id: Option<u8>,
    /// default or tenths
    #[arg(long)]
    pub register_map: Option<String>,
    #[arg(long)]
    pub read_address: Option<u16>,
    #[arg(long)]
    pub read_count: Option<u16>,
    #[arg(long)]
    pub value_index: Option<usize>,
    #[arg(long)]
    pub enabled: Option<bool>,
    #[arg(long)]
    pub connect_retries: Option<u32>,
    #[arg(long)]
    pub connect_retry_delay: Option<f64>,
    #[arg(long)]
    pub read_retries: Option<u32>,
    #[arg(long)]
    pub read_retry_delay: Option<f64>,
    #[arg(long)]
    pub reconnect_on_read_error: Option<bool>,
}

impl From<PortArgs> for PortPatch {
    fn from(args: PortArgs) -> Self {
        PortPatch {
            id: args.port_id,
            device: args.device,
            baudrate: args.baudrate,
            parity: args.parity,
            stopbits: args.stopbits,
            bytesize: args.bytesize,
            timeout: args.timeout,
            poll_interval: args.poll_interval,
            unit_id: args.unit_id,
            register_map: args.register_map,
            read_address: args.read_address,
            read_count: args.read_count,
            value_index: args.value_index,
            enabled: args.enabled,
            connect_retries: args.connect_retries,
            connect_retry_delay: args.connect_retry_delay,
            read_retries: args.read_retries,
            read_retry_delay: args.read_retry_delay,
            reconnect_on_read_error: args.reconnect_on_read_error,
        }
    }
}

impl Cli {
    /// Log level from the flags, or from the settings file when neither
    /// `--verbose` nor `--quiet` is given
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Off
        } else if self.verbose {
            log::LevelFilter::Debug
        } else {
            settings_log_level(&self.settings)
        }
    }
}

/// Level configured in an existing settings file, `Info` otherwise
fn settings_log_level(path: &Path) -> log::LevelFilter {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| Config::from_yaml_str(&contents).ok())
        .map(|config| config.logging.level_filter())
        .unwrap_or(log::LevelFilter::Info)
}

/// Process exit code for an error returned by [`run`]
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<SessionError>()
        .map(SessionError::exit_code)
        .unwrap_or(1)
}

/// Execute the parsed command line
pub async fn run(cli: Cli, stop: StopHandle, out: &mut (dyn Write + Send)) -> Result<()> {
    if cli.show_config_schema {
        return config::output_config_schema();
    }

    if let Some(path) = &cli.validate_config {
        if !path.exists() {
            anyhow::bail!("Settings file does not exist: {}", path.display());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file at {:?}", path))?;
        Config::from_yaml_str(&contents)
            .map_err(|err| anyhow::anyhow!("Settings validation failed: {:#}", err))?;
        writeln!(out, "Settings file is valid: {}", path.display())?;
        return Ok(());
    }

    let command = cli
        .command
        .context("No command given, see --help for the available commands")?;
    let mut config = Config::from_file(&cli.settings)?;
    debug!("Loaded {} port(s) from {:?}", config.ports.len(), cli.settings);

    match command {
        Command::StartCycle(args) => start_cycle(&config, &args, stop, out).await,
        Command::Ports { action } => ports(&mut config, &cli.settings, action, out),
        Command::Status => status(&config, out),
        Command::Stop { port_id } => stop_sessions(&config, port_id.as_deref(), out),
    }
}

pub async fn start_cycle(
    config: &Config,
    args: &StartCycleArgs,
    stop: StopHandle,
    out: &mut (dyn Write + Send),
) -> Result<()> {
    let license = Arc::new(SettingsLicense::new(config.license.clone()));
    let mut session = Session::new(config, args.to_request(), license).with_stop_handle(stop);

    let report = match session.run().await {
        Ok(report) => report,
        Err(err) => {
            // a failed run still leaves the records written so far on disk
            if let SessionError::Write { files, .. } = &err {
                writeln!(
                    out,
                    "Cycle '{}' on port '{}' {}: partial log kept in",
                    args.cycle_name,
                    args.port_id,
                    session.status()
                )?;
                for file in files {
                    writeln!(out, "  {}", file.display())?;
                }
            }
            return Err(err.into());
        }
    };
    writeln!(
        out,
        "Cycle '{}' on port '{}' {}: {} sample(s), {} with errors",
        report.cycle_name, report.port_id, report.status, report.samples, report.error_samples
    )?;
    if let Some(reason) = &report.reason {
        writeln!(out, "Ended early: {}", reason)?;
    }
    for file in &report.files {
        writeln!(out, "  {}", file.display())?;
    }
    Ok(())
}

pub fn ports(
    config: &mut Config,
    settings_path: &Path,
    action: PortsCommand,
    out: &mut dyn Write,
) -> Result<()> {
    match action {
        PortsCommand::List => {
            if config.ports.is_empty() {
                writeln!(out, "No ports configured")?;
            }
            for port in &config.ports {
                writeln!(out, "{}", port.summary())?;
            }
            return Ok(());
        }
        PortsCommand::Add(args) => {
            if config.port(&args.port_id).is_some() {
                anyhow::bail!("Port '{}' already exists, use 'ports update'", args.port_id);
            }
            let (action, port) = config.upsert_port(args.into())?;
            writeln!(out, "Port '{}' {}", port.id, action)?;
        }
        PortsCommand::Update(args) => {
            if config.port(&args.port_id).is_none() {
                anyhow::bail!("Unknown port '{}'", args.port_id);
            }
            let (action, port) = config.upsert_port(args.into())?;
            writeln!(out, "Port '{}' {}", port.id, action)?;
        }
        PortsCommand::Remove { port_id } => {
            if !config.remove_port(&port_id) {
                anyhow::bail!("Unknown port '{}'", port_id);
            }
            writeln!(out, "Port '{}' removed", port_id)?;
        }
    }
    config.save_to_file(settings_path)?;
    info!("Settings saved to {:?}", settings_path);
    Ok(())
}

/// Report the sessions claimed by markers. A marker is trusted as is: a
/// session whose process died still shows as active until `stop` clears it.
pub fn status(config: &Config, out: &mut dyn Write) -> Result<()> {
    let entries = MarkerStore::new(config.sessions_dir()).list()?;
    if entries.is_empty() {
        writeln!(out, "No active session")?;
        return Ok(());
    }
    for entry in entries {
        match entry {
            MarkerEntry::Active { marker, .. } => writeln!(
                out,
                "active: port '{}' cycle '{}' since {} (pid {}{}) -> {}",
                marker.port_id,
                marker.cycle_name,
                marker.started_at.to_rfc3339(),
                marker.pid,
                marker
                    .host
                    .as_deref()
                    .map(|h| format!(" on {}", h))
                    .unwrap_or_default(),
                marker.log_file.display()
            )?,
            MarkerEntry::Unreadable { path, reason } => writeln!(
                out,
                "stale: unreadable marker {} ({})",
                path.display(),
                reason
            )?,
        }
    }
    Ok(())
}

/// Clear one or every marker. This never waits for, nor signals, the process
/// that owns the session.
pub fn stop_sessions(config: &Config, port_id: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let store = MarkerStore::new(config.sessions_dir());
    match port_id {
        Some(port_id) => {
            if store.remove(port_id)? {
                writeln!(out, "Stop requested for port '{}'", port_id)?;
            } else {
                writeln!(out, "No active session on port '{}'", port_id)?;
            }
        }
        None => {
            let removed = store.remove_all()?;
            writeln!(out, "Stop requested for {} session(s)", removed.len())?;
        }
    }
    Ok(())
}
