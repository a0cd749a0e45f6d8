// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus bus client
//!
//! This module reads the configured holding-register window of one port. It is
//! split in two layers:
//!
//! - [`Transport`]: a single connect/read/close attempt against one endpoint.
//!   The closed set of implementations is selected through [`ClientKind`]:
//!   the synthetic [`StubTransport`] and the hardware [`ModbusTransport`]
//!   (RTU over a serial line, or TCP).
//! - [`BusClient`]: wraps a transport with the port's timeout and retry policy.
//!   Connect retries gate the session start, read retries gate every sample.
//!
//! ## Usage
//!
//! ```no_run
//! use roaster_logger::config::Config;
//! use roaster_logger::modbus::{BusClient, ClientKind};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_file("config/settings.yaml")?;
//! let port = config.port("roaster_1").unwrap().clone();
//! let mut bus = BusClient::new(port, ClientKind::Stub.create_transport());
//! bus.connect().await?;
//! let read = bus.read().await?;
//! println!("registers: {:?}", read.values);
//! bus.close().await;
//! # Ok(())
//! # }
//! ```

pub mod hardware;
pub mod stub;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{debug, error, warn};

use crate::config::PortConfig;
use crate::error::BusError;

pub use hardware::{HardwareLink, ModbusTransport};
pub use stub::StubTransport;

/// One attempt-level connection to a Modbus endpoint
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the underlying link using the port parameters
    async fn connect(&mut self, port: &PortConfig) -> Result<(), BusError>;

    /// Read `count` holding registers starting at `address` from `unit_id`
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, BusError>;

    /// Release the underlying link
    async fn close(&mut self) -> Result<(), BusError>;
}

/// The bus client variants that can be selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    /// Synthetic values, always succeeds
    #[default]
    Stub,
    /// Modbus RTU over the serial device of the port
    Rtu,
    /// Modbus TCP, the port device is `host:port`
    Tcp,
}

impl ClientKind {
    /// Create the transport implementing this variant
    pub fn create_transport(&self) -> Box<dyn Transport> {
        match self {
            ClientKind::Stub => Box::new(StubTransport::new()),
            ClientKind::Rtu => Box::new(ModbusTransport::new(HardwareLink::Rtu)),
            ClientKind::Tcp => Box::new(ModbusTransport::new(HardwareLink::Tcp)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Stub => "stub",
            ClientKind::Rtu => "rtu",
            ClientKind::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stub" => Ok(ClientKind::Stub),
            "rtu" => Ok(ClientKind::Rtu),
            "tcp" => Ok(ClientKind::Tcp),
            other => Err(format!("unknown client '{other}'")),
        }
    }
}

/// Registers returned by a successful [`BusClient::read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRead {
    pub values: Vec<u16>,
    /// Number of attempts used, 1 when the first attempt succeeded
    pub attempts: u32,
}

/// Bus client applying the timeout and retry policy of one port
pub struct BusClient {
    port: PortConfig,
    transport: Box<dyn Transport>,
    /// `connect` succeeded and `close` has not been called since
    connected: bool,
    /// The transport link is currently open
    link_up: bool,
}

impl BusClient {
    /// Create a client for a port snapshot
    pub fn new(port: PortConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            port,
            transport,
            connected: false,
            link_up: false,
        }
    }

    pub fn port(&self) -> &PortConfig {
        &self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect, retrying up to `connect_retries` times after the first attempt
    pub async fn connect(&mut self) -> Result<(), BusError> {
        let attempts = self.port.connect_retries.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(()) => {
                    debug!(
                        "Connected to {} on attempt {}/{}",
                        self.port.device, attempt, attempts
                    );
                    self.connected = true;
                    self.link_up = true;
                    return Ok(());
                }
                Err(err) => {
                    last_reason = err.to_string();
                    if attempt < attempts {
                        debug!(
                            "Connect attempt {}/{} failed for {}: {}",
                            attempt, attempts, self.port.device, err
                        );
                        tokio::time::sleep(self.port.connect_retry_delay_duration()).await;
                    }
                }
            }
        }

        error!(
            "Connect failed after {} attempt(s) for {}: {}",
            attempts, self.port.device, last_reason
        );
        Err(BusError::Connection {
            device: self.port.device.clone(),
            attempts,
            reason: last_reason,
        })
    }

    /// Read the configured register window, retrying up to `read_retries` times
    pub async fn read(&mut self) -> Result<RegisterRead, BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }

        let attempts = self.port.read_retries.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match self.try_read().await {
                Ok(values) => {
                    return Ok(RegisterRead {
                        values,
                        attempts: attempt,
                    })
                }
                Err(err) => {
                    last_reason = err.to_string();
                    if attempt < attempts {
                        debug!(
                            "Read attempt {}/{} failed on {}: {}",
                            attempt, attempts, self.port.device, err
                        );
                        if self.port.reconnect_on_read_error {
                            self.reconnect().await;
                        }
                        tokio::time::sleep(self.port.read_retry_delay_duration()).await;
                    }
                }
            }
        }

        error!(
            "Read failed after {} attempt(s) on {}: {}",
            attempts, self.port.device, last_reason
        );
        Err(BusError::Read {
            device: self.port.device.clone(),
            attempts,
            reason: last_reason,
        })
    }

    /// Close the link. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if self.link_up {
            if let Err(err) = self.transport.close().await {
                warn!("Error closing {}: {}", self.port.device, err);
            }
        }
        self.link_up = false;
        self.connected = false;
    }

    async fn try_connect(&mut self) -> Result<(), BusError> {
        let timeout = self.port.timeout_duration();
        let port = &self.port;
        with_timeout(timeout, "connect", self.transport.connect(port)).await
    }

    async fn try_read(&mut self) -> Result<Vec<u16>, BusError> {
        if !self.link_up {
            // A previous reconnect failed; reopen before reading
            self.try_connect().await?;
            self.link_up = true;
        }
        let timeout = self.port.timeout_duration();
        let (address, count, unit_id) = (
            self.port.read_address,
            self.port.read_count,
            self.port.unit_id,
        );
        with_timeout(
            timeout,
            "read",
            self.transport.read_holding_registers(address, count, unit_id),
        )
        .await
    }

    async fn reconnect(&mut self) {
        if let Err(err) = self.transport.close().await {
            debug!("Error closing {} before reconnect: {}", self.port.device, err);
        }
        self.link_up = false;
        match self.try_connect().await {
            Ok(()) => self.link_up = true,
            Err(err) => error!("Reconnect to {} failed: {}", self.port.device, err),
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: &str,
    future: impl Future<Output = Result<T, BusError>>,
) -> Result<T, BusError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Transport(format!(
            "{} timed out after {:.3}s",
            operation,
            timeout.as_secs_f64()
        ))),
    }
}
