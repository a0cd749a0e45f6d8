// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Offline stub transport
//!
//! Lets the logger run without hardware. Register `n` of a read starting at
//! `address` holds `address + n`, so logs produced with the stub are easy to
//! check by eye. The `noise` and `seed` client parameters of the port add a
//! reproducible pseudo-random jitter on top of that ramp.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PortConfig;
use crate::error::BusError;
use crate::modbus::Transport;

/// Synthetic transport that always succeeds once connected
#[derive(Debug, Default)]
pub struct StubTransport {
    connected: bool,
    samples: u64,
    noise: u16,
    rng: Option<StdRng>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reads served since creation
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    async fn connect(&mut self, port: &PortConfig) -> Result<(), BusError> {
        self.noise = port
            .client_param_u64("noise")
            .map(|n| n.min(u64::from(u16::MAX)) as u16)
            .unwrap_or(0);
        if self.noise > 0 && self.rng.is_none() {
            self.rng = Some(match port.client_param_u64("seed") {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            });
        }
        debug!("Stub client connected for port {}", port.id);
        self.connected = true;
        Ok(())
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }
        self.samples += 1;
        let noise = self.noise;
        let values = (0..count)
            .map(|i| {
                let base = address.wrapping_add(i);
                match self.rng.as_mut() {
                    Some(rng) if noise > 0 => base.wrapping_add(rng.random_range(0..=noise)),
                    _ => base,
                }
            })
            .collect();
        debug!(
            "Stub read #{} unit {} address {} count {}",
            self.samples, unit_id, address, count
        );
        Ok(values)
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.connected = false;
        Ok(())
    }
}
