// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Hardware Modbus transport
//!
//! The roaster controller is addressed by its unit id, which tokio-modbus
//! calls a `Slave`.
//!
//! Two links are supported:
//! - RTU: the port `device` is a serial device opened with `tokio-serial`
//!   using the configured baud rate, parity, stop bits and byte size.
//! - TCP: the port `device` is a `host:port` endpoint (Modbus gateways,
//!   simulators and virtual ports).

use log::{debug, info};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

use crate::config::{Parity, PortConfig};
use crate::error::BusError;
use crate::modbus::Transport;

/// Physical link used by a [`ModbusTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareLink {
    Rtu,
    Tcp,
}

/// Transport talking to a real Modbus server
pub struct ModbusTransport {
    link: HardwareLink,
    ctx: Option<Context>,
}

impl ModbusTransport {
    pub fn new(link: HardwareLink) -> Self {
        Self { link, ctx: None }
    }

    fn open_serial(port: &PortConfig) -> Result<SerialStream, BusError> {
        let data_bits = match port.bytesize {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match port.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match port.stopbits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let builder = tokio_serial::new(port.device.as_str(), port.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(port.timeout_duration());

        SerialStream::open(&builder)
            .map_err(|err| BusError::Transport(format!("cannot open {}: {}", port.device, err)))
    }

    async fn open_tcp(port: &PortConfig) -> Result<Context, BusError> {
        let socket_addr = tokio::net::lookup_host(port.device.as_str())
            .await
            .map_err(|err| BusError::Transport(format!("cannot resolve {}: {}", port.device, err)))?
            .next()
            .ok_or_else(|| BusError::Transport(format!("no address for {}", port.device)))?;

        tcp::connect_slave(socket_addr, Slave(port.unit_id))
            .await
            .map_err(|err| BusError::Transport(format!("cannot connect {}: {}", socket_addr, err)))
    }
}

#[async_trait::async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self, port: &PortConfig) -> Result<(), BusError> {
        let ctx = match self.link {
            HardwareLink::Rtu => {
                let stream = Self::open_serial(port)?;
                rtu::attach_slave(stream, Slave(port.unit_id))
            }
            HardwareLink::Tcp => Self::open_tcp(port).await?,
        };
        info!(
            "Opened Modbus {:?} link to {} (unit {})",
            self.link, port.device, port.unit_id
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, BusError> {
        let ctx = self.ctx.as_mut().ok_or(BusError::NotConnected)?;
        ctx.set_slave(Slave(unit_id));
        match ctx.read_holding_registers(address, count).await {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(exception)) => Err(BusError::Transport(format!(
                "Modbus exception response: {:?}",
                exception
            ))),
            Err(err) => Err(BusError::Transport(err.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if let Some(mut ctx) = self.ctx.take() {
            debug!("Closing Modbus {:?} link", self.link);
            ctx.disconnect()
                .await
                .map_err(|err| BusError::Transport(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::tests::test_port;

    #[tokio::test]
    async fn read_without_link_is_not_connected() {
        let mut transport = ModbusTransport::new(HardwareLink::Tcp);
        assert!(matches!(
            transport.read_holding_registers(0, 1, 1).await,
            Err(BusError::NotConnected)
        ));
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn missing_serial_device_fails_to_connect() {
        let mut port = test_port();
        port.device = "/dev/roaster-logger-missing-device".to_string();
        let mut transport = ModbusTransport::new(HardwareLink::Rtu);
        assert!(transport.connect(&port).await.is_err());
    }

    #[tokio::test]
    async fn unresolvable_tcp_endpoint_fails_to_connect() {
        let mut port = test_port();
        port.device = "not a socket address".to_string();
        let mut transport = ModbusTransport::new(HardwareLink::Tcp);
        assert!(transport.connect(&port).await.is_err());
    }
}
