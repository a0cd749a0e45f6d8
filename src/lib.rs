// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Roaster logger library
//!
//! This library logs periodic readings of coffee roaster controllers over
//! Modbus into timestamped cycle logs.
//!
//! - [`config`]: YAML settings and the port store
//! - [`modbus`]: bus client with the stub and hardware transports
//! - [`acquisition`]: record schema and the rotating cycle log writer
//! - [`session`]: the logging session, its markers and the license gate
//! - [`cli`]: the `roaster-logger` command line

pub mod acquisition;
pub mod cli;
pub mod config;
pub mod error;
pub mod modbus;
pub mod session;

pub use error::{BusError, SessionError, WriteError};
