// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Error taxonomy shared by the bus, the log writer and the session
//!
//! The bus and the writer each surface their own typed error. Only the session
//! decides whether a failure is fatal, and it reports fatal ones as
//! [`SessionError`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a bus client
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to connect to {device} after {attempts} attempt(s): {reason}")]
    Connection {
        device: String,
        attempts: u32,
        reason: String,
    },

    #[error("Read failed on {device} after {attempts} attempt(s): {reason}")]
    Read {
        device: String,
        attempts: u32,
        reason: String,
    },

    #[error("Bus client is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by the log writer. All of them are fatal for a running session.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to archive segment {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Writer for {0} is already closed")]
    Closed(PathBuf),
}

impl WriteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriteError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<WriteError> for SessionError {
    fn from(source: WriteError) -> Self {
        SessionError::Write {
            source,
            files: Vec::new(),
        }
    }
}

/// Errors that end (or prevent) a logging session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging not permitted: {reason}")]
    LicenseDenied { reason: String },

    #[error("A session is already active on port '{port_id}' (marker {marker})")]
    AlreadyActive { port_id: String, marker: PathBuf },

    #[error(transparent)]
    Connection(BusError),

    /// `files` lists the segments holding the records written before the failure
    #[error("Log writer failed: {source}")]
    Write {
        #[source]
        source: WriteError,
        files: Vec<PathBuf>,
    },

    #[error("Session marker error on {path}: {reason}")]
    Marker { path: PathBuf, reason: String },
}

impl SessionError {
    /// Process exit code reported by the command line for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Config(_) => 2,
            SessionError::LicenseDenied { .. } => 3,
            SessionError::AlreadyActive { .. } => 4,
            SessionError::Connection(_) => 5,
            SessionError::Write { .. } => 6,
            SessionError::Marker { .. } => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let errors = [
            SessionError::Config("x".into()),
            SessionError::LicenseDenied { reason: "x".into() },
            SessionError::AlreadyActive {
                port_id: "p".into(),
                marker: PathBuf::from("m"),
            },
            SessionError::Connection(BusError::NotConnected),
            SessionError::Write {
                source: WriteError::Closed(PathBuf::from("f")),
                files: Vec::new(),
            },
            SessionError::Marker {
                path: PathBuf::from("m"),
                reason: "x".into(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(SessionError::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn connection_error_message_names_device() {
        let err = SessionError::Connection(BusError::Connection {
            device: "/dev/ttyUSB0".into(),
            attempts: 4,
            reason: "no response".into(),
        });
        assert_eq!(
            err.to_string(),
            "Failed to connect to /dev/ttyUSB0 after 4 attempt(s): no response"
        );
    }
}
