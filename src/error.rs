use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single external hypervisor command.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("command template '{0}' is empty or unparsable")]
    BadTemplate(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

#[derive(Error, Debug)]
pub enum MacError {
    #[error("malformed MAC address '{0}'")]
    Malformed(String),
}

/// The hypervisor inventory could not be enumerated at all.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to enumerate virtual machines: {0}")]
    Enumerate(#[source] HypervisorError),
}

/// Reasons a datagram is not a magic packet.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected payload length {0}")]
    Length(usize),

    #[error("synchronization stream is not 6 x 0xFF")]
    Sync,

    #[error("MAC repetition {0} does not match the first")]
    Repetition(usize),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to serialize registry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write registry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read registry {path} after {attempts} attempts: {source}")]
    Read {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse registry {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid operation timeout '{0}' in registry")]
    Timeout(String),
}

/// Fatal listener failures. Each one terminates the service.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("registry was not ready within {0:?}")]
    ReadinessTimeout(Duration),

    #[error(transparent)]
    Load(#[from] RegistryError),

    #[error("failed to resolve listen address {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}
