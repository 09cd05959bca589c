//! Unix-socket control channel between the `helm` CLI and the resident daemon.
use crate::{health::ServiceHealth, runtime, supervisor::ServiceStatus};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};
use thiserror::Error;

/// The process-invocation style a service should be (re)started in. Mirrors
/// `DEV_MODE`: a managed Python service started in `Production` runs through
/// its WSGI runner when one is configured; `Development` always runs the
/// interpreter directly against the entrypoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Development,
    Production,
}

impl Default for StartMode {
    fn default() -> Self {
        StartMode::Production
    }
}

/// Message sent from CLI invocations to the resident daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Start a single named service.
    Start { service: String, mode: StartMode },
    /// Stop a single named service.
    Stop { service: String },
    /// Restart a single named service (stop, then start in the given mode).
    Restart { service: String, mode: StartMode },
    /// Fetch status for one service, or all services when `service` is `None`.
    Status { service: Option<String> },
    /// Fetch a health probe for one service, or all services when `service`
    /// is `None`. Runs an on-demand probe rather than waiting for the next
    /// monitor tick.
    Health { service: Option<String> },
    /// List every service known to the registry, running or not.
    List,
    /// Shut down the resident daemon itself.
    Shutdown,
}

/// Response sent by the daemon back to the CLI.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command completed with no payload.
    Ok,
    /// Command failed; message is human-readable.
    Error(String),
    /// Status snapshot for one or more services.
    Status(Vec<ServiceStatus>),
    /// Health probe result for one or more services.
    Health(Vec<ServiceHealth>),
    /// Names of every registered service.
    List(Vec<String>),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("daemon reported error: {0}")]
    Server(String),

    #[error("control socket not available; is the daemon running?")]
    NotAvailable,
}

/// Path to the control-channel Unix domain socket.
pub fn socket_path() -> PathBuf {
    runtime::control_socket_path()
}

/// Sends a command to the daemon and waits for a response.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    let path = socket_path();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads a single command from a connected client stream.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response back to the connected client.
pub fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Removes the control socket file, e.g. during daemon shutdown.
pub fn cleanup_socket() -> Result<(), ControlError> {
    let path = socket_path();
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
