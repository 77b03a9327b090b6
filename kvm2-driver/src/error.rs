//! Error types for the KVM machine driver.

use std::time::Duration;
use thiserror::Error;

use crate::state::MachineState;

/// Hint attached to connection failures. Missing group membership is the
/// most common reason the system socket refuses us.
pub const CONNECTION_HINT: &str =
    "Error connecting to libvirt socket. Have you added yourself to the libvirtd group?";

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Failed to connect to the hypervisor.
    #[error("{hint}: {message}")]
    ConnectionFailed {
        /// Operator guidance
        hint: &'static str,
        /// Underlying transport error
        message: String,
    },

    /// Domain lookup found nothing.
    #[error("domain {0} not found")]
    DomainNotFound(String),

    /// Network lookup found nothing.
    #[error("network {0} doesn't exist")]
    NetworkNotFound(String),

    /// Start gave up waiting for a DHCP lease.
    #[error("machine didn't return an IP after {attempts} attempts ({waited:?})")]
    IpTimeout { attempts: u32, waited: Duration },

    /// Stop gave up waiting for the domain to power off.
    #[error("could not stop VM after {attempts} attempts, current state {state}")]
    StopTimeout { state: MachineState, attempts: u32 },

    /// The domain must be running for this operation.
    #[error("host is not running (state {state})")]
    NotRunning { state: MachineState },

    /// The SSH endpoint never became reachable.
    #[error("SSH not available after waiting: {0}")]
    SshUnavailable(String),

    /// A step of Create failed; no rollback was attempted.
    #[error("{step}: {source}")]
    CreateStep {
        step: &'static str,
        #[source]
        source: Box<DriverError>,
    },

    /// Remove could not tear down one or more resources.
    #[error("teardown incomplete: {}", failures.join("; "))]
    Teardown { failures: Vec<String> },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A hypervisor call failed.
    #[error("{op}: {message}")]
    Hypervisor { op: &'static str, message: String },

    /// Disk image provisioning failed.
    #[error("disk image: {0}")]
    DiskImage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Wrap a transport error with the connection hint.
    pub fn connection(message: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            hint: CONNECTION_HINT,
            message: message.to_string(),
        }
    }

    /// Shorthand for a failed hypervisor call.
    pub fn hypervisor(op: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Hypervisor {
            op,
            message: message.to_string(),
        }
    }

    /// Attach the name of the Create step that produced this error.
    pub fn in_step(self, step: &'static str) -> Self {
        Self::CreateStep {
            step,
            source: Box::new(self),
        }
    }

    /// True when an attempt budget ran out (IP wait or shutdown wait).
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::IpTimeout { .. } | Self::StopTimeout { .. } => true,
            Self::CreateStep { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True for domain/network lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DomainNotFound(_) | Self::NetworkNotFound(_))
    }

    /// Name of the Create step that failed, if any.
    pub fn failed_step(&self) -> Option<&'static str> {
        match self {
            Self::CreateStep { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_carries_hint() {
        let err = DriverError::connection("permission denied");
        let msg = err.to_string();
        assert!(msg.contains("libvirtd group"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_timeout_classification() {
        let ip = DriverError::IpTimeout {
            attempts: 40,
            waited: Duration::from_secs(120),
        };
        assert!(ip.is_timeout());

        let stop = DriverError::StopTimeout {
            state: MachineState::Running,
            attempts: 60,
        };
        assert!(stop.is_timeout());
        assert!(stop.to_string().contains("Running"));

        let wrapped = ip.in_step("starting machine");
        assert!(wrapped.is_timeout());
        assert_eq!(wrapped.failed_step(), Some("starting machine"));

        assert!(!DriverError::DomainNotFound("m".into()).is_timeout());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(DriverError::DomainNotFound("m".into()).is_not_found());
        assert!(DriverError::NetworkNotFound("n".into()).is_not_found());
        assert!(!DriverError::hypervisor("destroy", "boom").is_not_found());
    }
}
