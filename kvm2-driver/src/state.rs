//! Domain state translation.
//!
//! libvirt reports a richer state set than callers care about. This module
//! folds it into the small [`MachineState`] enum. The mapping is total:
//! anything unrecognised becomes [`MachineState::None`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Native libvirt domain state (`virDomainState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    /// Graceful shutdown in progress
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    /// A value newer than this driver knows about
    Unknown(u32),
}

impl DomainState {
    /// Decode the raw `virDomainState` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::NoState,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            other => Self::Unknown(other),
        }
    }
}

/// Caller-facing machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    #[default]
    None,
    Running,
    Paused,
    Stopped,
    Saved,
    Error,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::None => "None",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Stopped => "Stopped",
            MachineState::Saved => "Saved",
            MachineState::Error => "Error",
        };
        f.write_str(s)
    }
}

impl From<DomainState> for MachineState {
    fn from(state: DomainState) -> Self {
        match state {
            // A domain in Shutdown is still answering on the network until
            // it reaches Shutoff.
            DomainState::Running | DomainState::Shutdown => MachineState::Running,
            DomainState::Blocked | DomainState::Crashed => MachineState::Error,
            DomainState::Paused => MachineState::Paused,
            DomainState::Shutoff => MachineState::Stopped,
            DomainState::PmSuspended => MachineState::Saved,
            DomainState::NoState | DomainState::Unknown(_) => MachineState::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_table() {
        let table = [
            (DomainState::Running, MachineState::Running),
            (DomainState::Shutdown, MachineState::Running),
            (DomainState::Blocked, MachineState::Error),
            (DomainState::Crashed, MachineState::Error),
            (DomainState::Paused, MachineState::Paused),
            (DomainState::Shutoff, MachineState::Stopped),
            (DomainState::PmSuspended, MachineState::Saved),
            (DomainState::NoState, MachineState::None),
        ];

        for (native, expected) in table {
            assert_eq!(MachineState::from(native), expected, "{:?}", native);
        }
    }

    #[test]
    fn test_unknown_values_fall_through_to_none() {
        for raw in [8, 9, 42, u32::MAX] {
            let native = DomainState::from_raw(raw);
            assert_eq!(native, DomainState::Unknown(raw));
            assert_eq!(MachineState::from(native), MachineState::None);
        }
    }

    #[test]
    fn test_raw_decoding() {
        assert_eq!(DomainState::from_raw(1), DomainState::Running);
        assert_eq!(DomainState::from_raw(4), DomainState::Shutdown);
        assert_eq!(DomainState::from_raw(5), DomainState::Shutoff);
        assert_eq!(DomainState::from_raw(7), DomainState::PmSuspended);
    }
}
