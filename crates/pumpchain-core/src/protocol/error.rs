//! Protocol errors

use thiserror::Error;

use super::decoder::FaultKind;

/// Errors that can occur while talking to the pump chain
#[derive(Error, Debug)]
pub enum PumpError {
    /// The serial channel could not be opened, written, read or flushed
    #[error("Serial transport error: {0}")]
    Transport(String),

    /// No terminal marker arrived within the response budget
    #[error("Timed out after {waited_ms}ms waiting for reply to {command:?}")]
    Timeout {
        /// The command that went unanswered
        command: String,
        /// Budget that elapsed
        waited_ms: u64,
    },

    /// Reply text could not be interpreted (unit suffix, number, discovery scan)
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The device answered with a fault sentinel instead of data
    #[error("Pump {address:02} rejected command ({kind}): {detail}")]
    DeviceFault {
        /// Pump that rejected the command
        address: u8,
        /// Sentinel it answered with
        kind: FaultKind,
        /// Line following the sentinel
        detail: String,
    },

    /// Discovery probed every address and none answered with status digits
    #[error("No pump answered on addresses 00..{probed:02}")]
    NoPumpsFound {
        /// Number of addresses probed
        probed: u8,
    },

    /// Address that does not fit the two-digit prefix
    #[error("Pump address {0} is outside 0..=99")]
    AddressOutOfRange(u32),

    /// Front-end text that is not a valid address or `address=rate` list
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PumpError {
    /// True when the failure is a reply timeout rather than a hard error
    pub fn is_timeout(&self) -> bool {
        matches!(self, PumpError::Timeout { .. })
    }

    /// True for replies that arrived but could not be used
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            PumpError::MalformedResponse(_)
                | PumpError::DeviceFault { .. }
                | PumpError::NoPumpsFound { .. }
        )
    }
}

impl From<serialport::Error> for PumpError {
    fn from(e: serialport::Error) -> Self {
        PumpError::Transport(e.to_string())
    }
}
