//! Error type shared by all protocol operations.

use crate::digital_channel::ChannelError;
use crate::transaction::TransactionState;
use std::time::Duration;

/// Hard failures of a protocol descriptor or transaction.
///
/// UART framing and parity anomalies are deliberately not represented here; they
/// are counted on the descriptor and reported with the successful reading.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unable to find slave device at address 0x{address:02x}")]
    NoResponse { address: u16 },

    #[error("Slave device rejected data byte {index}")]
    DataRejected { index: usize },

    #[error("Digital channel unavailable: {0}")]
    ChannelUnavailable(#[from] ChannelError),

    #[error("Timed out after {waited:?} while {state}")]
    Timeout {
        state: TransactionState,
        waited: Duration,
    },

    #[error("Incomplete frame: expected {expected} bytes but decoded {decoded}")]
    IncompleteFrame { expected: usize, decoded: usize },

    #[error("Failed to start capture worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("Capture worker stopped without delivering samples")]
    CaptureAborted,
}
