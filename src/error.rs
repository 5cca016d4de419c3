//! Error definitions shared across library modules.
//! Each type models a specific failure scenario.
use thiserror_no_std::Error;

#[derive(Error, Debug, PartialEq, Eq)]
/// Reasons a transmit submission is refused before a session is created.
pub enum TransmitStartError {
    /// Payload length outside the 9..=1785 byte range the protocol covers.
    #[error("Payload length {len} outside the supported multi-frame range")]
    InvalidLength { len: usize },
    /// The source control function holds no valid bus address.
    #[error("Source control function has no valid address")]
    InvalidSource,
    /// A session for this source and destination pair is already running.
    #[error("Session already active for this source and destination")]
    SessionAlreadyActive,
    /// The configured session capacity has been reached.
    #[error("Session table is full")]
    SessionTableFull,
}
