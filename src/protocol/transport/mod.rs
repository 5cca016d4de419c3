//! ISO 11783 transport layer: CAN frame representations, 29-bit identifier
//! management, transport protocol state machines, and bus abstraction traits.
//!
//! ## Transport Protocol Timing Constants
//!
//! These constants are the timeouts mandated by ISO 11783-3 / SAE J1939-21
//! for the multi-frame transport protocol. They are enforced by the session
//! engine in [`tp`].

pub mod can_frame;
pub mod tp;
pub mod traits;

/// PGN of the transport protocol connection management frames (TP.CM).
pub const TRANSPORT_CONNECTION_MANAGEMENT_PGN: u32 = 0x00EC00;

/// PGN of the transport protocol data transfer frames (TP.DT).
pub const TRANSPORT_DATA_TRANSFER_PGN: u32 = 0x00EB00;

/// Priority of every frame the transport protocol emits (lowest).
pub const TRANSPORT_PRIORITY: u8 = 7;

/// Payload bytes carried per data frame, after the leading sequence number.
pub const PROTOCOL_BYTES_PER_FRAME: usize = 7;

/// The largest message the transport protocol can move (255 packets × 7 bytes).
pub const MAX_PROTOCOL_DATA_LENGTH: usize = 1785;

/// The smallest message worth a transport session; anything shorter fits a
/// single CAN frame and never reaches this layer.
pub const MIN_PROTOCOL_DATA_LENGTH: usize = 9;

/// T1: receiver watchdog between broadcast data frames (ms).
pub const T1_TIMEOUT_MS: u64 = 750;

/// T2/T3: transmitter wait for Clear To Send / End of Message ACK (ms).
pub const T2_T3_TIMEOUT_MS: u64 = 1250;

/// T4: held-open window after a CTS pause (ms). Reserved for CTS(0) holds.
pub const T4_TIMEOUT_MS: u64 = 1050;

/// Tr: receiver watchdog between connection-mode data frames (ms).
pub const TR_TIMEOUT_MS: u64 = 200;
