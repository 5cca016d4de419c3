//! `isobus-tp` library: the ISO 11783 / SAE J1939 transport protocol
//! session engine for a `no_std` + `alloc` environment. The crate exposes
//! the node abstractions (control functions and their registry), the CAN
//! transport primitives (frames, 29-bit identifiers, bus traits), and the
//! transport protocol state machines for both the Broadcast Announce and
//! the Connection-Mode variants.
#![no_std]
//==================================================================================
extern crate alloc;
//==================================================================================
/// Domain and low-level errors (CAN identifier construction, transmit
/// submission, and related issues).
pub mod error;
/// ISO 11783 protocol implementation: control function handles and the
/// segmented transport protocol.
pub mod protocol;
//==================================================================================
