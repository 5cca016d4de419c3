//! Abstraction traits used by the transport layer (CAN transmitter and clock).
pub mod can_transmitter;
pub mod transport_clock;
