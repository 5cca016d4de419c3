//! Minimal abstraction for a non-blocking CAN transmit queue. Allows the
//! engine to plug into various implementations (embedded HAL, desktop
//! driver, test double, etc.).
use crate::protocol::transport::can_frame::CanFrame;

/// Contract to queue CAN frames without blocking.
pub trait CanTransmitter {
    /// Queue a frame for emission on the bus.
    ///
    /// Returns `false` when the frame could not be accepted (TX queue full,
    /// bus off). The engine treats that as transient and retries the same
    /// frame on a later update without losing session state.
    fn transmit(&mut self, frame: &CanFrame) -> bool;
}
