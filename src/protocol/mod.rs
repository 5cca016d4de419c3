//! High-level components of the ISO 11783 protocol: control function
//! handles and the CAN transport layer.
pub mod node;
pub mod transport;
