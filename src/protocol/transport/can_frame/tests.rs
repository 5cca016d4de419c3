//! Unit tests for transport identifier assembly and frame field extraction.
use super::*;

//==================================================================================CAN_ID

#[test]
/// A connection management identifier carries priority, PGN, destination,
/// and source in their J1939 positions.
fn test_connection_management_id_assembly() {
    let id = CanId::transport(0x00EC00, 7, 0x1C, 0x2A);

    assert_eq!(id.0, 0x1CEC2A1C);
    assert_eq!(id.priority(), 7);
    assert_eq!(id.pgn(), 0x00EC00);
    assert_eq!(id.destination(), Some(0x2A));
    assert_eq!(id.source_address(), 0x1C);
}

#[test]
/// Addressing every node puts the global address in the PS field; the PGN
/// stays the plain data transfer group.
fn test_data_transfer_id_to_global() {
    let id = CanId::transport(0x00EB00, 7, 0x80, 0xFF);

    assert_eq!(id.0, 0x1CEBFF80);
    assert_eq!(id.pgn(), 0x00EB00);
    assert_eq!(id.destination(), Some(0xFF));
    assert_eq!(id.source_address(), 0x80);
}

#[test]
/// Stray priority bits must not leak into the reserved identifier bits.
fn test_priority_is_masked() {
    let id = CanId::transport(0x00EC00, 0xFF, 0x01, 0x02);

    assert_eq!(id.0 >> 29, 0, "bits above the 29-bit identifier stay clear");
    assert_eq!(id.priority(), 7);
}

#[test]
/// The data page bit travels between PGN position and identifier position.
fn test_data_page_bit_preserved() {
    let id = CanId::transport(0x01EC00, 7, 0x01, 0x02);

    assert_eq!(id.0, 0x1DEC0201);
    assert_eq!(id.pgn(), 0x01EC00);
    assert_eq!(id.destination(), Some(0x02));
}

#[test]
/// A PDU2 identifier (PF >= 240) has no destination; its PS byte is the
/// group extension and belongs to the PGN.
fn test_pdu2_identifier_fields() {
    let id = CanId(0x18FEE61C);

    assert_eq!(id.priority(), 6);
    assert_eq!(id.pgn(), 0xFEE6);
    assert_eq!(id.destination(), None);
    assert_eq!(id.source_address(), 0x1C);
}

#[test]
/// Round-trips through the `embedded-can` extended identifier type.
fn test_embedded_can_round_trip() {
    let id = CanId::transport(0x00EB00, 7, 0x80, 0xFF);

    let extended: embedded_can::ExtendedId = id.into();
    assert_eq!(CanId::from(extended), id);
}

//==================================================================================CAN_FRAME

/// Minimal `embedded_can::Frame` implementation standing in for a HAL
/// driver's frame type.
struct HalFrame {
    id: embedded_can::Id,
    data: [u8; 8],
    dlc: usize,
    remote: bool,
}

impl embedded_can::Frame for HalFrame {
    fn new(id: impl Into<embedded_can::Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buffer = [0u8; 8];
        buffer[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buffer,
            dlc: data.len(),
            remote: false,
        })
    }

    fn new_remote(id: impl Into<embedded_can::Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        Some(Self {
            id: id.into(),
            data: [0u8; 8],
            dlc,
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, embedded_can::Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> embedded_can::Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }
}

#[test]
/// An extended data frame converts with its identifier and payload intact;
/// bytes past the DLC are padded.
fn test_from_embedded_extended_data_frame() {
    let id: embedded_can::ExtendedId = CanId::transport(0x00EC00, 7, 0x2A, 0x80).into();
    let hal = embedded_can::Frame::new(id, &[0x10, 20, 0, 3, 0xFF]).and_then(|frame: HalFrame| {
        CanFrame::from_embedded(&frame)
    });

    let frame = hal.expect("extended data frame converts");
    assert_eq!(frame.id.pgn(), 0x00EC00);
    assert_eq!(frame.id.source_address(), 0x2A);
    assert_eq!(frame.len, 5);
    assert_eq!(frame.data, [0x10, 20, 0, 3, 0xFF, 0xFF, 0xFF, 0xFF]);
}

#[test]
/// Standard-identifier and remote frames never carry transport traffic.
fn test_from_embedded_rejects_standard_and_remote() {
    let standard = embedded_can::StandardId::new(0x123).expect("standard id fits 11 bits");
    let frame: HalFrame =
        embedded_can::Frame::new(standard, &[1, 2, 3]).expect("frame builds");
    assert!(CanFrame::from_embedded(&frame).is_none());

    let extended: embedded_can::ExtendedId = CanId::transport(0x00EB00, 7, 0x2A, 0x80).into();
    let remote: HalFrame =
        embedded_can::Frame::new_remote(extended, 8).expect("remote frame builds");
    assert!(CanFrame::from_embedded(&remote).is_none());
}
