//! In-memory representation of an SAE J1939 / ISO 11783 CAN frame, plus
//! the little 29-bit identifier handling the transport protocol needs:
//! infallible assembly of TP.CM / TP.DT identifiers on the way out and
//! field extraction on the way in.

//==================================================================================CAN_ID

/// Extended CAN identifier (29 bits) stored inside a `u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanId(pub u32);

impl CanId {
    /// Assemble the identifier of an outbound transport protocol frame.
    ///
    /// Both transport PGNs (`0x00EC00` and `0x00EB00`) are PDU1 groups
    /// with an all-zero PS byte, so the destination address drops straight
    /// into the PS field and assembly cannot fail. Pass `0xFF` as the
    /// destination to address every node on the bus.
    pub fn transport(pgn: u32, priority: u8, source_address: u8, destination: u8) -> Self {
        debug_assert!((pgn & 0xFF) == 0, "a PDU1 PGN keeps its PS byte zero");
        debug_assert!(((pgn >> 8) & 0xFF) < 240, "a destination needs a PDU1 PGN");
        // One shift moves PF, DP, and EDP from PGN positions to identifier
        // positions; destination and source fill the low bytes.
        Self(
            (u32::from(priority & 0x07) << 26)
                | ((pgn & 0x0003_FF00) << 8)
                | (u32::from(destination) << 8)
                | u32::from(source_address),
        )
    }

    /// Priority bits (0 = highest, 7 = lowest).
    pub fn priority(&self) -> u8 {
        (self.0 >> 26) as u8 & 0x07
    }

    /// Address of the emitting node.
    pub fn source_address(&self) -> u8 {
        self.0 as u8
    }

    /// PDU format byte; values below 240 make the PS byte a destination.
    fn pdu_format(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// PDU specific byte: destination address (PDU1) or group extension
    /// (PDU2).
    fn pdu_specific(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The PGN carried by this identifier. For PDU2 formats the group
    /// extension is part of the number; for PDU1 it is masked out because
    /// the PS byte holds the destination instead.
    pub fn pgn(&self) -> u32 {
        let upper = (self.0 >> 8) & 0x0003_FF00; // EDP, DP, PF
        if self.pdu_format() < 240 {
            upper
        } else {
            upper | u32::from(self.pdu_specific())
        }
    }

    /// Destination address, present only for PDU1 formats.
    pub fn destination(&self) -> Option<u8> {
        (self.pdu_format() < 240).then(|| self.pdu_specific())
    }
}

impl From<CanId> for embedded_can::ExtendedId {
    fn from(id: CanId) -> Self {
        embedded_can::ExtendedId::new(id.0 & embedded_can::ExtendedId::MAX.as_raw())
            .expect("masked identifier always fits 29 bits")
    }
}

impl From<embedded_can::ExtendedId> for CanId {
    fn from(id: embedded_can::ExtendedId) -> Self {
        CanId(id.as_raw())
    }
}

//==================================================================================CAN_FRAME

#[derive(Clone, Debug, PartialEq, Eq)]
/// Raw classic CAN frame as read from or written to the bus.
pub struct CanFrame {
    /// Full 29-bit CAN identifier stored inside a `u32`.
    pub id: CanId,
    /// Payload buffer. Classic CAN frames always provide eight bytes.
    pub data: [u8; 8],
    /// Number of valid payload bytes (Data Length Code, 0 to 8).
    pub len: usize,
}

impl CanFrame {
    /// Borrow a frame from an [`embedded_can::Frame`] implementation.
    ///
    /// Returns `None` for standard-identifier or remote frames, which never
    /// carry ISO 11783 traffic.
    pub fn from_embedded<F: embedded_can::Frame>(frame: &F) -> Option<Self> {
        if frame.is_remote_frame() {
            return None;
        }
        let embedded_can::Id::Extended(id) = frame.id() else {
            return None;
        };
        let mut data = [0xFF; 8];
        let len = frame.dlc().min(8);
        data[..len].copy_from_slice(&frame.data()[..len]);
        Some(Self {
            id: CanId(id.as_raw()),
            data,
            len,
        })
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
