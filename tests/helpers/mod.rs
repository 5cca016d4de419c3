//! Test doubles to simulate the CAN bus, clock, and node registry during
//! integration tests.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use isobus_tp::protocol::node::{ControlFunction, ControlFunctionRegistry};
use isobus_tp::protocol::transport::can_frame::{CanFrame, CanId};
use isobus_tp::protocol::transport::tp::{
    TransportProtocolManager, BROADCAST_ANNOUNCE_MULTIPLEXOR, CLEAR_TO_SEND_MULTIPLEXOR,
    CONNECTION_ABORT_MULTIPLEXOR, END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR,
    REQUEST_TO_SEND_MULTIPLEXOR,
};
use isobus_tp::protocol::transport::traits::can_transmitter::CanTransmitter;
use isobus_tp::protocol::transport::traits::transport_clock::TransportClock;
use isobus_tp::protocol::transport::{
    TRANSPORT_CONNECTION_MANAGEMENT_PGN, TRANSPORT_DATA_TRANSFER_PGN, TRANSPORT_PRIORITY,
};

/// Engine wired to the shared test doubles.
pub type TestEngine<'a> = TransportProtocolManager<'a, RecordingBus, ManualClock, FixedRegistry>;

#[derive(Clone, Default)]
#[allow(dead_code)]
/// In-memory CAN transmit queue recording every accepted frame. Cloned
/// handles share the same queue, so the test keeps one while the engine
/// owns the other.
pub struct RecordingBus {
    frames: Rc<RefCell<Vec<CanFrame>>>,
    reject: Rc<Cell<bool>>,
}

#[allow(dead_code)]
impl RecordingBus {
    /// Drain and return every frame recorded so far.
    pub fn take(&self) -> Vec<CanFrame> {
        self.frames.borrow_mut().split_off(0)
    }

    /// Simulate a saturated transmit queue.
    pub fn set_reject(&self, reject: bool) {
        self.reject.set(reject);
    }
}

impl CanTransmitter for RecordingBus {
    fn transmit(&mut self, frame: &CanFrame) -> bool {
        if self.reject.get() {
            return false;
        }
        self.frames.borrow_mut().push(frame.clone());
        true
    }
}

#[derive(Clone, Default)]
#[allow(dead_code)]
/// Manually advanced monotonic clock shared between engine and test.
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

#[allow(dead_code)]
impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }
}

impl TransportClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Clone, Default)]
#[allow(dead_code)]
/// Registry holding the nodes known to the test. Removing a node and
/// dropping the caller's clone expires every weak handle the engine took.
pub struct FixedRegistry {
    nodes: Rc<RefCell<Vec<Rc<ControlFunction>>>>,
}

#[allow(dead_code)]
impl FixedRegistry {
    /// Register a node claiming `address` and return the owning handle.
    pub fn add(&self, address: u8) -> Rc<ControlFunction> {
        let node = Rc::new(ControlFunction::new(address));
        self.nodes.borrow_mut().push(node.clone());
        node
    }

    /// Take a node offline.
    pub fn remove(&self, node: &Rc<ControlFunction>) {
        self.nodes.borrow_mut().retain(|n| !Rc::ptr_eq(n, node));
    }
}

impl ControlFunctionRegistry for FixedRegistry {
    fn control_function_by_address(&self, address: u8) -> Option<Rc<ControlFunction>> {
        self.nodes
            .borrow()
            .iter()
            .find(|node| node.address() == address)
            .cloned()
    }
}

//==================================================================================Frame builders

#[allow(dead_code)]
pub fn cm_frame(source: u8, destination: u8, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id: CanId::transport(TRANSPORT_CONNECTION_MANAGEMENT_PGN, TRANSPORT_PRIORITY, source, destination),
        data,
        len: 8,
    }
}

#[allow(dead_code)]
pub fn dt_frame(source: u8, destination: u8, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id: CanId::transport(TRANSPORT_DATA_TRANSFER_PGN, TRANSPORT_PRIORITY, source, destination),
        data,
        len: 8,
    }
}

#[allow(dead_code)]
pub fn rts_frame(
    source: u8,
    destination: u8,
    pgn: u32,
    length: u16,
    total: u8,
    max_per_cts: u8,
) -> CanFrame {
    let pgn = pgn.to_le_bytes();
    cm_frame(
        source,
        destination,
        [
            REQUEST_TO_SEND_MULTIPLEXOR,
            (length & 0xFF) as u8,
            (length >> 8) as u8,
            total,
            max_per_cts,
            pgn[0],
            pgn[1],
            pgn[2],
        ],
    )
}

#[allow(dead_code)]
pub fn cts_frame(source: u8, destination: u8, pgn: u32, count: u8, next: u8) -> CanFrame {
    let pgn = pgn.to_le_bytes();
    cm_frame(
        source,
        destination,
        [
            CLEAR_TO_SEND_MULTIPLEXOR,
            count,
            next,
            0xFF,
            0xFF,
            pgn[0],
            pgn[1],
            pgn[2],
        ],
    )
}

#[allow(dead_code)]
pub fn bam_frame(source: u8, pgn: u32, length: u16, total: u8) -> CanFrame {
    let pgn = pgn.to_le_bytes();
    cm_frame(
        source,
        0xFF,
        [
            BROADCAST_ANNOUNCE_MULTIPLEXOR,
            (length & 0xFF) as u8,
            (length >> 8) as u8,
            total,
            0xFF,
            pgn[0],
            pgn[1],
            pgn[2],
        ],
    )
}

#[allow(dead_code)]
pub fn eom_ack_frame(source: u8, destination: u8, pgn: u32, length: u16, total: u8) -> CanFrame {
    let pgn = pgn.to_le_bytes();
    cm_frame(
        source,
        destination,
        [
            END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR,
            (length & 0xFF) as u8,
            (length >> 8) as u8,
            total,
            0xFF,
            pgn[0],
            pgn[1],
            pgn[2],
        ],
    )
}

#[allow(dead_code)]
pub fn abort_frame(source: u8, destination: u8, pgn: u32, reason: u8) -> CanFrame {
    let pgn = pgn.to_le_bytes();
    cm_frame(
        source,
        destination,
        [
            CONNECTION_ABORT_MULTIPLEXOR,
            reason,
            0xFF,
            0xFF,
            0xFF,
            pgn[0],
            pgn[1],
            pgn[2],
        ],
    )
}

//==================================================================================Drive helpers

#[allow(dead_code)]
/// Run `ticks` updates, advancing the clock by `step_ms` between them.
pub fn run(engine: &mut TestEngine<'_>, clock: &ManualClock, ticks: u32, step_ms: u64) {
    for _ in 0..ticks {
        engine.update();
        clock.advance(step_ms);
    }
}

#[allow(dead_code)]
/// Sequential test payload `[0, 1, 2, ...]` of `len` bytes.
pub fn payload_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}
