//! Session bookkeeping for in-flight transport protocol transfers.
//!
//! A session is the engine's record of one message moving in one direction
//! between one pair of nodes. Peers are held as weak references so an
//! offline node is observed as handle expiry instead of being kept alive
//! by the transfer.
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;

use super::payload::TransportData;
use super::TransmitCompleteCallback;
use crate::protocol::node::{ControlFunction, GLOBAL_ADDRESS};
use crate::protocol::transport::PROTOCOL_BYTES_PER_FRAME;

//==================================================================================Enums and Structs

/// Whether the local node is the sender or the receiver of the transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SessionDirection {
    Transmit,
    Receive,
}

/// The states a transport protocol session can be in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StateMachineState {
    /// Session is not in progress. Only ever observed transiently.
    None,
    /// We owe the peer a Clear To Send frame.
    ClearToSend,
    /// Receiving data frames.
    RxDataSession,
    /// We owe the peer a Request To Send frame.
    RequestToSend,
    /// Waiting for the peer to clear a window of packets.
    WaitForClearToSend,
    /// We owe the bus a Broadcast Announce Message.
    BroadcastAnnounce,
    /// Sending data frames.
    TxDataSession,
    /// All data sent; waiting for the End of Message Acknowledgement.
    WaitForEndOfMessageAcknowledge,
}

/// Internal record tracking one in-progress transfer.
pub(crate) struct TransportSession<'a> {
    pub(crate) direction: SessionDirection,
    pub(crate) state: StateMachineState,
    /// PGN of the encapsulated message (not of the transport frames).
    pub(crate) pgn: u32,
    pub(crate) source: Weak<ControlFunction>,
    /// Source address captured at creation; lets an abort still be
    /// addressed after the handle expired.
    pub(crate) source_address: u8,
    /// `None` marks the global destination (broadcast transfer).
    pub(crate) destination: Option<Weak<ControlFunction>>,
    pub(crate) destination_address: u8,
    pub(crate) data: TransportData<'a>,
    /// Absolute deadline of the current timer: abort timers in the waiting
    /// states, the inter-frame gap while a broadcast transmit is running.
    pub(crate) deadline_ms: u64,
    /// Last sequence number processed (rx) or emitted (tx) this transfer.
    pub(crate) last_sequence: u8,
    /// Derived packet total, `ceil(len / 7)`.
    pub(crate) total_packets: u8,
    pub(crate) processed_packets: u8,
    /// Packets the peer cleared us to send before the next CTS (tx), or the
    /// per-CTS maximum the peer declared in its RTS (rx).
    pub(crate) cts_window: u8,
    pub(crate) on_complete: Option<TransmitCompleteCallback<'a>>,
}

impl<'a> TransportSession<'a> {
    /// Create a transmit session; the state machine starts at the RTS or
    /// BAM announcement depending on the destination.
    pub(crate) fn new_transmit(
        pgn: u32,
        data: TransportData<'a>,
        source: &Rc<ControlFunction>,
        destination: Option<&Rc<ControlFunction>>,
        on_complete: Option<TransmitCompleteCallback<'a>>,
    ) -> Self {
        let state = match destination {
            Some(_) => StateMachineState::RequestToSend,
            None => StateMachineState::BroadcastAnnounce,
        };
        let total_packets = packets_for(data.len());
        Self {
            direction: SessionDirection::Transmit,
            state,
            pgn,
            source: Rc::downgrade(source),
            source_address: source.address(),
            destination: destination.map(Rc::downgrade),
            destination_address: destination.map_or(GLOBAL_ADDRESS, |cf| cf.address()),
            data,
            deadline_ms: 0,
            last_sequence: 0,
            total_packets,
            processed_packets: 0,
            cts_window: 0,
            on_complete,
        }
    }

    /// Create a receive session with an owned reassembly buffer of the
    /// declared length.
    pub(crate) fn new_receive(
        pgn: u32,
        length: usize,
        source: &Rc<ControlFunction>,
        destination: Option<&Rc<ControlFunction>>,
    ) -> Self {
        Self {
            direction: SessionDirection::Receive,
            state: StateMachineState::None,
            pgn,
            source: Rc::downgrade(source),
            source_address: source.address(),
            destination: destination.map(Rc::downgrade),
            destination_address: destination.map_or(GLOBAL_ADDRESS, |cf| cf.address()),
            data: TransportData::zeroed(length),
            deadline_ms: 0,
            last_sequence: 0,
            total_packets: packets_for(length),
            processed_packets: 0,
            cts_window: 0,
            on_complete: None,
        }
    }

    /// Whether the transfer is addressed to every node on the bus.
    pub(crate) fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    /// Declared total length of the transported message.
    pub(crate) fn message_len(&self) -> usize {
        self.data.len()
    }

    /// Whether this session is the one keyed by `(source, destination)`.
    /// Expired handles match nothing; the liveness sweep reaps them.
    pub(crate) fn matches(
        &self,
        source: &Rc<ControlFunction>,
        destination: Option<&Rc<ControlFunction>>,
    ) -> bool {
        let Some(own_source) = self.source.upgrade() else {
            return false;
        };
        if !Rc::ptr_eq(&own_source, source) {
            return false;
        }
        match (&self.destination, destination) {
            (None, None) => true,
            (Some(own), Some(other)) => own
                .upgrade()
                .is_some_and(|own| Rc::ptr_eq(&own, other)),
            _ => false,
        }
    }

    /// Whether both ends of the transfer are still reachable. A broadcast
    /// transfer only needs its source.
    pub(crate) fn can_continue(&self) -> bool {
        if self.source.upgrade().is_none() {
            return false;
        }
        match &self.destination {
            None => true,
            Some(destination) => destination.upgrade().is_some(),
        }
    }

    /// Current address of the source node, falling back to the captured one.
    pub(crate) fn current_source_address(&self) -> u8 {
        self.source
            .upgrade()
            .map_or(self.source_address, |cf| cf.address())
    }

    /// Current address of the destination node (global for broadcasts),
    /// falling back to the captured one.
    pub(crate) fn current_destination_address(&self) -> u8 {
        match &self.destination {
            None => GLOBAL_ADDRESS,
            Some(destination) => destination
                .upgrade()
                .map_or(self.destination_address, |cf| cf.address()),
        }
    }

    /// Whether the current timer deadline has passed.
    pub(crate) fn timer_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    /// Whether every byte of the message has been moved.
    pub(crate) fn all_packets_done(&self) -> bool {
        self.last_sequence as usize * PROTOCOL_BYTES_PER_FRAME >= self.message_len()
    }
}

/// Number of data frames needed for a message of `length` bytes.
pub(crate) fn packets_for(length: usize) -> u8 {
    length.div_ceil(PROTOCOL_BYTES_PER_FRAME) as u8
}

//==================================================================================SESSION_TABLE

/// Insertion-ordered set of active sessions, keyed by the
/// (source, destination) handle pair.
pub(crate) struct SessionTable<'a> {
    sessions: Vec<TransportSession<'a>>,
}

impl<'a> SessionTable<'a> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn is_full(&self, max_sessions: usize) -> bool {
        self.sessions.len() >= max_sessions
    }

    /// Index of the session keyed by `(source, destination)`, if any.
    pub(crate) fn index_of(
        &self,
        source: &Rc<ControlFunction>,
        destination: Option<&Rc<ControlFunction>>,
    ) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.matches(source, destination))
    }

    pub(crate) fn push(&mut self, session: TransportSession<'a>) {
        self.sessions.push(session);
    }

    /// Remove and return the session at `index`, preserving the update
    /// order of the remaining sessions.
    pub(crate) fn remove(&mut self, index: usize) -> TransportSession<'a> {
        self.sessions.remove(index)
    }

    pub(crate) fn get(&self, index: usize) -> &TransportSession<'a> {
        &self.sessions[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut TransportSession<'a> {
        &mut self.sessions[index]
    }
}
