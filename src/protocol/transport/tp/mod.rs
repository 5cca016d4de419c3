//! ISO 11783 / SAE J1939 transport protocol session engine. Handles both
//! the broadcast variant (BAM) and the connection-mode variant (RTS/CTS)
//! for application messages of 9 to 1785 bytes.
//!
//! The engine is single-threaded and cooperative: inbound frames are fed
//! through [`TransportProtocolManager::process_frame`] and the state
//! machines are advanced by calling
//! [`TransportProtocolManager::update`] periodically (at least every
//! 50 ms for timely timeout behaviour). Outbound frames go through the
//! non-blocking [`CanTransmitter`] seam; a refused frame is retried on a
//! later update without disturbing session state.
use alloc::boxed::Box;
use alloc::rc::Rc;

use crate::error::TransmitStartError;
use crate::protocol::node::{ControlFunction, ControlFunctionRegistry, GLOBAL_ADDRESS, NULL_ADDRESS};
use crate::protocol::transport::can_frame::{CanFrame, CanId};
use crate::protocol::transport::traits::can_transmitter::CanTransmitter;
use crate::protocol::transport::traits::transport_clock::TransportClock;
use crate::protocol::transport::{
    MAX_PROTOCOL_DATA_LENGTH, MIN_PROTOCOL_DATA_LENGTH, PROTOCOL_BYTES_PER_FRAME, T1_TIMEOUT_MS,
    T2_T3_TIMEOUT_MS, TRANSPORT_CONNECTION_MANAGEMENT_PGN, TRANSPORT_DATA_TRANSFER_PGN,
    TRANSPORT_PRIORITY, TR_TIMEOUT_MS,
};

pub mod payload;
mod session;

pub use payload::{ChunkCallback, ChunkSource, TransportData};
use session::{SessionDirection, SessionTable, StateMachineState, TransportSession};

//==================================================================================Constants

/// TP.CM_RTS multiplexor.
pub const REQUEST_TO_SEND_MULTIPLEXOR: u8 = 0x10;
/// TP.CM_CTS multiplexor.
pub const CLEAR_TO_SEND_MULTIPLEXOR: u8 = 0x11;
/// TP.CM_EOM_ACK multiplexor.
pub const END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR: u8 = 0x13;
/// TP.BAM multiplexor.
pub const BROADCAST_ANNOUNCE_MULTIPLEXOR: u8 = 0x20;
/// TP.Conn_Abort multiplexor.
pub const CONNECTION_ABORT_MULTIPLEXOR: u8 = 0xFF;

//==================================================================================Abort Reasons

/// The abort reasons defined by ISO 11783-3.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionAbortReason {
    /// Node is already in a connection-mode session and cannot support another.
    AlreadyInCmSession = 1,
    /// Session must be aborted because the system needs resources.
    SystemResourcesNeeded = 2,
    /// General timeout.
    Timeout = 3,
    /// A CTS arrived while a transfer was already in progress.
    ClearToSendReceivedWhileTransferInProgress = 4,
    /// Maximum retransmit request limit reached.
    MaximumRetransmitRequestLimitReached = 5,
    /// A data frame arrived outside a receive data session.
    UnexpectedDataTransferPacketReceived = 6,
    /// Unrecoverable incorrect sequence number.
    BadSequenceNumber = 7,
    /// A sequence number was repeated.
    DuplicateSequenceNumber = 8,
    /// Message larger than the 1785-byte protocol limit.
    TotalMessageSizeTooBig = 9,
    /// Any error not covered by the enumerated reasons.
    AnyOtherError = 250,
}

impl ConnectionAbortReason {
    /// Decode a received reason byte. Reserved and unknown values are
    /// tolerated and mapped to [`ConnectionAbortReason::AnyOtherError`].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::AlreadyInCmSession,
            2 => Self::SystemResourcesNeeded,
            3 => Self::Timeout,
            4 => Self::ClearToSendReceivedWhileTransferInProgress,
            5 => Self::MaximumRetransmitRequestLimitReached,
            6 => Self::UnexpectedDataTransferPacketReceived,
            7 => Self::BadSequenceNumber,
            8 => Self::DuplicateSequenceNumber,
            9 => Self::TotalMessageSizeTooBig,
            _ => Self::AnyOtherError,
        }
    }

    /// The wire encoding of the reason.
    pub fn raw(self) -> u8 {
        self as u8
    }
}

//==================================================================================Callbacks

/// Outcome of one submitted transmission, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitReport {
    /// PGN of the transported message.
    pub pgn: u32,
    /// Declared message length in bytes.
    pub length: usize,
    /// Address the message was sent from.
    pub source_address: u8,
    /// Address the message was sent to (`0xFF` for broadcasts).
    pub destination_address: u8,
    /// Whether the whole message was delivered (broadcast) or acknowledged
    /// (connection mode).
    pub successful: bool,
}

/// Per-session completion callback, invoked when the session terminates.
pub type TransmitCompleteCallback<'a> = Box<dyn FnOnce(TransmitReport) + 'a>;

/// A fully reassembled inbound message, handed upward before its session
/// is torn down.
pub struct ReceivedMessage<'m> {
    /// PGN of the transported message.
    pub pgn: u32,
    /// The node that sent the message.
    pub source: Rc<ControlFunction>,
    /// The addressed node, or `None` for a broadcast.
    pub destination: Option<Rc<ControlFunction>>,
    /// The reassembled payload.
    pub data: &'m [u8],
}

/// Upward delivery callback for reassembled messages.
pub type MessageReceivedCallback<'a> = Box<dyn FnMut(ReceivedMessage<'_>) + 'a>;

//==================================================================================Configuration

/// Tunables of the transport protocol engine.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Cap on concurrent sessions, receive and transmit combined.
    pub max_sessions: usize,
    /// Minimum gap between broadcast data frames on the transmit side (ms).
    pub bam_frame_gap_ms: u64,
    /// Cap on outbound data frames per session per update, so one cleared
    /// window cannot monopolize the bus.
    pub frames_per_update: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            bam_frame_gap_ms: 50,
            frames_per_update: 4,
        }
    }
}

//==================================================================================Engine

/// The transport protocol state machines and frame dispatcher.
pub struct TransportProtocolManager<'a, B, C, R>
where
    B: CanTransmitter,
    C: TransportClock,
    R: ControlFunctionRegistry,
{
    bus: B,
    clock: C,
    registry: R,
    config: TransportConfig,
    sessions: SessionTable<'a>,
    message_callback: Option<MessageReceivedCallback<'a>>,
}

impl<'a, B, C, R> TransportProtocolManager<'a, B, C, R>
where
    B: CanTransmitter,
    C: TransportClock,
    R: ControlFunctionRegistry,
{
    /// Create an engine over the given bus, clock, and node registry.
    pub fn new(bus: B, clock: C, registry: R, config: TransportConfig) -> Self {
        Self {
            bus,
            clock,
            registry,
            config,
            sessions: SessionTable::new(),
            message_callback: None,
        }
    }

    /// Install the upward delivery callback for reassembled messages.
    pub fn set_message_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ReceivedMessage<'_>) + 'a,
    {
        self.message_callback = Some(Box::new(callback));
    }

    /// Number of sessions currently running, receive and transmit combined.
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    //==================================================================================Submission

    /// Accept a message for multi-frame transmission.
    ///
    /// `destination` of `None` requests a broadcast (BAM) transfer. The
    /// created session starts announcing on the next [`Self::update`].
    /// `on_complete` is invoked exactly once when the session terminates,
    /// successfully or not.
    pub fn transmit_message(
        &mut self,
        pgn: u32,
        data: TransportData<'a>,
        source: &Rc<ControlFunction>,
        destination: Option<&Rc<ControlFunction>>,
        on_complete: Option<TransmitCompleteCallback<'a>>,
    ) -> Result<(), TransmitStartError> {
        let length = data.len();
        if !(MIN_PROTOCOL_DATA_LENGTH..=MAX_PROTOCOL_DATA_LENGTH).contains(&length) {
            return Err(TransmitStartError::InvalidLength { len: length });
        }
        if !source.has_valid_address() {
            return Err(TransmitStartError::InvalidSource);
        }
        if self.sessions.index_of(source, destination).is_some() {
            return Err(TransmitStartError::SessionAlreadyActive);
        }
        if self.sessions.is_full(self.config.max_sessions) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: refusing tx for {:#x}, configured maximum number of sessions reached",
                pgn
            );
            return Err(TransmitStartError::SessionTableFull);
        }

        let mut session = TransportSession::new_transmit(pgn, data, source, destination, on_complete);
        session.deadline_ms = self.clock.now_ms();
        self.sessions.push(session);

        #[cfg(feature = "defmt")]
        defmt::debug!("TP: new tx session for {:#x}", pgn);
        Ok(())
    }

    //==================================================================================Inbound Dispatch

    /// Route one inbound frame to the transport protocol by its PGN.
    /// Frames on other PGNs are ignored.
    pub fn process_frame(&mut self, frame: &CanFrame) {
        match frame.id.pgn() {
            TRANSPORT_CONNECTION_MANAGEMENT_PGN => self.process_connection_management_frame(frame),
            TRANSPORT_DATA_TRANSFER_PGN => self.process_data_transfer_frame(frame),
            _ => {}
        }
    }

    /// Handle one inbound TP.CM frame: demultiplex and apply the session
    /// rules for the carried control message.
    pub fn process_connection_management_frame(&mut self, frame: &CanFrame) {
        if frame.len != 8 {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: received a connection management frame of invalid length {}",
                frame.len
            );
            return;
        }
        let Some(source) = self.resolve_node(frame.id.source_address()) else {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: dropping connection management frame from unknown source {}",
                frame.id.source_address()
            );
            return;
        };
        let destination_address = frame.id.destination().unwrap_or(GLOBAL_ADDRESS);
        let global = destination_address == GLOBAL_ADDRESS;
        let pgn = embedded_pgn(&frame.data);

        match frame.data[0] {
            BROADCAST_ANNOUNCE_MULTIPLEXOR => {
                if global {
                    self.process_broadcast_announce(source, pgn, embedded_length(&frame.data));
                } else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: received a BAM with a non-global destination, ignoring");
                }
            }
            REQUEST_TO_SEND_MULTIPLEXOR => {
                if global {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: received an RTS with a global destination, ignoring");
                    return;
                }
                let Some(destination) = self.resolve_node(destination_address) else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: dropping RTS for unknown destination {}", destination_address);
                    return;
                };
                self.process_request_to_send(
                    source,
                    destination,
                    pgn,
                    embedded_length(&frame.data),
                    frame.data[4],
                );
            }
            CLEAR_TO_SEND_MULTIPLEXOR => {
                if global {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: received a CTS with a global destination, ignoring");
                    return;
                }
                let Some(destination) = self.resolve_node(destination_address) else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: dropping CTS for unknown destination {}", destination_address);
                    return;
                };
                self.process_clear_to_send(source, destination, pgn, frame.data[1], frame.data[2]);
            }
            END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR => {
                if global {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: received an EOM ACK with a global destination, ignoring");
                    return;
                }
                let Some(destination) = self.resolve_node(destination_address) else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "TP: dropping EOM ACK for unknown destination {}",
                        destination_address
                    );
                    return;
                };
                self.process_end_of_message_acknowledge(source, destination, pgn);
            }
            CONNECTION_ABORT_MULTIPLEXOR => {
                if global {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP: received an abort with a global destination, ignoring");
                    return;
                }
                let Some(destination) = self.resolve_node(destination_address) else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "TP: dropping abort for unknown destination {}",
                        destination_address
                    );
                    return;
                };
                self.process_abort(
                    source,
                    destination,
                    pgn,
                    ConnectionAbortReason::from_raw(frame.data[1]),
                );
            }
            _mux => {
                #[cfg(feature = "defmt")]
                defmt::warn!("TP: bad multiplexor {} in connection management frame", _mux);
            }
        }
    }

    /// Handle one inbound TP.DT frame: sequence-check it and copy its seven
    /// payload bytes into the matching receive session.
    pub fn process_data_transfer_frame(&mut self, frame: &CanFrame) {
        if frame.len != 8 {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: received a data transfer frame of invalid length {}",
                frame.len
            );
            return;
        }
        let Some(source) = self.resolve_node(frame.id.source_address()) else {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: dropping data transfer frame from unknown source {}",
                frame.id.source_address()
            );
            return;
        };
        let destination_address = frame.id.destination().unwrap_or(GLOBAL_ADDRESS);
        let destination = if destination_address == GLOBAL_ADDRESS {
            None
        } else {
            match self.resolve_node(destination_address) {
                Some(destination) => Some(destination),
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "TP: dropping data transfer frame for unknown destination {}",
                        destination_address
                    );
                    return;
                }
            }
        };

        let Some(index) = self.sessions.index_of(&source, destination.as_ref()) else {
            if destination.is_some() {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "TP: received a data transfer frame from {} with no matching session, ignoring",
                    frame.id.source_address()
                );
            }
            return;
        };

        let now = self.clock.now_ms();
        let session = self.sessions.get_mut(index);

        if session.state != StateMachineState::RxDataSession {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: received a data transfer frame from {} while not expecting one, sending abort",
                frame.id.source_address()
            );
            self.abort_session(index, ConnectionAbortReason::UnexpectedDataTransferPacketReceived);
            return;
        }

        let sequence = frame.data[0];
        if sequence == session.last_sequence {
            #[cfg(feature = "defmt")]
            defmt::error!(
                "TP: aborting rx session for {:#x} due to duplicate sequence number",
                session.pgn
            );
            self.abort_session(index, ConnectionAbortReason::DuplicateSequenceNumber);
            return;
        }
        if sequence != session.last_sequence.wrapping_add(1) {
            #[cfg(feature = "defmt")]
            defmt::error!(
                "TP: aborting rx session for {:#x} due to bad sequence number",
                session.pgn
            );
            self.abort_session(index, ConnectionAbortReason::BadSequenceNumber);
            return;
        }

        // Correct sequence number: copy the data, truncating at the
        // declared message length.
        let length = session.message_len();
        let base = session.last_sequence as usize * PROTOCOL_BYTES_PER_FRAME;
        for offset in 0..PROTOCOL_BYTES_PER_FRAME {
            let position = base + offset;
            if position < length {
                session.data.set_byte(position, frame.data[1 + offset]);
            }
        }
        session.last_sequence = session.last_sequence.wrapping_add(1);
        session.processed_packets = session.processed_packets.wrapping_add(1);
        session.deadline_ms = now
            + if session.is_broadcast() {
                T1_TIMEOUT_MS
            } else {
                TR_TIMEOUT_MS
            };

        if session.all_packets_done() {
            if !session.is_broadcast() {
                // Acknowledge sessions with a specific destination only.
                if let Some(acknowledge) = Self::end_of_message_frame(session) {
                    let _ = self.bus.transmit(&acknowledge);
                }
            }
            if let Some(callback) = self.message_callback.as_mut() {
                let session = self.sessions.get(index);
                callback(ReceivedMessage {
                    pgn: session.pgn,
                    source: source.clone(),
                    destination: destination.clone(),
                    data: session.data.as_slice(),
                });
            }
            self.close_session(index, true);
        } else if !session_window_open(self.sessions.get(index)) {
            // The cleared block is exhausted; owe the peer the next CTS.
            let session = self.sessions.get_mut(index);
            session.state = StateMachineState::ClearToSend;
            session.deadline_ms = now;
        }
    }

    //==================================================================================Connection Management Handlers

    pub(crate) fn process_broadcast_announce(
        &mut self,
        source: Rc<ControlFunction>,
        pgn: u32,
        total_size: usize,
    ) {
        // The standard forbids replying to broadcast announcements, so every
        // refusal here is silent on the wire.
        if self.sessions.is_full(self.config.max_sessions) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: ignoring BAM for {:#x}, configured maximum number of sessions reached",
                pgn
            );
            return;
        }
        if !(MIN_PROTOCOL_DATA_LENGTH..=MAX_PROTOCOL_DATA_LENGTH).contains(&total_size) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: ignoring BAM for {:#x} with out-of-range message size {}",
                pgn,
                total_size
            );
            return;
        }
        if let Some(index) = self.sessions.index_of(&source, None) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: received a BAM while a session already existed for this source, overwriting for {:#x}",
                pgn
            );
            self.close_session(index, false);
        }

        let mut session = TransportSession::new_receive(pgn, total_size, &source, None);
        session.state = StateMachineState::RxDataSession;
        session.deadline_ms = self.clock.now_ms() + T1_TIMEOUT_MS;
        self.sessions.push(session);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "TP: new rx broadcast message session for {:#x}, source: {}",
            pgn,
            source.address()
        );
    }

    pub(crate) fn process_request_to_send(
        &mut self,
        source: Rc<ControlFunction>,
        destination: Rc<ControlFunction>,
        pgn: u32,
        total_size: usize,
        clear_to_send_packet_max: u8,
    ) {
        if self.sessions.is_full(self.config.max_sessions) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: replying with abort to RTS for {:#x}, configured maximum number of sessions reached",
                pgn
            );
            self.send_abort(
                destination.address(),
                source.address(),
                pgn,
                ConnectionAbortReason::AlreadyInCmSession,
            );
            return;
        }
        if total_size > MAX_PROTOCOL_DATA_LENGTH {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: replying with abort to RTS for {:#x}, message of {} bytes is too large",
                pgn,
                total_size
            );
            self.send_abort(
                destination.address(),
                source.address(),
                pgn,
                ConnectionAbortReason::TotalMessageSizeTooBig,
            );
            return;
        }
        if total_size < MIN_PROTOCOL_DATA_LENGTH {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: replying with abort to RTS for {:#x}, message of {} bytes is too small",
                pgn,
                total_size
            );
            self.send_abort(
                destination.address(),
                source.address(),
                pgn,
                ConnectionAbortReason::AnyOtherError,
            );
            return;
        }

        if let Some(index) = self.sessions.index_of(&source, Some(&destination)) {
            if self.sessions.get(index).pgn != pgn {
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "TP: received an RTS while a session already existed for this source and destination, aborting for {:#x}",
                    pgn
                );
                self.abort_session(index, ConnectionAbortReason::AlreadyInCmSession);
            } else {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "TP: received an RTS while a session already existed for this source, destination and PGN, overwriting for {:#x}",
                    pgn
                );
                self.close_session(index, false);
            }
        }

        let mut session = TransportSession::new_receive(pgn, total_size, &source, Some(&destination));
        session.cts_window = clear_to_send_packet_max;
        session.state = StateMachineState::ClearToSend;
        session.deadline_ms = self.clock.now_ms();
        self.sessions.push(session);

        #[cfg(feature = "defmt")]
        defmt::debug!("TP: new rx session for {:#x}, source: {}", pgn, source.address());
    }

    pub(crate) fn process_clear_to_send(
        &mut self,
        source: Rc<ControlFunction>,
        destination: Rc<ControlFunction>,
        pgn: u32,
        packets_to_be_sent: u8,
        next_packet_number: u8,
    ) {
        // A CTS travels from the receiver back to the transmitter, so the
        // matching tx session is keyed the other way around.
        match self.sessions.index_of(&destination, Some(&source)) {
            Some(index) => {
                let session = self.sessions.get(index);
                if session.pgn != pgn {
                    #[cfg(feature = "defmt")]
                    defmt::error!(
                        "TP: received a CTS for {:#x} while a session already existed for this source and destination, sending abort for both",
                        pgn
                    );
                    let sender = destination.address();
                    let receiver = source.address();
                    self.abort_session(index, ConnectionAbortReason::AnyOtherError);
                    self.send_abort(sender, receiver, pgn, ConnectionAbortReason::AnyOtherError);
                } else if next_packet_number != session.last_sequence.wrapping_add(1) {
                    #[cfg(feature = "defmt")]
                    defmt::error!(
                        "TP: received a CTS for {:#x} with a bad sequence number, aborting",
                        pgn
                    );
                    self.abort_session(index, ConnectionAbortReason::BadSequenceNumber);
                } else if session.state != StateMachineState::WaitForClearToSend {
                    // The session exists but is in no state to take a CTS.
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "TP: received a CTS for {:#x} but not expecting one, aborting session",
                        pgn
                    );
                    self.abort_session(
                        index,
                        ConnectionAbortReason::ClearToSendReceivedWhileTransferInProgress,
                    );
                } else {
                    let now = self.clock.now_ms();
                    let session = self.sessions.get_mut(index);
                    session.cts_window = packets_to_be_sent;
                    session.deadline_ms = now + T2_T3_TIMEOUT_MS;
                    // Zero cleared packets means the peer wants us to wait;
                    // hold this state until a non-zero window arrives.
                    if packets_to_be_sent != 0 {
                        session.state = StateMachineState::TxDataSession;
                        session.deadline_ms = now;
                    }
                }
            }
            None => {
                // Aborting clears the situation up faster than letting the
                // peer run into its own timeout.
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "TP: received a CTS for {:#x} while no session existed for this source and destination, sending abort",
                    pgn
                );
                self.send_abort(
                    destination.address(),
                    source.address(),
                    pgn,
                    ConnectionAbortReason::AnyOtherError,
                );
            }
        }
    }

    pub(crate) fn process_end_of_message_acknowledge(
        &mut self,
        source: Rc<ControlFunction>,
        destination: Rc<ControlFunction>,
        pgn: u32,
    ) {
        match self.sessions.index_of(&destination, Some(&source)) {
            Some(index) => {
                if self.sessions.get(index).state
                    == StateMachineState::WaitForEndOfMessageAcknowledge
                {
                    // Our tx session completed.
                    self.close_session(index, true);
                } else {
                    // Wrong state; the standard says to ignore it.
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "TP: received an EOM ACK for {:#x} but not expecting one, ignoring",
                        pgn
                    );
                }
            }
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "TP: received an EOM ACK for {:#x} while no session existed for this source and destination, sending abort",
                    pgn
                );
                self.send_abort(
                    destination.address(),
                    source.address(),
                    pgn,
                    ConnectionAbortReason::AnyOtherError,
                );
            }
        }
    }

    pub(crate) fn process_abort(
        &mut self,
        source: Rc<ControlFunction>,
        destination: Rc<ControlFunction>,
        pgn: u32,
        reason: ConnectionAbortReason,
    ) {
        #[cfg(not(feature = "defmt"))]
        let _ = reason;
        let mut found_session = false;

        if let Some(index) = self.sessions.index_of(&source, Some(&destination)) {
            if self.sessions.get(index).pgn == pgn {
                found_session = true;
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "TP: received an abort (reason={}) for an rx session for PGN {:#x}",
                    reason.raw(),
                    pgn
                );
                self.close_session(index, false);
            }
        }
        if let Some(index) = self.sessions.index_of(&destination, Some(&source)) {
            if self.sessions.get(index).pgn == pgn {
                found_session = true;
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "TP: received an abort (reason={}) for a tx session for PGN {:#x}",
                    reason.raw(),
                    pgn
                );
                self.close_session(index, false);
            }
        }

        if !found_session {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "TP: received an abort (reason={}) with no matching session for PGN {:#x}",
                reason.raw(),
                pgn
            );
        }
    }

    //==================================================================================Update

    /// Advance every session's state machine once. Must be called at least
    /// every 50 ms for timely timeout and pacing behaviour.
    pub fn update(&mut self) {
        let mut index = 0;
        while index < self.sessions.len() {
            let closed = if self.sessions.get(index).can_continue() {
                self.update_session(index)
            } else {
                #[cfg(feature = "defmt")]
                defmt::warn!("TP: closing active session as it is unable to continue");
                self.abort_session(index, ConnectionAbortReason::AnyOtherError);
                true
            };
            if !closed {
                index += 1;
            }
        }
    }

    /// One state machine step for the session at `index`. Returns whether
    /// the session was removed from the table.
    fn update_session(&mut self, index: usize) -> bool {
        let now = self.clock.now_ms();
        match self.sessions.get(index).state {
            StateMachineState::None => false,

            StateMachineState::ClearToSend => {
                if let Some(frame) = Self::clear_to_send_frame(self.sessions.get(index)) {
                    if self.bus.transmit(&frame) {
                        let session = self.sessions.get_mut(index);
                        session.state = StateMachineState::RxDataSession;
                        session.deadline_ms = now + TR_TIMEOUT_MS;
                    }
                }
                false
            }

            StateMachineState::RequestToSend => {
                if let Some(frame) = Self::request_to_send_frame(self.sessions.get(index)) {
                    if self.bus.transmit(&frame) {
                        let session = self.sessions.get_mut(index);
                        session.state = StateMachineState::WaitForClearToSend;
                        session.deadline_ms = now + T2_T3_TIMEOUT_MS;
                    }
                }
                false
            }

            StateMachineState::BroadcastAnnounce => {
                if let Some(frame) = Self::broadcast_announce_frame(self.sessions.get(index)) {
                    if self.bus.transmit(&frame) {
                        let session = self.sessions.get_mut(index);
                        session.state = StateMachineState::TxDataSession;
                        // First data frame honours the inter-frame gap too.
                        session.deadline_ms = now + self.config.bam_frame_gap_ms;
                    }
                }
                false
            }

            StateMachineState::WaitForClearToSend
            | StateMachineState::WaitForEndOfMessageAcknowledge => {
                if self.sessions.get(index).timer_expired(now) {
                    #[cfg(feature = "defmt")]
                    defmt::error!(
                        "TP: timeout tx session for {:#x}",
                        self.sessions.get(index).pgn
                    );
                    self.abort_session(index, ConnectionAbortReason::Timeout);
                    true
                } else {
                    false
                }
            }

            StateMachineState::TxDataSession => {
                let session = self.sessions.get(index);
                if session.is_broadcast() && !session.timer_expired(now) {
                    // Still inside the minimum gap between broadcast frames.
                    false
                } else {
                    self.send_data_transfer_packets(index)
                }
            }

            StateMachineState::RxDataSession => {
                let session = self.sessions.get(index);
                if session.timer_expired(now) {
                    if session.is_broadcast() {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("TP: broadcast rx session timeout");
                        self.close_session(index, false);
                    } else {
                        #[cfg(feature = "defmt")]
                        defmt::error!("TP: destination specific rx session timeout");
                        self.abort_session(index, ConnectionAbortReason::Timeout);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Emit data frames for the tx session at `index`: one per update for a
    /// broadcast, up to the cleared window (capped per update) otherwise.
    /// Returns whether the session completed and was removed.
    fn send_data_transfer_packets(&mut self, index: usize) -> bool {
        let now = self.clock.now_ms();
        let mut frames_this_update: u8 = 0;

        loop {
            let session = self.sessions.get_mut(index);
            let broadcast = session.is_broadcast();
            if session.last_sequence >= session.total_packets {
                break;
            }
            if !broadcast && session.cts_window == 0 {
                break;
            }
            if frames_this_update >= self.config.frames_per_update {
                // Throttle the session.
                break;
            }

            let Some(frame) = Self::data_transfer_frame(session) else {
                break;
            };
            if !self.bus.transmit(&frame) {
                // Process more next time the protocol is updated.
                break;
            }

            let session = self.sessions.get_mut(index);
            session.last_sequence = session.last_sequence.wrapping_add(1);
            session.processed_packets = session.processed_packets.wrapping_add(1);
            frames_this_update += 1;
            if broadcast {
                // Wait out the inter-frame gap before the next data frame.
                session.deadline_ms = now + self.config.bam_frame_gap_ms;
                break;
            }
            session.cts_window -= 1;
        }

        let session = self.sessions.get_mut(index);
        if session.last_sequence >= session.total_packets {
            if session.is_broadcast() {
                // Broadcast tx message is complete.
                self.close_session(index, true);
                return true;
            }
            session.state = StateMachineState::WaitForEndOfMessageAcknowledge;
            session.deadline_ms = now + T2_T3_TIMEOUT_MS;
        } else if !session.is_broadcast() && session.cts_window == 0 && frames_this_update > 0 {
            session.state = StateMachineState::WaitForClearToSend;
            session.deadline_ms = now + T2_T3_TIMEOUT_MS;
        }
        false
    }

    //==================================================================================Teardown

    /// Remove the session at `index` and fire its completion callback.
    fn close_session(&mut self, index: usize, successful: bool) {
        let mut session = self.sessions.remove(index);
        if session.direction == SessionDirection::Transmit {
            if let Some(callback) = session.on_complete.take() {
                callback(TransmitReport {
                    pgn: session.pgn,
                    length: session.message_len(),
                    source_address: session.current_source_address(),
                    destination_address: session.current_destination_address(),
                    successful,
                });
            }
        }
        #[cfg(feature = "defmt")]
        defmt::debug!("TP: session closed for {:#x}", session.pgn);
    }

    /// Abort the session at `index`: notify the peer when the transfer has
    /// one and our side can still speak, then tear the session down.
    fn abort_session(&mut self, index: usize, reason: ConnectionAbortReason) {
        let frame = {
            let session = self.sessions.get(index);
            if session.is_broadcast() {
                // Abort traffic toward the global address is forbidden.
                None
            } else {
                let local = match session.direction {
                    SessionDirection::Transmit => session.source.upgrade(),
                    SessionDirection::Receive => {
                        session.destination.as_ref().and_then(|weak| weak.upgrade())
                    }
                };
                local.map(|local| {
                    let peer = match session.direction {
                        SessionDirection::Transmit => session.current_destination_address(),
                        SessionDirection::Receive => session.current_source_address(),
                    };
                    Self::abort_frame(local.address(), peer, session.pgn, reason)
                })
            }
        };
        if let Some(frame) = frame {
            let _ = self.bus.transmit(&frame);
        }
        self.close_session(index, false);
    }

    /// Send an abort that has no corresponding session.
    fn send_abort(&mut self, sender: u8, receiver: u8, pgn: u32, reason: ConnectionAbortReason) {
        let frame = Self::abort_frame(sender, receiver, pgn, reason);
        let _ = self.bus.transmit(&frame);
    }

    //==================================================================================Frame Builders

    fn request_to_send_frame(session: &TransportSession<'_>) -> Option<CanFrame> {
        let local = session.source.upgrade()?;
        let length = session.message_len();
        let pgn = session.pgn.to_le_bytes();
        Some(transport_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            local.address(),
            session.current_destination_address(),
            [
                REQUEST_TO_SEND_MULTIPLEXOR,
                (length & 0xFF) as u8,
                ((length >> 8) & 0xFF) as u8,
                session.total_packets,
                0xFF, // No limit on packets per CTS.
                pgn[0],
                pgn[1],
                pgn[2],
            ],
        ))
    }

    fn broadcast_announce_frame(session: &TransportSession<'_>) -> Option<CanFrame> {
        let local = session.source.upgrade()?;
        let length = session.message_len();
        let pgn = session.pgn.to_le_bytes();
        Some(transport_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            local.address(),
            GLOBAL_ADDRESS,
            [
                BROADCAST_ANNOUNCE_MULTIPLEXOR,
                (length & 0xFF) as u8,
                ((length >> 8) & 0xFF) as u8,
                session.total_packets,
                0xFF,
                pgn[0],
                pgn[1],
                pgn[2],
            ],
        ))
    }

    fn clear_to_send_frame(session: &TransportSession<'_>) -> Option<CanFrame> {
        let local = session.destination.as_ref()?.upgrade()?;
        let packets_remaining = session.total_packets - session.processed_packets;
        let packets_this_segment = session.cts_window.min(packets_remaining);
        let pgn = session.pgn.to_le_bytes();
        Some(transport_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            local.address(),
            session.current_source_address(),
            [
                CLEAR_TO_SEND_MULTIPLEXOR,
                packets_this_segment,
                session.processed_packets.wrapping_add(1),
                0xFF,
                0xFF,
                pgn[0],
                pgn[1],
                pgn[2],
            ],
        ))
    }

    fn end_of_message_frame(session: &TransportSession<'_>) -> Option<CanFrame> {
        let local = session.destination.as_ref()?.upgrade()?;
        let length = session.message_len();
        let pgn = session.pgn.to_le_bytes();
        Some(transport_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            local.address(),
            session.current_source_address(),
            [
                END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR,
                (length & 0xFF) as u8,
                ((length >> 8) & 0xFF) as u8,
                session.total_packets,
                0xFF,
                pgn[0],
                pgn[1],
                pgn[2],
            ],
        ))
    }

    fn data_transfer_frame(session: &mut TransportSession<'_>) -> Option<CanFrame> {
        let local = session.source.upgrade()?;
        let destination_address = session.current_destination_address();
        let length = session.message_len();
        let base = session.last_sequence as usize * PROTOCOL_BYTES_PER_FRAME;
        let mut data = [0xFF; 8];
        data[0] = session.last_sequence.wrapping_add(1);
        for offset in 0..PROTOCOL_BYTES_PER_FRAME {
            let index = base + offset;
            if index < length {
                data[1 + offset] = session.data.get_byte(index);
            }
        }
        Some(transport_frame(
            TRANSPORT_DATA_TRANSFER_PGN,
            local.address(),
            destination_address,
            data,
        ))
    }

    fn abort_frame(sender: u8, receiver: u8, pgn: u32, reason: ConnectionAbortReason) -> CanFrame {
        let pgn = pgn.to_le_bytes();
        transport_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            sender,
            receiver,
            [
                CONNECTION_ABORT_MULTIPLEXOR,
                reason.raw(),
                0xFF,
                0xFF,
                0xFF,
                pgn[0],
                pgn[1],
                pgn[2],
            ],
        )
    }

    //==================================================================================Helpers

    /// Resolve a unicast address to its current claimant. The null and
    /// global addresses never resolve.
    fn resolve_node(&self, address: u8) -> Option<Rc<ControlFunction>> {
        if address >= NULL_ADDRESS {
            return None;
        }
        self.registry.control_function_by_address(address)
    }
}

/// Whether the rx session can still take frames from the currently cleared
/// block. Broadcast sessions have no flow control.
fn session_window_open(session: &TransportSession<'_>) -> bool {
    if session.is_broadcast() || session.cts_window == 0 {
        return true;
    }
    session.processed_packets % session.cts_window != 0
}

/// Build one outbound transport frame with the protocol priority.
fn transport_frame(pgn: u32, source: u8, destination: u8, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id: CanId::transport(pgn, TRANSPORT_PRIORITY, source, destination),
        data,
        len: 8,
    }
}

/// PGN embedded in the last three bytes of a connection management frame.
fn embedded_pgn(data: &[u8; 8]) -> u32 {
    u32::from_le_bytes([data[5], data[6], data[7], 0])
}

/// Message length embedded in bytes one and two of an RTS or BAM frame.
fn embedded_length(data: &[u8; 8]) -> usize {
    u16::from_le_bytes([data[1], data[2]]) as usize
}
