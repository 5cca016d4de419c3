//! Polymorphic payload storage for in-flight transport messages.
//!
//! The session engine reads and writes message bytes exclusively through
//! [`TransportData`], so a payload can live in an engine-owned buffer, in a
//! caller-lent one, or be produced chunk by chunk while a transmission is
//! running. Nothing in the engine assumes contiguous memory.
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::protocol::transport::PROTOCOL_BYTES_PER_FRAME;

//==================================================================================CHUNK_SOURCE

/// Producer callback filling `buffer` with the message bytes starting at
/// `offset`. The engine asks for consecutive, forward-moving chunks.
pub type ChunkCallback<'a> = Box<dyn FnMut(usize, &mut [u8]) + 'a>;

/// Pull-style payload source keeping a small sliding window over the
/// producer's output. Used for transmissions whose payload is generated on
/// demand rather than materialized up front.
pub struct ChunkSource<'a> {
    total_len: usize,
    chunk_size: usize,
    callback: ChunkCallback<'a>,
    window: Vec<u8>,
    window_offset: usize,
    primed: bool,
}

impl<'a> ChunkSource<'a> {
    /// Create a source producing `total_len` bytes in frame-sized chunks.
    pub fn new(total_len: usize, callback: ChunkCallback<'a>) -> Self {
        Self::with_chunk_size(total_len, PROTOCOL_BYTES_PER_FRAME, callback)
    }

    /// Create a source with an explicit producer chunk size.
    pub fn with_chunk_size(total_len: usize, chunk_size: usize, callback: ChunkCallback<'a>) -> Self {
        Self {
            total_len,
            chunk_size: chunk_size.max(1),
            callback,
            window: Vec::with_capacity(chunk_size.max(1)),
            window_offset: 0,
            primed: false,
        }
    }

    /// Total number of bytes the producer will deliver.
    pub fn len(&self) -> usize {
        self.total_len
    }

    /// Whether the producer delivers no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    fn refill(&mut self, offset: usize) {
        let len = self.chunk_size.min(self.total_len - offset);
        self.window.resize(len, 0);
        (self.callback)(offset, &mut self.window);
        self.window_offset = offset;
    }

    /// Byte at `index`, advancing the window as needed. Reads never move
    /// backwards past the start of the current window.
    pub fn byte_at(&mut self, index: usize) -> u8 {
        debug_assert!(index < self.total_len);
        debug_assert!(self.window_offset <= index || !self.primed);
        if !self.primed {
            self.refill(0);
            self.primed = true;
        }
        while index >= self.window_offset + self.window.len() {
            let next = self.window_offset + self.window.len();
            self.refill(next);
        }
        self.window[index - self.window_offset]
    }
}

impl core::fmt::Debug for ChunkSource<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChunkSource")
            .field("total_len", &self.total_len)
            .field("chunk_size", &self.chunk_size)
            .field("window_offset", &self.window_offset)
            .finish_non_exhaustive()
    }
}

//==================================================================================TRANSPORT_DATA

/// Storage behind a transport message payload.
#[derive(Debug)]
pub enum TransportData<'a> {
    /// Engine-owned heap buffer. Reassembly targets and plain transmissions.
    Owned(Vec<u8>),
    /// Caller-lent buffer the engine reads and writes through for the
    /// lifetime of the session.
    View(&'a mut [u8]),
    /// Pull-style producer. Transmit-only: inbound data is never stored here.
    Pull(ChunkSource<'a>),
}

impl<'a> TransportData<'a> {
    /// Owned zero-filled buffer of `len` bytes, ready for reassembly.
    pub fn zeroed(len: usize) -> Self {
        Self::Owned(vec![0; len])
    }

    /// Declared total length of the message.
    pub fn len(&self) -> usize {
        match self {
            Self::Owned(bytes) => bytes.len(),
            Self::View(bytes) => bytes.len(),
            Self::Pull(source) => source.len(),
        }
    }

    /// Whether the message carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte at `index`. Pull sources advance their window on demand.
    pub fn get_byte(&mut self, index: usize) -> u8 {
        match self {
            Self::Owned(bytes) => bytes[index],
            Self::View(bytes) => bytes[index],
            Self::Pull(source) => source.byte_at(index),
        }
    }

    /// Store `value` at `index`. Ignored for pull sources, which only ever
    /// feed outbound traffic.
    pub fn set_byte(&mut self, index: usize, value: u8) {
        match self {
            Self::Owned(bytes) => bytes[index] = value,
            Self::View(bytes) => bytes[index] = value,
            Self::Pull(_) => {}
        }
    }

    /// Contiguous view of the payload, used to hand a reassembled message
    /// upward. Pull sources expose no contiguous storage.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::View(bytes) => bytes,
            Self::Pull(_) => &[],
        }
    }
}
