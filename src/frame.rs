//! STX/ETX frame codec.
//!
//! A frame on the wire is `DLE STX <payload> DLE ETX`. Inside the payload
//! every literal `DLE` is doubled; no other byte is escaped because `STX`
//! and `ETX` only carry meaning after a `DLE`.
//!
//! ```text
//! payload  : 01 10 02 03
//! on wire  : 10 02 | 01 10 10 02 03 | 10 03
//! ```
//!
//! The decoder is a two-state machine that survives being fed arbitrary
//! chunks and resynchronises on a new `DLE STX` without reporting an error.

use bytes::{BufMut, Bytes, BytesMut};
use log::{trace, warn};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const DLE: u8 = 0x10;

/// Encode a single payload into a complete frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut builder = FrameBuilder::with_capacity(payload.len() + 4);
    builder.push(payload);
    builder.finish()
}

/// Accumulates several frames into one buffer so they can be handed to the
/// transport in a single write.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    buffer: BytesMut,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append one frame carrying `payload`.
    pub fn push(&mut self, payload: &[u8]) -> &mut Self {
        self.start();
        self.stuff(payload);
        self.end();
        self
    }

    /// Append one frame made of a command byte followed by `args`.
    pub fn command(&mut self, command: u8, args: &[u8]) -> &mut Self {
        self.start();
        self.stuff(&[command]);
        self.stuff(args);
        self.end();
        self
    }

    fn start(&mut self) {
        self.buffer.put_slice(&[DLE, STX]);
    }

    fn end(&mut self) {
        self.buffer.put_slice(&[DLE, ETX]);
    }

    fn stuff(&mut self, data: &[u8]) {
        for &b in data {
            if b == DLE {
                self.buffer.put_u8(DLE);
            }
            self.buffer.put_u8(b);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitStart,
    Receiving,
}

/// Restartable frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    is_dle: bool,
    buffer: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitStart,
            is_dle: false,
            buffer: BytesMut::with_capacity(512),
        }
    }

    /// Feed `data` through the state machine and return every packet that
    /// was completed by it. Partial frames are kept for the next call.
    pub fn decode_stream(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut packets = Vec::new();
        for &b in data {
            if let Some(packet) = self.push_byte(b) {
                packets.push(packet);
            }
        }
        packets
    }

    /// Feed a single byte. Returns the packet if this byte terminated one.
    pub fn push_byte(&mut self, b: u8) -> Option<Bytes> {
        match self.state {
            State::WaitStart => {
                if self.is_dle {
                    if b == STX {
                        self.buffer.clear();
                        self.state = State::Receiving;
                    }
                    self.is_dle = false;
                } else if b == DLE {
                    self.is_dle = true;
                }
                None
            }
            State::Receiving => {
                if self.is_dle {
                    self.is_dle = false;
                    match b {
                        STX => {
                            warn!(
                                "frame restarted, dropping {} buffered bytes",
                                self.buffer.len()
                            );
                            self.buffer.clear();
                            None
                        }
                        ETX => {
                            self.state = State::WaitStart;
                            let packet = self.buffer.split().freeze();
                            trace!("frame complete: {:02x?}", &packet[..]);
                            Some(packet)
                        }
                        _ => {
                            self.buffer.put_u8(b);
                            None
                        }
                    }
                } else if b == DLE {
                    self.is_dle = true;
                    None
                } else {
                    self.buffer.put_u8(b);
                    None
                }
            }
        }
    }

    /// True while a frame has been started but not terminated.
    pub fn in_frame(&self) -> bool {
        self.state == State::Receiving
    }

    pub fn reset(&mut self) {
        self.state = State::WaitStart;
        self.is_dle = false;
        self.buffer.clear();
    }
}
