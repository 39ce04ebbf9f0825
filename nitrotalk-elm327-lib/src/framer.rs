//! Line framing for the adapter's notification byte stream
//!
//! Notifications arrive in arbitrary chunks (BLE MTU sized, RFCOMM segments),
//! so a response line may be split across several deliveries or several lines
//! may arrive in one.

use log::{trace, warn};

/// Default Line Buffer capacity in bytes
pub const LINE_CAPACITY: usize = 384;

pub const PROMPT: u8 = b'>';

/// What ended a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    CarriageReturn,
    LineFeed,
    /// The adapter's `>` byte; it is idle and ready for the next command
    Prompt,
}

impl Terminator {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'\r' => Some(Self::CarriageReturn),
            b'\n' => Some(Self::LineFeed),
            PROMPT => Some(Self::Prompt),
            _ => None,
        }
    }
}

/// A completed line, borrowed from the framer's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Line text with the terminator removed. Empty for back-to-back terminators.
    pub text: &'a str,
    pub terminator: Terminator,
    /// Bytes were discarded because the line hit capacity
    pub truncated: bool,
}

/// Bounded line accumulator
///
/// Holds at most `N - 1` bytes of the line in progress. Every terminator byte
/// produces exactly one [`Frame`] and clears the buffer.
#[derive(Debug)]
pub struct LineFramer<const N: usize = LINE_CAPACITY> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> Default for LineFramer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LineFramer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Largest line that can be emitted
    pub const fn max_line_len() -> usize {
        N.saturating_sub(1)
    }

    /// Bytes of the line currently being accumulated
    pub fn pending(&self) -> usize {
        self.len
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// Feed a chunk of received bytes, invoking `on_frame` for every
    /// terminator encountered.
    pub fn feed(&mut self, data: &[u8], mut on_frame: impl FnMut(Frame<'_>)) {
        for &byte in data {
            if let Some(terminator) = Terminator::from_byte(byte) {
                // Only printable ASCII ever enters the buffer
                let text = std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default();
                on_frame(Frame {
                    text,
                    terminator,
                    truncated: self.truncated,
                });
                self.reset();
            } else if (0x20..=0x7E).contains(&byte) {
                if self.len < Self::max_line_len() {
                    self.buf[self.len] = byte;
                    self.len += 1;
                } else {
                    if !self.truncated {
                        warn!("⚠️ Line exceeds {} bytes, truncating", Self::max_line_len());
                    }
                    self.truncated = true;
                }
            } else {
                trace!("Dropping non-printable byte 0x{byte:02X}");
            }
        }
    }
}
