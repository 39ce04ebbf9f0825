//! ISO-TP multi-frame responses
//!
//! On CAN the adapter prints a reply longer than one frame as a byte count
//! line followed by numbered frame lines:
//!
//! ```text
//! 008
//! 0: 41 0C 2E E0 11 FF
//! 1: 0D 3C 00 00 00 00 00
//! ```
//!
//! Only the first frame starts with the Mode 01 ack, so the frames have to be
//! joined before decoding.

use std::borrow::Cow;

use log::trace;

/// Frame indices run 0-F and wrap
const INDEX_MODULUS: u8 = 0x10;

/// Split an ISO-TP line number (`0:` .. `F:`) off the front of a line
pub fn split_line_number(line: &str) -> Option<(u8, &str)> {
    let (prefix, rest) = line.split_once(':')?;
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.len() > 2 {
        return None;
    }
    let index = u8::from_str_radix(prefix, 16).ok()?;
    Some((index, rest))
}

/// The line without its ISO-TP line number, if it has one
pub fn strip_line_number(line: &str) -> &str {
    split_line_number(line).map_or(line, |(_, rest)| rest)
}

/// `008` -> 8. Exactly three hex digits, nothing else.
fn parse_length_header(line: &str) -> Option<usize> {
    if line.len() != 3 || !line.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(line, 16).ok().filter(|&len| len > 0)
}

/// Joins numbered frame lines into one compact hex payload
#[derive(Debug, Default)]
pub struct MultiFrameAssembler {
    /// Byte count from the header line, set while frames are outstanding
    expected: Option<usize>,
    next_index: u8,
    payload: String,
}

impl MultiFrameAssembler {
    pub const fn new() -> Self {
        Self {
            expected: None,
            next_index: 0,
            payload: String::new(),
        }
    }

    pub fn reset(&mut self) {
        self.expected = None;
        self.next_index = 0;
        self.payload.clear();
    }

    /// Feed one data line. Returns what should be decoded: the line itself
    /// when it is not part of a multi-frame reply, the joined payload once
    /// the last frame arrived, `None` while frames are outstanding.
    pub fn push<'a>(&mut self, line: &'a str) -> Option<Cow<'a, str>> {
        let line = line.trim();
        if let Some(len) = parse_length_header(line) {
            if self.expected.is_some() {
                trace!("Multi-frame reply superseded after {} digits", self.payload.len());
            }
            self.reset();
            self.expected = Some(len);
            return None;
        }

        let Some(expected) = self.expected else {
            return Some(Cow::Borrowed(line));
        };
        let Some((index, rest)) = split_line_number(line) else {
            trace!("Unnumbered line inside a multi-frame reply, dropping the partial payload");
            self.reset();
            return Some(Cow::Borrowed(line));
        };
        if index != self.next_index {
            trace!("Frame {index} out of sequence (expected {}), dropping reply", self.next_index);
            self.reset();
            return None;
        }

        self.next_index = (self.next_index + 1) % INDEX_MODULUS;
        self.payload.extend(rest.chars().filter(char::is_ascii_hexdigit));
        if self.payload.len() < expected * 2 {
            return None;
        }
        // Drop the padding of the last frame
        self.payload.truncate(expected * 2);
        let payload = std::mem::take(&mut self.payload);
        self.reset();
        Some(Cow::Owned(payload))
    }

    /// End of response (prompt): hand out whatever arrived of an incomplete
    /// reply, the decoder stops at truncated data
    pub fn flush(&mut self) -> Option<String> {
        self.expected?;
        let payload = std::mem::take(&mut self.payload);
        self.reset();
        (!payload.is_empty()).then_some(payload)
    }
}
