//! Byte-level cursor over Intel HEX text.
//!
//! Records look like `:llaaaatt[dd...]cc` followed by a line ending. The
//! reader knows nothing about records; it offers the primitives the decoder
//! and the image scanner are built from.

use crate::error::{Error, Result};
use std::io::{self, BufRead};

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Sequential reader over HEX text.
#[derive(Debug)]
pub struct HexReader<R> {
    inner: R,
    position: u64,
}

impl<R: BufRead> HexReader<R> {
    /// Wrap an open image.
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Look at the next byte without consuming it.
    pub fn peek_byte(&mut self) -> Result<Option<u8>> {
        loop {
            match self.inner.fill_buf() {
                Ok(buf) => return Ok(buf.first().copied()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Consume and return the next byte, `None` at end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let byte = self.peek_byte()?;
        if byte.is_some() {
            self.inner.consume(1);
            self.position += 1;
        }
        Ok(byte)
    }

    /// Discard up to `count` bytes, stopping early at end of stream.
    pub fn skip_bytes(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            if self.read_byte()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Move past the rest of the current line and exactly one line ending.
    ///
    /// CR, LF, CRLF and LFCR each count as one ending; a doubled CR or LF is
    /// a blank line and stays in the stream.
    pub fn skip_line(&mut self) -> Result<()> {
        while let Some(byte) = self.read_byte()? {
            if byte == CR || byte == LF {
                let partner = if byte == CR { LF } else { CR };
                if self.peek_byte()? == Some(partner) {
                    self.read_byte()?;
                }
                break;
            }
        }
        Ok(())
    }

    /// Decode one ASCII hex pair, high nibble first.
    ///
    /// Returns `None` when the stream ends inside the pair. Both characters
    /// are consumed before either is validated.
    pub fn read_hex_pair(&mut self) -> Result<Option<u8>> {
        let start = self.position;
        let (Some(hi), Some(lo)) = (self.read_byte()?, self.read_byte()?) else {
            return Ok(None);
        };
        let hi = hex_value(hi).ok_or(Error::MalformedHexDigit {
            found: char::from(hi),
            position: start,
        })?;
        let lo = hex_value(lo).ok_or(Error::MalformedHexDigit {
            found: char::from(lo),
            position: start + 1,
        })?;
        Ok(Some((hi << 4) | lo))
    }
}

/// Value of a single hex digit, case-insensitive.
pub fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}
