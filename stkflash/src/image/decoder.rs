//! Record-spanning payload decoder.
//!
//! HEX records vary in length (the last data record is usually short), while
//! the wire wants fixed-size runs of bytes. [`HexDecoder::decode`] fills a
//! chunk of up to [`CHUNK_CAPACITY`] bytes, moving on to the next record
//! whenever the current one runs out.
//!
//! Only the length field of a record is interpreted. Address and type are
//! skipped, the checksum is never verified.

use crate::error::Result;
use crate::image::reader::HexReader;
use log::trace;
use std::io::BufRead;

/// Maximum number of bytes one [`HexDecoder::decode`] call delivers.
pub const CHUNK_CAPACITY: usize = 16;

/// Filler for positions past the end of the image.
pub const SENTINEL: u8 = 0xFF;

const RECORD_MARK: u8 = b':';

/// Characters of the address (4) and type (2) fields.
const ADDRESS_AND_TYPE_CHARS: usize = 6;

/// Fixed-capacity run of decoded bytes.
///
/// Always fully populated: positions from [`Chunk::delivered`] onwards hold
/// [`SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    bytes: [u8; CHUNK_CAPACITY],
    delivered: usize,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            bytes: [SENTINEL; CHUNK_CAPACITY],
            delivered: 0,
        }
    }

    /// All `CHUNK_CAPACITY` bytes, padding included.
    pub fn as_bytes(&self) -> &[u8; CHUNK_CAPACITY] {
        &self.bytes
    }

    /// Only the bytes that came from the image.
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.delivered]
    }

    /// Number of bytes that came from the image.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

/// Cursor over the payload of a HEX image.
#[derive(Debug)]
pub struct HexDecoder<R> {
    reader: HexReader<R>,
    leftover: u8,
    /// Byte decoded by a look-ahead and not yet delivered.
    pending: Option<u8>,
    ended: bool,
}

impl<R: BufRead> HexDecoder<R> {
    /// Start decoding from the beginning of an open image.
    pub fn new(inner: R) -> Self {
        Self::from_reader(HexReader::new(inner))
    }

    /// Start decoding from an existing reader position.
    pub fn from_reader(reader: HexReader<R>) -> Self {
        Self {
            reader,
            leftover: 0,
            pending: None,
            ended: false,
        }
    }

    /// Bytes still undelivered in the current record.
    pub fn leftover(&self) -> u8 {
        self.leftover + u8::from(self.pending.is_some())
    }

    /// Whether the image ran out.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Bytes of HEX text consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// Decode the next `requested` payload bytes.
    ///
    /// `requested` is clamped to [`CHUNK_CAPACITY`]. Once the image has
    /// ended every call returns an all-sentinel chunk without reading.
    pub fn decode(&mut self, requested: usize) -> Result<Chunk> {
        let wanted = requested.min(CHUNK_CAPACITY);
        let mut chunk = Chunk::empty();

        while chunk.delivered < wanted {
            match self.next_byte()? {
                Some(byte) => {
                    chunk.bytes[chunk.delivered] = byte;
                    chunk.delivered += 1;
                },
                None => break,
            }
        }

        trace!(
            "decode({requested}) -> {} bytes {:02X?}",
            chunk.delivered,
            chunk.data()
        );
        Ok(chunk)
    }

    /// Whether no payload byte is left.
    ///
    /// Decodes ahead to the next payload byte and keeps it for the next
    /// [`HexDecoder::decode`]. Records that declare no data (such as the
    /// end-of-file record) and a record cut off before its first data byte
    /// both count as the end, so after the last data byte has been decoded
    /// this reports `true` even before `decode` saw the end.
    pub fn is_exhausted(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(false);
        }
        self.pending = self.next_byte()?;
        Ok(self.pending.is_none())
    }

    /// Next payload byte, crossing record boundaries as needed.
    fn next_byte(&mut self) -> Result<Option<u8>> {
        if let Some(byte) = self.pending.take() {
            return Ok(Some(byte));
        }
        while !self.ended {
            if self.leftover > 0 {
                self.leftover -= 1;
                match self.reader.read_hex_pair()? {
                    Some(byte) => return Ok(Some(byte)),
                    None => self.finish(),
                }
            } else {
                self.open_next_record()?;
            }
        }
        Ok(None)
    }

    /// Scan to the next record mark and load its length field.
    fn open_next_record(&mut self) -> Result<()> {
        loop {
            match self.reader.read_byte()? {
                Some(RECORD_MARK) => {
                    match self.reader.read_hex_pair()? {
                        Some(len) => {
                            trace!("record at byte {}: {len} data bytes", self.reader.position());
                            self.leftover = len;
                            self.reader.skip_bytes(ADDRESS_AND_TYPE_CHARS)?;
                        },
                        None => self.finish(),
                    }
                    return Ok(());
                },
                Some(_) => {},
                None => {
                    self.finish();
                    return Ok(());
                },
            }
        }
    }

    fn finish(&mut self) {
        self.leftover = 0;
        self.pending = None;
        self.ended = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Cursor;

    const ONE_RECORD: &str = ":10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n";

    const TWO_RECORDS: &str = "\
:0400000011223344EE\r
:03000400556677CC\r
:00000001FF\r
";

    fn decoder(text: &str) -> HexDecoder<Cursor<Vec<u8>>> {
        HexDecoder::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_full_record_then_sentinel() {
        let mut d = decoder(ONE_RECORD);

        let chunk = d.decode(16).unwrap();
        let expected: Vec<u8> = (0x00..=0x0F).collect();
        assert_eq!(chunk.delivered(), 16);
        assert_eq!(chunk.as_bytes().as_slice(), expected.as_slice());
        assert!(!d.is_ended());

        let chunk = d.decode(16).unwrap();
        assert_eq!(chunk.delivered(), 0);
        assert_eq!(chunk.as_bytes(), &[SENTINEL; CHUNK_CAPACITY]);
        assert!(d.is_ended());
    }

    #[test]
    fn test_spans_record_boundaries() {
        let mut d = decoder(TWO_RECORDS);
        let chunk = d.decode(16).unwrap();

        assert_eq!(chunk.data(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert!(chunk.as_bytes()[7..].iter().all(|&b| b == SENTINEL));
        assert!(d.is_ended());
    }

    #[test]
    fn test_split_decodes_match_single_decode() {
        let mut whole = decoder(TWO_RECORDS);
        let expected = whole.decode(9).unwrap();

        for split in 0..=9 {
            let mut parts = decoder(TWO_RECORDS);
            let first = parts.decode(split).unwrap();
            let second = parts.decode(9 - split).unwrap();

            let mut joined = first.data().to_vec();
            joined.extend_from_slice(second.data());
            assert_eq!(joined, expected.data(), "split at {split}");
        }
    }

    #[test]
    fn test_request_clamped_to_capacity() {
        let text = ":14000000000102030405060708090A0B0C0D0E0F1011121300\n";
        let mut d = decoder(text);

        let chunk = d.decode(40).unwrap();
        assert_eq!(chunk.delivered(), CHUNK_CAPACITY);
        assert_eq!(d.leftover(), 4);

        let chunk = d.decode(40).unwrap();
        assert_eq!(chunk.data(), &[0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_zero_request_reads_nothing() {
        let mut d = decoder(ONE_RECORD);
        let chunk = d.decode(0).unwrap();
        assert_eq!(chunk.delivered(), 0);
        assert_eq!(d.position(), 0);
    }

    #[test]
    fn test_truncated_record_pads_with_sentinel() {
        // Declares 8 bytes, the text stops after 2 and a half.
        let mut d = decoder(":08000000AABBC");
        let chunk = d.decode(8).unwrap();

        assert_eq!(chunk.data(), &[0xAA, 0xBB]);
        assert!(d.is_ended());
        assert_eq!(d.leftover(), 0);
    }

    #[test]
    fn test_ended_decoder_has_no_side_effects() {
        let mut d = decoder(":00000001FF");
        assert_eq!(d.decode(4).unwrap().delivered(), 0);
        assert!(d.is_ended());

        let position = d.position();
        assert_eq!(d.decode(4).unwrap().as_bytes(), &[SENTINEL; CHUNK_CAPACITY]);
        assert_eq!(d.position(), position);
    }

    #[test]
    fn test_malformed_digit_in_data() {
        let mut d = decoder(":02000000A1G2FF\n");
        let err = d.decode(2).unwrap_err();
        assert!(matches!(err, Error::MalformedHexDigit { found: 'G', .. }));
    }

    #[test]
    fn test_is_exhausted_skips_eof_record() {
        let mut d = decoder(ONE_RECORD);
        assert!(!d.is_exhausted().unwrap());

        d.decode(16).unwrap();
        assert!(!d.is_ended());
        assert!(d.is_exhausted().unwrap());
        assert!(d.is_ended());
    }

    #[test]
    fn test_is_exhausted_keeps_pending_data() {
        let mut d = decoder(TWO_RECORDS);
        d.decode(4).unwrap();
        assert!(!d.is_exhausted().unwrap());
        assert_eq!(d.decode(3).unwrap().data(), &[0x55, 0x66, 0x77]);
    }

    #[test]
    fn test_is_exhausted_on_record_cut_after_header() {
        // A full record, then a header whose data never arrives.
        let text = ":10000000000102030405060708090A0B0C0D0E0F78\n:10001000";
        let mut d = decoder(text);
        assert_eq!(d.decode(16).unwrap().delivered(), 16);

        assert!(d.is_exhausted().unwrap());
        assert!(d.is_ended());
        assert_eq!(d.decode(16).unwrap().delivered(), 0);
    }

    #[test]
    fn test_look_ahead_byte_is_delivered_once() {
        let mut d = decoder(TWO_RECORDS);
        assert!(!d.is_exhausted().unwrap());
        assert!(!d.is_exhausted().unwrap());
        assert_eq!(d.leftover(), 4);

        let chunk = d.decode(16).unwrap();
        assert_eq!(chunk.data(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
    }

    #[test]
    fn test_text_between_records_is_ignored() {
        let text = "garbage\n:0100000042BD\n\n\n:0100010043BB\n";
        let mut d = decoder(text);
        assert_eq!(d.decode(4).unwrap().data(), &[0x42, 0x43]);
    }
}
