//! One-pass summary of a HEX image.

use crate::error::Result;
use crate::image::reader::HexReader;
use crate::image::store::ImageStore;
use std::io::BufRead;

const RECORD_MARK: u8 = b':';
const ADDRESS_CHARS: usize = 4;
const TYPE_DATA: u8 = 0x00;
const TYPE_END_OF_FILE: u8 = 0x01;

/// Record and byte counts of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageStats {
    /// Records of any type.
    pub records: usize,
    /// Records of type 00.
    pub data_records: usize,
    /// Payload bytes of type 00 records.
    pub data_bytes: usize,
    /// Declared payload bytes of all records, which is what gets streamed
    /// to the target.
    pub payload_bytes: usize,
    /// Whether a type 01 record was found.
    pub has_end_record: bool,
}

impl ImageStats {
    /// Walk every record header of the image.
    pub fn scan<R: BufRead>(reader: &mut HexReader<R>) -> Result<Self> {
        let mut stats = Self::default();

        while let Some(byte) = reader.read_byte()? {
            if byte != RECORD_MARK {
                continue;
            }
            let Some(len) = reader.read_hex_pair()? else {
                break;
            };
            reader.skip_bytes(ADDRESS_CHARS)?;
            let Some(kind) = reader.read_hex_pair()? else {
                break;
            };

            stats.records += 1;
            stats.payload_bytes += usize::from(len);
            match kind {
                TYPE_DATA => {
                    stats.data_records += 1;
                    stats.data_bytes += usize::from(len);
                },
                TYPE_END_OF_FILE => stats.has_end_record = true,
                _ => {},
            }
            reader.skip_line()?;
        }

        Ok(stats)
    }

    /// Open `name` in `store` and scan it.
    pub fn from_store<S: ImageStore>(store: &S, name: &str) -> Result<Self> {
        let mut reader = HexReader::new(store.open(name)?);
        Self::scan(&mut reader)
    }

    /// Number of pages of `page_size` bytes the payload fills.
    pub fn pages(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.payload_bytes.div_ceil(page_size)
    }

    /// Whether some non-data record carries payload that will be streamed
    /// as if it were program data.
    pub fn has_foreign_payload(&self) -> bool {
        self.payload_bytes != self.data_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::store::MemoryStore;
    use std::io::Cursor;

    fn scan(text: &str) -> ImageStats {
        let mut reader = HexReader::new(Cursor::new(text.as_bytes().to_vec()));
        ImageStats::scan(&mut reader).unwrap()
    }

    #[test]
    fn test_scan_counts_records() {
        let stats = scan(":0400000011223344EE\r\n:03000400556677CC\r\n:00000001FF\r\n");
        assert_eq!(stats.records, 3);
        assert_eq!(stats.data_records, 2);
        assert_eq!(stats.data_bytes, 7);
        assert_eq!(stats.payload_bytes, 7);
        assert!(stats.has_end_record);
        assert!(!stats.has_foreign_payload());
    }

    #[test]
    fn test_scan_extended_address_record() {
        let stats = scan(":020000040000FA\n:0100000042BD\n:00000001FF\n");
        assert_eq!(stats.data_bytes, 1);
        assert_eq!(stats.payload_bytes, 3);
        assert!(stats.has_foreign_payload());
    }

    #[test]
    fn test_scan_without_end_record() {
        let stats = scan(":0100000042BD");
        assert_eq!(stats.records, 1);
        assert!(!stats.has_end_record);
    }

    #[test]
    fn test_pages() {
        let stats = ImageStats {
            payload_bytes: 300,
            ..ImageStats::default()
        };
        assert_eq!(stats.pages(128), 3);
        assert_eq!(stats.pages(300), 1);
        assert_eq!(stats.pages(0), 0);
        assert_eq!(ImageStats::default().pages(128), 0);
    }

    #[test]
    fn test_from_store() {
        let store = MemoryStore::new().with_image("a.hex", ":0100000042BD\n:00000001FF\n");
        let stats = ImageStats::from_store(&store, "a.hex").unwrap();
        assert_eq!(stats.data_bytes, 1);
    }
}
