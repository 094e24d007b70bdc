//! Record type and record sources.
//!
//! A record is a fixed 128-bit (key, value) pair. Record files are gzip
//! streams framed as a u64 record count followed by the raw little-endian
//! records; keys must appear in non-decreasing order for database builds.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// A single key/value record. Values are truncated to u32 when the
/// database is built in 32-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub key: u64,
    pub value: u64,
}

impl Record {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(key: u64, value: u64) -> Self {
        Self { key, value }
    }

    fn to_le_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.key.to_le_bytes());
        out[8..].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    fn from_le_bytes(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        Self {
            key: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            value: u64::from_le_bytes(buf[8..].try_into().unwrap()),
        }
    }
}

/// Pull interface the database builder consumes records from.
pub trait RecordSource {
    /// Returns the next record, or `None` when the stream is exhausted.
    fn next_record(&mut self) -> Option<Record>;
}

impl<I: Iterator<Item = Record>> RecordSource for I {
    fn next_record(&mut self) -> Option<Record> {
        self.next()
    }
}

/// Opens `path` for reading, transparently decompressing gzip content.
/// Plain files are detected by sniffing the two-byte gzip magic.
pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 2];
    let mut n = 0;
    while n < magic.len() {
        let read = file.read(&mut magic[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }
    let header = std::io::Cursor::new(magic[..n].to_vec());
    let rewound = header.chain(file);
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(MultiGzDecoder::new(rewound)))
    } else {
        Ok(Box::new(BufReader::new(rewound)))
    }
}

/// Streaming reader over a record file: u64 count, then raw records.
pub struct RecordFileReader {
    inner: Box<dyn Read>,
    size: u64,
    read: u64,
}

impl RecordFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut inner = open_maybe_gz(path)?;
        let mut count = [0u8; 8];
        inner
            .read_exact(&mut count)
            .context("record file truncated before count")?;
        Ok(Self {
            inner,
            size: u64::from_le_bytes(count),
            read: 0,
        })
    }

    /// Number of records the file claims to hold.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl RecordSource for RecordFileReader {
    fn next_record(&mut self) -> Option<Record> {
        if self.read >= self.size {
            return None;
        }
        let mut buf = [0u8; Record::ENCODED_LEN];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {
                self.read += 1;
                Some(Record::from_le_bytes(&buf))
            }
            Err(_) => None,
        }
    }
}

/// In-memory record collection keyed by u64, used when writing record
/// files and when verifying query results against the inserted data.
#[derive(Default)]
pub struct RecordMap {
    map: BTreeMap<u64, Vec<u64>>,
    size: u64,
}

impl RecordMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns true iff the key was not seen before.
    pub fn add_record(&mut self, m: Record) -> bool {
        self.size += 1;
        let values = self.map.entry(m.key).or_default();
        values.push(m.value);
        values.len() == 1
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn distinct_keys(&self) -> usize {
        self.map.len()
    }

    pub fn values(&self, key: u64) -> Option<&[u64]> {
        self.map.get(&key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.keys().copied()
    }

    /// Streams the records back in key order, values sorted ascending.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.map.iter().flat_map(|(&key, values)| {
            let mut sorted = values.clone();
            sorted.sort_unstable();
            sorted.into_iter().map(move |value| Record { key, value })
        })
    }

    /// Writes the collected records to `path` as a record file with the
    /// given gzip level (0 = uncompressed).
    pub fn write_records(&self, path: &Path, level: u32) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut out: Box<dyn Write> = if level == 0 {
            Box::new(BufWriter::new(file))
        } else {
            Box::new(GzEncoder::new(file, Compression::new(level.min(9))))
        };
        out.write_all(&self.size.to_le_bytes())?;
        for record in self.records() {
            out.write_all(&record.to_le_bytes())?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_encoding_roundtrip() {
        let m = Record::new(0xDEAD_BEEF_0123_4567, 42);
        assert_eq!(Record::from_le_bytes(&m.to_le_bytes()), m);
    }

    #[test]
    fn record_file_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.dump");

        let mut map = RecordMap::new();
        assert!(map.add_record(Record::new(10, 7)));
        assert!(!map.add_record(Record::new(10, 3)));
        assert!(map.add_record(Record::new(11, 99)));
        map.write_records(&path, 6).unwrap();

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.size(), 3);
        // Values of key 10 come back sorted.
        assert_eq!(reader.next_record(), Some(Record::new(10, 3)));
        assert_eq!(reader.next_record(), Some(Record::new(10, 7)));
        assert_eq!(reader.next_record(), Some(Record::new(11, 99)));
        assert_eq!(reader.next_record(), None);
    }

    #[test]
    fn plain_files_load_without_gzip_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.dump");

        let mut map = RecordMap::new();
        map.add_record(Record::new(1, 2));
        map.write_records(&path, 0).unwrap();

        let mut reader = RecordFileReader::open(&path).unwrap();
        assert_eq!(reader.next_record(), Some(Record::new(1, 2)));
    }
}
