//! Typed little-endian stream layer with a framed header.
//!
//! Generic over any [`std::io::Write`]/[`std::io::Read`]; the closed set
//! of sinks used by the crate is an in-memory `Vec<u8>`, a buffered file,
//! and a gzip-wrapped file (`flate2`). All multi-byte integers are
//! little-endian and no conversion is performed at read time: a header
//! endianness word of 1 rejects databases produced on big-endian hosts.
//!
//! A header is 20 bytes: a 16-byte zero-padded ASCII tag, a u16
//! endianness marker (must be 1) and a u16 version.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};

const HEADER_TAG_LEN: usize = 16;
const ENDIANNESS_MARKER: u16 = 1;

pub struct BinWriter<W: Write> {
    inner: W,
}

impl<W: Write> BinWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_header(&mut self, name: &str, version: u16) -> Result<()> {
        let mut tag = [0u8; HEADER_TAG_LEN];
        let len = name.len().min(HEADER_TAG_LEN);
        tag[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.inner.write_all(&tag)?;
        self.write_u16(ENDIANNESS_MARKER)?;
        self.write_u16(version)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).context("stream write failed")
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    /// Length-prefixed vector: u64 count, then the elements.
    pub fn write_u64_vec(&mut self, values: &[u64]) -> Result<()> {
        self.write_u64(values.len() as u64)?;
        for &value in values {
            self.write_u64(value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().context("stream flush failed")
    }
}

pub struct BinReader<R: Read> {
    inner: R,
}

impl<R: Read> BinReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads and verifies a header, returning the stored version.
    pub fn read_header(&mut self, expected_name: &str) -> Result<u16> {
        let mut tag = [0u8; HEADER_TAG_LEN];
        self.read_bytes(&mut tag)?;

        let mut expected = [0u8; HEADER_TAG_LEN];
        let len = expected_name.len().min(HEADER_TAG_LEN);
        expected[..len].copy_from_slice(&expected_name.as_bytes()[..len]);
        if tag != expected {
            bail!("invalid header: expected {:?} tag", expected_name);
        }

        let endianness = self.read_u16()?;
        if endianness != ENDIANNESS_MARKER {
            bail!("invalid header: wrong endianness marker {}", endianness);
        }
        self.read_u16()
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).context("stream read failed")
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    pub fn read_u64_vec(&mut self) -> Result<Vec<u64>> {
        let count = self.read_u64()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 24));
        for _ in 0..count {
            out.push(self.read_u64()?);
        }
        Ok(out)
    }
}
