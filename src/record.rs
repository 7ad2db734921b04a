//! Persisted metadata records.
//!
//! Each record is framed as
//!
//! ```text
//! magic u32 | kind u8 | version u8 | reserved u16 | body_len u32 | crc32 u32 | body
//! ```
//!
//! with every integer little-endian. Strings in the body are a `u32` length
//! followed by UTF-8 bytes.

use std::time::Duration;

use crate::{Error, Result};

pub const RECORD_MAGIC: u32 = 0x5551_5231; // 'UQR1'
pub const RECORD_VERSION: u8 = 1;
pub const RECORD_HEADER_SIZE: usize = 16;

const KIND_ENGINE: u8 = 1;
const KIND_TOPIC: u8 = 2;
const KIND_LINE: u8 = 3;

/// Set of topic names known to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineRecord {
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRecord {
    pub head: u64,
    pub tail: u64,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRecord {
    pub cursor: u64,
    pub recycle: Duration,
    /// `(offset, deadline_ns)` pairs in offset order.
    pub inflight: Vec<(u64, u64)>,
}

impl EngineRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_strings(&mut body, &self.topics);
        seal(KIND_ENGINE, body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut body = open(KIND_ENGINE, bytes)?;
        let topics = body.strings()?;
        body.finish()?;
        Ok(Self { topics })
    }
}

impl TopicRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&self.head.to_le_bytes());
        body.extend_from_slice(&self.tail.to_le_bytes());
        put_strings(&mut body, &self.lines);
        seal(KIND_TOPIC, body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut body = open(KIND_TOPIC, bytes)?;
        let head = body.u64()?;
        let tail = body.u64()?;
        let lines = body.strings()?;
        body.finish()?;
        if head > tail {
            return Err(Error::Corrupt("topic head beyond tail"));
        }
        Ok(Self { head, tail, lines })
    }
}

impl LineRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(20 + self.inflight.len() * 16);
        body.extend_from_slice(&self.cursor.to_le_bytes());
        let recycle_ns = u64::try_from(self.recycle.as_nanos()).unwrap_or(u64::MAX);
        body.extend_from_slice(&recycle_ns.to_le_bytes());
        body.extend_from_slice(&(self.inflight.len() as u32).to_le_bytes());
        for (offset, deadline) in &self.inflight {
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&deadline.to_le_bytes());
        }
        seal(KIND_LINE, body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut body = open(KIND_LINE, bytes)?;
        let cursor = body.u64()?;
        let recycle = Duration::from_nanos(body.u64()?);
        let count = body.u32()? as usize;
        let mut inflight = Vec::with_capacity(count.min(body.remaining() / 16));
        for _ in 0..count {
            let offset = body.u64()?;
            let deadline = body.u64()?;
            inflight.push((offset, deadline));
        }
        body.finish()?;
        Ok(Self {
            cursor,
            recycle,
            inflight,
        })
    }
}

fn put_strings(buf: &mut Vec<u8>, values: &[String]) {
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
}

fn seal(kind: u8, body: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.push(kind);
    buf.push(RECORD_VERSION);
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record_crc(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

fn open(kind: u8, bytes: &[u8]) -> Result<Body<'_>> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(Error::Corrupt("record shorter than header"));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("slice length"));
    if magic != RECORD_MAGIC {
        return Err(Error::Corrupt("record magic mismatch"));
    }
    if bytes[4] != kind {
        return Err(Error::Corrupt("record kind mismatch"));
    }
    if bytes[5] != RECORD_VERSION {
        return Err(Error::Corrupt("unsupported record version"));
    }
    let body_len = u32::from_le_bytes(bytes[8..12].try_into().expect("slice length")) as usize;
    let crc = u32::from_le_bytes(bytes[12..16].try_into().expect("slice length"));
    let body = &bytes[RECORD_HEADER_SIZE..];
    if body.len() != body_len {
        return Err(Error::Corrupt("record length mismatch"));
    }
    if record_crc(body) != crc {
        return Err(Error::Corrupt("record crc mismatch"));
    }
    Ok(Body { buf: body, pos: 0 })
}

fn record_crc(payload: &[u8]) -> u32 {
    use crc32fast::Hasher;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Corrupt("record truncated"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("slice length")))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("slice length")))
    }

    fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.u32()? as usize;
        let mut out = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            let len = self.u32()? as usize;
            let bytes = self.take(len)?;
            let value = std::str::from_utf8(bytes)
                .map_err(|_| Error::Corrupt("record string is not utf-8"))?;
            out.push(value.to_owned());
        }
        Ok(out)
    }

    fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::Corrupt("record has trailing bytes"));
        }
        Ok(())
    }
}
