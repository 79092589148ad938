//! RecordIO framing
//!
//! Every record is a little-endian `u32` magic word, a `u32` whose upper three
//! bits are a continuation flag and lower 29 bits the payload length, the
//! payload, and zero padding up to a multiple of four bytes. Payloads that
//! contain the magic word at an aligned offset are written as several parts
//! and joined back together, magic word included, when read.
//!
//! Image records start with a 24-byte header (`flag`, `label`, `id`, `id2`)
//! followed by `flag` extra `f32` labels when `flag > 0`, then the encoded
//! image bytes.

use std::io::{self, Read, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0xCED7_230A;

const LENGTH_BITS: u32 = 29;
const LENGTH_MASK: u32 = (1 << LENGTH_BITS) - 1;
const IMAGE_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Continuation {
    Whole = 0,
    First = 1,
    Middle = 2,
    Last = 3,
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Lazily reads record payloads, one per call.
pub struct RecordReader<R> {
    reader: R,
    source_id: String,
    records_read: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, source_id: impl Into<String>) -> Self {
        Self {
            reader,
            source_id: source_id.into(),
            records_read: 0,
        }
    }

    pub fn records_read(&self) -> usize {
        self.records_read
    }

    /// Next complete payload, or `None` on a clean end of file.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        let mut in_multipart = false;

        loop {
            let Some((flag, len)) = self.read_header()? else {
                if in_multipart {
                    return Err(self.malformed("file ends inside a multi-part record"));
                }
                return Ok(None);
            };

            match (flag, in_multipart) {
                (Continuation::Whole, false) => {
                    self.read_part(len, &mut payload)?;
                    break;
                }
                (Continuation::First, false) => {
                    self.read_part(len, &mut payload)?;
                    in_multipart = true;
                }
                (Continuation::Middle, true) => {
                    payload.extend_from_slice(&MAGIC.to_le_bytes());
                    self.read_part(len, &mut payload)?;
                }
                (Continuation::Last, true) => {
                    payload.extend_from_slice(&MAGIC.to_le_bytes());
                    self.read_part(len, &mut payload)?;
                    break;
                }
                (flag, _) => {
                    return Err(self.malformed(format!(
                        "unexpected continuation flag {flag:?} in record {}",
                        self.records_read
                    )))
                }
            }
        }

        self.records_read += 1;
        log::trace!(
            "Read record {} of {} ({} bytes)",
            self.records_read - 1,
            self.source_id,
            payload.len()
        );
        Ok(Some(payload))
    }

    fn read_header(&mut self) -> Result<Option<(Continuation, usize)>> {
        let mut header = [0u8; 8];
        let filled = self.fill(&mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(self.malformed(format!(
                "truncated record header ({filled} of 8 bytes)"
            )));
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC {
            return Err(self.malformed(format!(
                "bad magic {magic:#010x} at record {}",
                self.records_read
            )));
        }

        let lrecord = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let flag = Continuation::try_from((lrecord >> LENGTH_BITS) as u8)
            .map_err(|e| self.malformed(format!("invalid continuation flag {}", e.number)))?;
        Ok(Some((flag, (lrecord & LENGTH_MASK) as usize)))
    }

    fn read_part(&mut self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        // the declared length is untrusted, so the buffer grows with the data
        let filled = (&mut self.reader)
            .take(len as u64)
            .read_to_end(out)
            .map_err(|error| Error::Io {
                source_id: self.source_id.clone(),
                error,
            })?;
        if filled < len {
            return Err(self.malformed(format!(
                "record length {len} exceeds the {filled} remaining bytes"
            )));
        }

        let mut pad = [0u8; 3];
        let pad = &mut pad[..padding(len)];
        if self.fill(pad)? < pad.len() {
            return Err(self.malformed("truncated record padding"));
        }
        Ok(())
    }

    /// Read until `buf` is full or the input ends; returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(Error::Io {
                        source_id: self.source_id.clone(),
                        error,
                    })
                }
            }
        }
        Ok(filled)
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> Error {
        Error::container(&self.source_id, reason)
    }
}

/// Label and id metadata stored in front of each image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecordHeader {
    pub label: Vec<f32>,
    pub id: u64,
    pub id2: u64,
}

impl ImageRecordHeader {
    pub fn new(label: f32, id: u64) -> Self {
        Self {
            label: vec![label],
            id,
            id2: 0,
        }
    }

    /// Split an image record payload into its header and the image bytes.
    pub fn parse(payload: &[u8]) -> Option<(Self, &[u8])> {
        let header = payload.get(..IMAGE_HEADER_LEN)?;
        let word = |i: usize| [header[i], header[i + 1], header[i + 2], header[i + 3]];

        let flag = u32::from_le_bytes(word(0)) as usize;
        let label = f32::from_le_bytes(word(4));
        let id = u64::from_le_bytes(header[8..16].try_into().ok()?);
        let id2 = u64::from_le_bytes(header[16..24].try_into().ok()?);

        let rest = &payload[IMAGE_HEADER_LEN..];
        let (label, image) = if flag == 0 {
            (vec![label], rest)
        } else {
            let labels_len = flag.checked_mul(4)?;
            let labels = rest.get(..labels_len)?;
            let labels = labels
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            (labels, &rest[labels_len..])
        };

        Some((Self { label, id, id2 }, image))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let (flag, label) = match self.label.as_slice() {
            [single] => (0u32, *single),
            labels => (labels.len() as u32, 0.0),
        };
        out.extend_from_slice(&flag.to_le_bytes());
        out.extend_from_slice(&label.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.id2.to_le_bytes());
        if flag > 0 {
            for l in &self.label {
                out.extend_from_slice(&l.to_le_bytes());
            }
        }
    }
}

/// Writes records in the framing [`RecordReader`] understands.
pub struct RecordWriter<W: Write> {
    writer: W,
    target_id: String,
    records_written: usize,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W, target_id: impl Into<String>) -> Self {
        Self {
            writer,
            target_id: target_id.into(),
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> usize {
        self.records_written
    }

    pub fn write_image(&mut self, header: &ImageRecordHeader, image: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(IMAGE_HEADER_LEN + image.len());
        header.write_to(&mut payload);
        payload.extend_from_slice(image);
        self.write_record(&payload)
    }

    pub fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        let parts = split_on_magic(payload);
        let last = parts.len() - 1;

        for (i, part) in parts.iter().enumerate() {
            let flag = match (i, last) {
                (0, 0) => Continuation::Whole,
                (0, _) => Continuation::First,
                (i, last) if i == last => Continuation::Last,
                _ => Continuation::Middle,
            };
            self.write_part(flag, part)?;
        }

        self.records_written += 1;
        Ok(())
    }

    fn write_part(&mut self, flag: Continuation, part: &[u8]) -> Result<()> {
        if part.len() > LENGTH_MASK as usize {
            return Err(Error::container(
                &self.target_id,
                format!("record part of {} bytes is too large", part.len()),
            ));
        }

        let lrecord = (u32::from(u8::from(flag)) << LENGTH_BITS) | part.len() as u32;
        let io = |error| Error::Io {
            source_id: self.target_id.clone(),
            error,
        };

        self.writer.write_all(&MAGIC.to_le_bytes()).map_err(io)?;
        self.writer.write_all(&lrecord.to_le_bytes()).map_err(io)?;
        self.writer.write_all(part).map_err(io)?;
        self.writer
            .write_all(&[0u8; 3][..padding(part.len())])
            .map_err(io)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush().map_err(|error| Error::Io {
            source_id: self.target_id.clone(),
            error,
        })?;
        Ok(self.writer)
    }
}

/// Split at every 4-byte aligned occurrence of the magic word, dropping it.
fn split_on_magic(payload: &[u8]) -> Vec<&[u8]> {
    let magic = MAGIC.to_le_bytes();
    let mut parts = Vec::new();
    let mut start = 0;

    for offset in (0..payload.len() / 4).map(|i| i * 4) {
        if payload[offset..offset + 4] == magic {
            parts.push(&payload[start..offset]);
            start = offset + 4;
        }
    }
    parts.push(&payload[start..]);
    parts
}
