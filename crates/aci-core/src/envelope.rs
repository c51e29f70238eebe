//! Multipart binary envelope (DIME) used for call parameters, results, files
//! and captured service state.
//!
//! Each record is a 12-byte big-endian header followed by its option, id,
//! type and payload fields, each zero-padded to a 4-byte boundary:
//!
//! ```text
//! [ver(5)|MB|ME|CF][TNF(4)|rsv(4)][opt_len u16][id_len u16][type_len u16][data_len u32]
//! [option..pad][id..pad][type..pad][payload..pad]
//! ```
//!
//! The first record carries the MB flag and the last one the ME flag. An
//! envelope without records encodes to zero bytes.

use crate::{AciError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Record type of an invocation's parameter block.
pub const INVOKE_REQUEST_TYPE: &str = "binary_invoke_request";
/// Record type of an invocation's return value.
pub const OBJECT_TYPE: &str = "object";
/// Record type of a deployment archive.
pub const FILE_TYPE: &str = "file";
/// Record type of a captured service state.
pub const SERVICE_STATE_TYPE: &str = "service_state";

const HEADER_LEN: usize = 12;
const VERSION: u8 = 1;
const FLAG_MB: u8 = 0x04;
const FLAG_ME: u8 = 0x02;
const FLAG_CF: u8 = 0x01;
const TNF_MEDIA_TYPE: u8 = 0x10;

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn envelope_error(message: impl Into<String>) -> AciError {
    AciError::Envelope {
        message: message.into(),
    }
}

/// One record of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvelopeRecord {
    pub id: String,
    pub record_type: String,
    pub option: String,
    pub payload: Bytes,
}

impl EnvelopeRecord {
    pub fn new(
        id: impl Into<String>,
        record_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            option: String::new(),
            payload: payload.into(),
        }
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.option = option.into();
        self
    }

    /// Bytes this record occupies on the wire, header and padding included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + padded(self.option.len())
            + padded(self.id.len())
            + padded(self.record_type.len())
            + padded(self.payload.len())
    }
}

/// Parsed fixed-size record header.
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    flags: u8,
    option_len: usize,
    id_len: usize,
    type_len: usize,
    data_len: usize,
}

impl RecordHeader {
    fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut buf = &raw[..];
        let first = buf.get_u8();
        let version = first >> 3;
        if version != VERSION {
            return Err(envelope_error(format!(
                "unsupported record version {}",
                version
            )));
        }
        let flags = first & 0x07;
        if flags & FLAG_CF != 0 {
            return Err(envelope_error("chunked records are not supported"));
        }
        let _type_format = buf.get_u8();
        Ok(Self {
            flags,
            option_len: buf.get_u16() as usize,
            id_len: buf.get_u16() as usize,
            type_len: buf.get_u16() as usize,
            data_len: buf.get_u32() as usize,
        })
    }

    fn is_begin(&self) -> bool {
        self.flags & FLAG_MB != 0
    }

    fn is_end(&self) -> bool {
        self.flags & FLAG_ME != 0
    }

    fn body_len(&self) -> usize {
        padded(self.option_len) + padded(self.id_len) + padded(self.type_len) + padded(self.data_len)
    }

    /// Split a body buffer into the record's fields.
    fn read_record(&self, mut body: Bytes) -> Result<EnvelopeRecord> {
        let option = take_text(&mut body, self.option_len, "option")?;
        let id = take_text(&mut body, self.id_len, "id")?;
        let record_type = take_text(&mut body, self.type_len, "type")?;
        let payload = body.split_to(self.data_len);
        Ok(EnvelopeRecord {
            id,
            record_type,
            option,
            payload,
        })
    }
}

fn take_text(body: &mut Bytes, len: usize, field: &str) -> Result<String> {
    let raw = body.split_to(padded(len));
    String::from_utf8(raw[..len].to_vec())
        .map_err(|_| envelope_error(format!("record {} is not valid UTF-8", field)))
}

/// An ordered sequence of records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    records: Vec<EnvelopeRecord>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<EnvelopeRecord>) -> Self {
        Self { records }
    }

    /// An envelope holding one record of the given type.
    pub fn single(
        record_type: impl Into<String>,
        id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::from_records(vec![EnvelopeRecord::new(id, record_type, payload)])
    }

    pub fn push(&mut self, record: EnvelopeRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EnvelopeRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<EnvelopeRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record with the given type.
    pub fn find(&self, record_type: &str) -> Option<&EnvelopeRecord> {
        self.records.iter().find(|r| r.record_type == record_type)
    }

    /// Total wire length: the sum of every record's header and padded fields.
    pub fn encoded_len(&self) -> usize {
        self.records.iter().map(EnvelopeRecord::encoded_len).sum()
    }

    /// Encode the records in order.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let last = self.records.len().saturating_sub(1);

        for (index, record) in self.records.iter().enumerate() {
            let mut flags = 0;
            if index == 0 {
                flags |= FLAG_MB;
            }
            if index == last {
                flags |= FLAG_ME;
            }

            buf.put_u8((VERSION << 3) | flags);
            buf.put_u8(TNF_MEDIA_TYPE);
            buf.put_u16(field_len_u16(&record.option, "option")?);
            buf.put_u16(field_len_u16(&record.id, "id")?);
            buf.put_u16(field_len_u16(&record.record_type, "type")?);
            let data_len = u32::try_from(record.payload.len())
                .map_err(|_| envelope_error("record payload exceeds 4GB"))?;
            buf.put_u32(data_len);

            put_padded(&mut buf, record.option.as_bytes());
            put_padded(&mut buf, record.id.as_bytes());
            put_padded(&mut buf, record.record_type.as_bytes());
            put_padded(&mut buf, &record.payload);
        }

        Ok(buf.freeze())
    }

    /// Decode an envelope from a complete buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let mut records = Vec::new();

        while buf.has_remaining() {
            let header = next_header(&mut buf, records.is_empty())?;
            let body_len = header.body_len();
            if buf.remaining() < body_len {
                return Err(envelope_error(format!(
                    "record {} truncated: need {} bytes, have {}",
                    records.len(),
                    body_len,
                    buf.remaining()
                )));
            }
            records.push(header.read_record(buf.split_to(body_len))?);

            if header.is_end() {
                if buf.has_remaining() {
                    return Err(envelope_error(format!(
                        "{} trailing bytes after the last record",
                        buf.remaining()
                    )));
                }
                return Ok(Self { records });
            }
        }

        if records.is_empty() {
            Ok(Self { records })
        } else {
            Err(envelope_error("envelope ended without a final record"))
        }
    }

    /// Count the records in an encoded envelope by walking headers only.
    pub fn record_count(bytes: &[u8]) -> Result<usize> {
        let mut buf = bytes;
        let mut count = 0;

        while buf.has_remaining() {
            let header = next_header(&mut buf, count == 0)?;
            let body_len = header.body_len();
            if buf.remaining() < body_len {
                return Err(envelope_error(format!("record {} truncated", count)));
            }
            buf.advance(body_len);
            count += 1;
            if header.is_end() {
                break;
            }
        }

        Ok(count)
    }

    /// Decode an envelope from a stream, stopping after the final record.
    ///
    /// A stream that ends before the first header yields an empty envelope.
    /// Malformed records are reported as `InvalidData`.
    pub async fn read_from<R>(reader: &mut R, max_size: usize) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut records = Vec::new();
        let mut total = 0usize;

        loop {
            let mut raw = [0u8; HEADER_LEN];
            if reader.read(&mut raw[..1]).await? == 0 {
                if records.is_empty() {
                    return Ok(Self { records });
                }
                return Err(invalid_data("envelope ended without a final record"));
            }
            reader.read_exact(&mut raw[1..]).await?;

            let header = RecordHeader::parse(&raw).map_err(to_invalid_data)?;
            check_begin_flag(&header, records.is_empty()).map_err(to_invalid_data)?;

            let body_len = header.body_len();
            total += HEADER_LEN + body_len;
            if total > max_size {
                return Err(invalid_data(format!(
                    "envelope exceeds maximum size of {} bytes",
                    max_size
                )));
            }

            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body).await?;
            records.push(
                header
                    .read_record(Bytes::from(body))
                    .map_err(to_invalid_data)?,
            );

            if header.is_end() {
                return Ok(Self { records });
            }
        }
    }
}

fn next_header<B: Buf>(buf: &mut B, first: bool) -> Result<RecordHeader> {
    if buf.remaining() < HEADER_LEN {
        return Err(envelope_error(format!(
            "truncated record header: {} bytes",
            buf.remaining()
        )));
    }
    let mut raw = [0u8; HEADER_LEN];
    buf.copy_to_slice(&mut raw);
    let header = RecordHeader::parse(&raw)?;
    check_begin_flag(&header, first)?;
    Ok(header)
}

fn check_begin_flag(header: &RecordHeader, first: bool) -> Result<()> {
    if header.is_begin() != first {
        return Err(envelope_error(if first {
            "first record is missing the begin flag"
        } else {
            "begin flag set on a record after the first"
        }));
    }
    Ok(())
}

fn field_len_u16(field: &str, name: &str) -> Result<u16> {
    u16::try_from(field.len())
        .map_err(|_| envelope_error(format!("record {} exceeds 65535 bytes", name)))
}

fn put_padded(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(data);
    buf.put_bytes(0, padded(data.len()) - data.len());
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn to_invalid_data(err: AciError) -> io::Error {
    invalid_data(err.to_string())
}
