use crate::error::{Result, SpiceError};
use crate::protocol::{SpiceDataHeader, SpicePoint, SpicePoint16, SpiceRect, SPICE_DATA_HEADER_SIZE};
use crate::transport::TransportReader;
use binrw::{BinRead, BinWrite};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;

/// Serialize a fixed-layout protocol structure.
pub fn to_wire<T>(value: &T) -> Result<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    value
        .write_le(&mut cursor)
        .map_err(|e| SpiceError::Protocol(format!("encode failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// Deserialize a fixed-layout protocol structure from the front of `data`.
pub fn from_wire<T>(data: &[u8]) -> Result<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(data);
    T::read_le(&mut cursor).map_err(|e| SpiceError::Protocol(format!("decode failed: {e}")))
}

/// Helper trait for writing primitive types to buffers
pub trait WriteWire {
    fn write_u8(&mut self, val: u8);
    fn write_u16_le(&mut self, val: u16);
    fn write_u32_le(&mut self, val: u32);
    fn write_i32_le(&mut self, val: i32);
    fn write_u64_le(&mut self, val: u64);
    fn write_bytes(&mut self, bytes: &[u8]);
    fn write_rect(&mut self, rect: &SpiceRect);
}

impl WriteWire for Vec<u8> {
    fn write_u8(&mut self, val: u8) {
        self.push(val);
    }

    fn write_u16_le(&mut self, val: u16) {
        self.extend_from_slice(&val.to_le_bytes());
    }

    fn write_u32_le(&mut self, val: u32) {
        self.extend_from_slice(&val.to_le_bytes());
    }

    fn write_i32_le(&mut self, val: i32) {
        self.extend_from_slice(&val.to_le_bytes());
    }

    fn write_u64_le(&mut self, val: u64) {
        self.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }

    fn write_rect(&mut self, rect: &SpiceRect) {
        self.write_i32_le(rect.top);
        self.write_i32_le(rect.left);
        self.write_i32_le(rect.bottom);
        self.write_i32_le(rect.right);
    }
}

/// Helper functions for reading from byte slices at absolute offsets
pub trait ReadWire {
    fn read_u8(&self, offset: usize) -> Result<u8>;
    fn read_u16_le(&self, offset: usize) -> Result<u16>;
    fn read_u32_le(&self, offset: usize) -> Result<u32>;
    fn read_u64_le(&self, offset: usize) -> Result<u64>;
    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]>;
}

fn short_buffer(what: &str, offset: usize, len: usize) -> SpiceError {
    SpiceError::Protocol(format!("buffer too small for {what} at offset {offset} (len {len})"))
}

impl ReadWire for [u8] {
    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.get(offset)
            .copied()
            .ok_or_else(|| short_buffer("u8", offset, self.len()))
    }

    fn read_u16_le(&self, offset: usize) -> Result<u16> {
        let bytes = self.read_bytes(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32_le(&self, offset: usize) -> Result<u32> {
        let bytes = self.read_bytes(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64_le(&self, offset: usize) -> Result<u64> {
        let bytes = self.read_bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| short_buffer("bytes", offset, self.len()))?;
        self.get(offset..end)
            .ok_or_else(|| short_buffer("bytes", offset, self.len()))
    }
}

/// Sequential, bounds-checked reader over a message body.
///
/// SPICE embeds pointers as 32-bit offsets from the start of the message
/// body; [`WireReader::at`] opens a second reader at such an offset.
#[derive(Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// A reader over the same body positioned at `offset`.
    pub fn at(&self, offset: u32) -> Result<WireReader<'a>> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(short_buffer("pointer", offset, self.data.len()));
        }
        Ok(WireReader {
            data: self.data,
            pos: offset,
        })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn u8(&mut self) -> Result<u8> {
        let v = self.data.read_u8(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let v = self.data.read_u16_le(self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = self.data.read_u32_le(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let v = self.data.read_u64_le(self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let data: &'a [u8] = self.data;
        let v = data.read_bytes(self.pos, len)?;
        self.pos += len;
        Ok(v)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        let start = self.pos.min(data.len());
        self.pos = data.len();
        &data[start..]
    }

    pub fn rect(&mut self) -> Result<SpiceRect> {
        Ok(SpiceRect {
            top: self.i32()?,
            left: self.i32()?,
            bottom: self.i32()?,
            right: self.i32()?,
        })
    }

    pub fn point(&mut self) -> Result<SpicePoint> {
        Ok(SpicePoint {
            x: self.i32()?,
            y: self.i32()?,
        })
    }

    pub fn point16(&mut self) -> Result<SpicePoint16> {
        Ok(SpicePoint16 {
            x: self.i16()?,
            y: self.i16()?,
        })
    }
}

/// One inbound in-session message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub header: SpiceDataHeader,
    pub body: Bytes,
}

impl InboundMessage {
    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }
}

/// Read one framed message. The declared size is checked against
/// `max_size` before any body buffer is allocated.
pub async fn read_message(reader: &mut TransportReader, max_size: u32) -> Result<InboundMessage> {
    let mut header_buf = [0u8; SPICE_DATA_HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header: SpiceDataHeader = from_wire(&header_buf)?;

    if header.msg_size > max_size {
        return Err(SpiceError::Protocol(format!(
            "message type {} declares {} bytes, limit is {}",
            header.msg_type, header.msg_size, max_size
        )));
    }

    let mut body = BytesMut::zeroed(header.msg_size as usize);
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }

    Ok(InboundMessage {
        header,
        body: body.freeze(),
    })
}

/// Frame an outbound message with the data header.
pub fn encode_message(serial: u64, msg_type: u16, body: &[u8]) -> Result<Vec<u8>> {
    let header = SpiceDataHeader {
        serial,
        msg_type,
        msg_size: body.len() as u32,
        sub_list: 0,
    };
    let mut out = to_wire(&header)?;
    out.extend_from_slice(body);
    Ok(out)
}
