use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::registers::AccessKind;

/// Largest register count a single read may ask for.
pub const MAX_SAFE_READ_COUNT: u16 = 123;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

/// A modbus operation. Addresses are the 0-based protocol addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read { access: AccessKind, address: u16, count: u16 },
    WriteHolding { address: u16, value: u16 },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::Read { access, .. } => access.function_code(),
            Operation::WriteHolding { .. } => 6,
        }
    }

    fn pdu(&self) -> [u8; 5] {
        let (a, b) = match *self {
            Operation::Read { address, count, .. } => (address, count),
            Operation::WriteHolding { address, value } => (address, value),
        };
        let [a0, a1] = a.to_be_bytes();
        let [b0, b1] = b.to_be_bytes();
        [self.function_code(), a0, a1, b0, b1]
    }
}

#[derive(Debug)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::Registers { values: _ } => None,
            ResponseKind::WroteHolding { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(6)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    /// Big-endian register words, two bytes per register.
    Registers { values: Vec<u8> },
    WroteHolding { address: u16, value: u16 },
}

impl ResponseKind {
    /// Split register data into words.
    pub fn words(values: &[u8]) -> impl Iterator<Item = u16> + '_ {
        values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]]))
    }
}

pub trait Codec:
    for<'a> Encoder<&'a Request, Error = std::io::Error>
    + Decoder<Item = Response, Error = std::io::Error>
{
}

fn decode_pdu(function_code: u8, data: &[u8]) -> Option<ResponseKind> {
    if function_code > 0x80 {
        return Some(ResponseKind::ErrorCode(*data.first()?));
    }
    match function_code {
        3 | 4 => {
            let (&byte_count, values) = data.split_first()?;
            let values = values.get(..usize::from(byte_count))?;
            Some(ResponseKind::Registers { values: values.to_vec() })
        }
        6 => {
            let [a, b, c, d, ..] = data else { return None };
            Some(ResponseKind::WroteHolding {
                address: u16::from_be_bytes([*a, *b]),
                value: u16::from_be_bytes([*c, *d]),
            })
        }
        _ => None,
    }
}

pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend(req.transaction_id.to_be_bytes());
        dst.extend(&[0, 0, 0, 6, req.device_id]);
        dst.extend(req.operation.pdu());
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message="attempt at decoding", buffer=?src);
            if src.len() < 8 {
                return Ok(None);
            }
            let Some((tr_id_buffer, remainder)) = src.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes(*tr_id_buffer);
            let Some((proto_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            if u16::from_be_bytes(*proto_buffer) != 0 {
                src.advance(1);
                continue;
            }
            let Some((length_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let required_length = u16::from_be_bytes(*length_buffer);
            let Some((data, _)) = remainder.split_at_checked(required_length.into()) else {
                return Ok(None);
            };
            let [device_id, function_code, pdu @ ..] = data else {
                src.advance(1);
                continue;
            };
            let (device_id, function_code) = (*device_id, *function_code);
            let Some(kind) = decode_pdu(function_code, pdu) else {
                src.advance(1);
                continue;
            };
            src.advance(usize::from(required_length) + 6);
            return Ok(Some(Response { transaction_id, device_id, kind }));
        }
    }
}

impl Codec for ModbusTCPCodec {}

/// Modbus RTU framing as used over a serial line.
///
/// RTU frames carry no transaction ID. Since only one request is ever outstanding, the
/// response is attributed to the most recently encoded request.
#[derive(Default)]
pub struct ModbusRTUCodec {
    last_transaction_id: u16,
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.extend([req.device_id]);
        dst.extend(req.operation.pdu());
        let crc = crc16(&dst[start..]);
        dst.extend(crc.to_le_bytes());
        self.last_transaction_id = req.transaction_id;
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message="attempt at decoding", buffer=?src);
        let [device_id, function_code, third, ..] = src[..] else {
            return Ok(None);
        };
        let frame_length = match function_code {
            f if f > 0x80 => 5,
            3 | 4 => 5 + usize::from(third),
            6 => 8,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected function code {function_code} in RTU response"),
                ));
            }
        };
        if src.len() < frame_length {
            return Ok(None);
        }
        let (body, crc) = src[..frame_length].split_at(frame_length - 2);
        if crc16(body) != u16::from_le_bytes([crc[0], crc[1]]) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "RTU response failed the CRC check",
            ));
        }
        let kind = decode_pdu(function_code, &body[2..]).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed RTU response")
        })?;
        src.advance(frame_length);
        Ok(Some(Response { device_id, transaction_id: self.last_transaction_id, kind }))
    }
}

impl Codec for ModbusRTUCodec {}

/// Either of the framings, chosen at runtime from the connection arguments.
pub enum AnyCodec {
    Tcp(ModbusTCPCodec),
    Rtu(ModbusRTUCodec),
}

impl Encoder<&Request> for AnyCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            AnyCodec::Tcp(c) => c.encode(req, dst),
            AnyCodec::Rtu(c) => c.encode(req, dst),
        }
    }
}

impl Decoder for AnyCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            AnyCodec::Tcp(c) => c.decode(src),
            AnyCodec::Rtu(c) => c.decode(src),
        }
    }
}

impl Codec for AnyCodec {}
