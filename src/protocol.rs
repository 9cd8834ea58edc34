/// Modbus protocol definitions for the server side
///
/// Request PDU parsing and response PDU encoding shared by the TCP, RTU and
/// ASCII engines. A PDU is the function byte plus its body; transport
/// framing (MBAP, CRC, LRC) stays in the engines.

use std::fmt;

use crate::error::ExceptionCode;
use crate::memory::{pack_bools, unpack_bools};

/// Modbus unit/slave identifier (0 = broadcast when enabled)
pub type UnitId = u8;

/// Function codes answered by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Read Exception Status (0x07)
    ReadExceptionStatus = 0x07,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl ServerFunction {
    /// Convert from the wire function code
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ServerFunction::ReadCoils),
            0x02 => Some(ServerFunction::ReadDiscreteInputs),
            0x03 => Some(ServerFunction::ReadHoldingRegisters),
            0x04 => Some(ServerFunction::ReadInputRegisters),
            0x05 => Some(ServerFunction::WriteSingleCoil),
            0x06 => Some(ServerFunction::WriteSingleRegister),
            0x07 => Some(ServerFunction::ReadExceptionStatus),
            0x0F => Some(ServerFunction::WriteMultipleCoils),
            0x10 => Some(ServerFunction::WriteMultipleRegisters),
            0x11 => Some(ServerFunction::ReportServerId),
            0x16 => Some(ServerFunction::MaskWriteRegister),
            0x17 => Some(ServerFunction::ReadWriteMultipleRegisters),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Write functions are the ones a broadcast request fans out
    pub fn is_broadcast_write(self) -> bool {
        matches!(
            self,
            ServerFunction::WriteSingleCoil
                | ServerFunction::WriteSingleRegister
                | ServerFunction::WriteMultipleCoils
                | ServerFunction::WriteMultipleRegisters
                | ServerFunction::MaskWriteRegister
        )
    }
}

impl fmt::Display for ServerFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerFunction::ReadCoils => "Read Coils",
            ServerFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ServerFunction::ReadHoldingRegisters => "Read Holding Registers",
            ServerFunction::ReadInputRegisters => "Read Input Registers",
            ServerFunction::WriteSingleCoil => "Write Single Coil",
            ServerFunction::WriteSingleRegister => "Write Single Register",
            ServerFunction::ReadExceptionStatus => "Read Exception Status",
            ServerFunction::WriteMultipleCoils => "Write Multiple Coils",
            ServerFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ServerFunction::ReportServerId => "Report Server ID",
            ServerFunction::MaskWriteRegister => "Mask Write Register",
            ServerFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// An exception reply: original function code plus exception code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionReply {
    pub function: u8,
    pub code: ExceptionCode,
}

impl ExceptionReply {
    pub fn new(function: u8, code: ExceptionCode) -> Self {
        Self { function, code }
    }
}

/// A parsed request PDU
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadCoils { addr: u16, count: u16 },
    ReadDiscreteInputs { addr: u16, count: u16 },
    ReadHoldingRegisters { addr: u16, count: u16 },
    ReadInputRegisters { addr: u16, count: u16 },
    WriteSingleCoil { addr: u16, value: bool },
    WriteSingleRegister { addr: u16, value: u16 },
    ReadExceptionStatus,
    WriteMultipleCoils { addr: u16, values: Vec<bool> },
    WriteMultipleRegisters { addr: u16, values: Vec<u16> },
    ReportServerId,
    MaskWriteRegister { addr: u16, and_mask: u16, or_mask: u16 },
    ReadWriteMultipleRegisters {
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        values: Vec<u16>,
    },
}

impl Request {
    /// The function code this request arrived as
    pub fn function(&self) -> ServerFunction {
        match self {
            Request::ReadCoils { .. } => ServerFunction::ReadCoils,
            Request::ReadDiscreteInputs { .. } => ServerFunction::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => ServerFunction::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => ServerFunction::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => ServerFunction::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => ServerFunction::WriteSingleRegister,
            Request::ReadExceptionStatus => ServerFunction::ReadExceptionStatus,
            Request::WriteMultipleCoils { .. } => ServerFunction::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => ServerFunction::WriteMultipleRegisters,
            Request::ReportServerId => ServerFunction::ReportServerId,
            Request::MaskWriteRegister { .. } => ServerFunction::MaskWriteRegister,
            Request::ReadWriteMultipleRegisters { .. } => {
                ServerFunction::ReadWriteMultipleRegisters
            }
        }
    }

    /// Parse a request PDU
    ///
    /// Structural validation only: function code known, body lengths and
    /// byte counts consistent, the single-coil value well formed. Quantity
    /// quotas and address bounds belong to the device.
    pub fn parse(pdu: &[u8]) -> Result<Request, ExceptionReply> {
        let (fc_byte, body) = match pdu.split_first() {
            Some(split) => split,
            None => {
                return Err(ExceptionReply::new(0, ExceptionCode::IllegalFunction));
            }
        };
        let function = ServerFunction::from_u8(*fc_byte)
            .ok_or(ExceptionReply::new(*fc_byte, ExceptionCode::IllegalFunction))?;
        let malformed = ExceptionReply::new(*fc_byte, ExceptionCode::IllegalDataValue);

        let req = match function {
            ServerFunction::ReadCoils
            | ServerFunction::ReadDiscreteInputs
            | ServerFunction::ReadHoldingRegisters
            | ServerFunction::ReadInputRegisters => {
                if body.len() != 4 {
                    return Err(malformed);
                }
                let addr = u16::from_be_bytes([body[0], body[1]]);
                let count = u16::from_be_bytes([body[2], body[3]]);
                match function {
                    ServerFunction::ReadCoils => Request::ReadCoils { addr, count },
                    ServerFunction::ReadDiscreteInputs => {
                        Request::ReadDiscreteInputs { addr, count }
                    }
                    ServerFunction::ReadHoldingRegisters => {
                        Request::ReadHoldingRegisters { addr, count }
                    }
                    _ => Request::ReadInputRegisters { addr, count },
                }
            }
            ServerFunction::WriteSingleCoil => {
                if body.len() != 4 {
                    return Err(malformed);
                }
                let addr = u16::from_be_bytes([body[0], body[1]]);
                let value = match u16::from_be_bytes([body[2], body[3]]) {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(malformed),
                };
                Request::WriteSingleCoil { addr, value }
            }
            ServerFunction::WriteSingleRegister => {
                if body.len() != 4 {
                    return Err(malformed);
                }
                Request::WriteSingleRegister {
                    addr: u16::from_be_bytes([body[0], body[1]]),
                    value: u16::from_be_bytes([body[2], body[3]]),
                }
            }
            ServerFunction::ReadExceptionStatus => {
                if !body.is_empty() {
                    return Err(malformed);
                }
                Request::ReadExceptionStatus
            }
            ServerFunction::WriteMultipleCoils => {
                if body.len() < 5 {
                    return Err(malformed);
                }
                let addr = u16::from_be_bytes([body[0], body[1]]);
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                let byte_count = body[4] as usize;
                if count == 0 || byte_count != (count + 7) / 8 || body.len() != 5 + byte_count {
                    return Err(malformed);
                }
                Request::WriteMultipleCoils {
                    addr,
                    values: unpack_bools(&body[5..], count),
                }
            }
            ServerFunction::WriteMultipleRegisters => {
                if body.len() < 5 {
                    return Err(malformed);
                }
                let addr = u16::from_be_bytes([body[0], body[1]]);
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                let byte_count = body[4] as usize;
                if count == 0 || byte_count != count * 2 || body.len() != 5 + byte_count {
                    return Err(malformed);
                }
                Request::WriteMultipleRegisters {
                    addr,
                    values: be_bytes_to_regs(&body[5..]),
                }
            }
            ServerFunction::ReportServerId => {
                if !body.is_empty() {
                    return Err(malformed);
                }
                Request::ReportServerId
            }
            ServerFunction::MaskWriteRegister => {
                if body.len() != 6 {
                    return Err(malformed);
                }
                Request::MaskWriteRegister {
                    addr: u16::from_be_bytes([body[0], body[1]]),
                    and_mask: u16::from_be_bytes([body[2], body[3]]),
                    or_mask: u16::from_be_bytes([body[4], body[5]]),
                }
            }
            ServerFunction::ReadWriteMultipleRegisters => {
                if body.len() < 9 {
                    return Err(malformed);
                }
                let read_addr = u16::from_be_bytes([body[0], body[1]]);
                let read_count = u16::from_be_bytes([body[2], body[3]]);
                let write_addr = u16::from_be_bytes([body[4], body[5]]);
                let write_count = u16::from_be_bytes([body[6], body[7]]) as usize;
                let byte_count = body[8] as usize;
                if write_count == 0 || byte_count != write_count * 2 || body.len() != 9 + byte_count
                {
                    return Err(malformed);
                }
                Request::ReadWriteMultipleRegisters {
                    read_addr,
                    read_count,
                    write_addr,
                    values: be_bytes_to_regs(&body[9..]),
                }
            }
        };
        Ok(req)
    }
}

/// A response PDU ready for framing
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Packed bit read reply (0x01/0x02)
    Bits { function: ServerFunction, bits: Vec<bool> },
    /// Register read reply (0x03/0x04/0x17)
    Registers { function: ServerFunction, regs: Vec<u16> },
    /// Address/value echo (0x05/0x06 and the quantity echo of 0x0F/0x10)
    Echo { function: ServerFunction, addr: u16, value: u16 },
    /// Exception status byte (0x07)
    ExceptionStatus(u8),
    /// Server id plus run indicator (0x11)
    ServerId(Vec<u8>),
    /// Mask write echo (0x16)
    MaskWrite { addr: u16, and_mask: u16, or_mask: u16 },
    /// Exception reply for any function
    Exception(ExceptionReply),
}

impl Response {
    /// Build the exception reply for a failed request
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Response::Exception(ExceptionReply::new(function, code))
    }

    /// True when this is an exception reply
    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception(_))
    }

    /// Encode into PDU bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Bits { function, bits } => {
                let packed = pack_bools(bits);
                let mut pdu = Vec::with_capacity(2 + packed.len());
                pdu.push(function.to_u8());
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
                pdu
            }
            Response::Registers { function, regs } => {
                let mut pdu = Vec::with_capacity(2 + regs.len() * 2);
                pdu.push(function.to_u8());
                pdu.push((regs.len() * 2) as u8);
                pdu.extend_from_slice(&regs_to_be_bytes(regs));
                pdu
            }
            Response::Echo { function, addr, value } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(function.to_u8());
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
                pdu
            }
            Response::ExceptionStatus(status) => {
                vec![ServerFunction::ReadExceptionStatus.to_u8(), *status]
            }
            Response::ServerId(id) => {
                // Byte count covers the id and the run indicator
                let mut pdu = Vec::with_capacity(3 + id.len());
                pdu.push(ServerFunction::ReportServerId.to_u8());
                pdu.push((id.len() + 1) as u8);
                pdu.extend_from_slice(id);
                pdu.push(0xFF);
                pdu
            }
            Response::MaskWrite { addr, and_mask, or_mask } => {
                let mut pdu = Vec::with_capacity(7);
                pdu.push(ServerFunction::MaskWriteRegister.to_u8());
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&and_mask.to_be_bytes());
                pdu.extend_from_slice(&or_mask.to_be_bytes());
                pdu
            }
            Response::Exception(reply) => {
                vec![reply.function | 0x80, reply.code.to_u8()]
            }
        }
    }
}

/// Convert register values to big-endian wire bytes
pub fn regs_to_be_bytes(regs: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    for &r in regs {
        bytes.extend_from_slice(&r.to_be_bytes());
    }
    bytes
}

/// Convert big-endian wire bytes to register values (odd trailing byte
/// dropped)
pub fn be_bytes_to_regs(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ServerFunction::from_u8(0x03),
            Some(ServerFunction::ReadHoldingRegisters)
        );
        assert_eq!(ServerFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(ServerFunction::from_u8(0x63), None);
    }

    #[test]
    fn test_parse_read_request() {
        let pdu = [0x03, 0x00, 0x10, 0x00, 0x05];
        assert_eq!(
            Request::parse(&pdu).unwrap(),
            Request::ReadHoldingRegisters { addr: 0x10, count: 5 }
        );
        assert_eq!(
            Request::parse(&pdu).unwrap().function(),
            ServerFunction::ReadHoldingRegisters
        );
    }

    #[test]
    fn test_parse_single_coil_value_validation() {
        let on = [0x05, 0x00, 0x02, 0xFF, 0x00];
        assert_eq!(
            Request::parse(&on).unwrap(),
            Request::WriteSingleCoil { addr: 2, value: true }
        );
        let off = [0x05, 0x00, 0x02, 0x00, 0x00];
        assert_eq!(
            Request::parse(&off).unwrap(),
            Request::WriteSingleCoil { addr: 2, value: false }
        );
        let bad = [0x05, 0x00, 0x02, 0x12, 0x34];
        let err = Request::parse(&bad).unwrap_err();
        assert_eq!(err.function, 0x05);
        assert_eq!(err.code, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn test_parse_write_multiple() {
        // Ten coils in two bytes
        let pdu = [0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01];
        match Request::parse(&pdu).unwrap() {
            Request::WriteMultipleCoils { addr, values } => {
                assert_eq!(addr, 0x13);
                assert_eq!(values.len(), 10);
                assert_eq!(values[0], true); // 0xCD bit 0
                assert_eq!(values[1], false);
                assert_eq!(values[8], true); // 0x01 bit 0
            }
            other => panic!("unexpected request {:?}", other),
        }

        let pdu = [0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        assert_eq!(
            Request::parse(&pdu).unwrap(),
            Request::WriteMultipleRegisters { addr: 1, values: vec![0x000A, 0x0102] }
        );

        // Byte count disagreeing with the quantity
        let pdu = [0x10, 0x00, 0x01, 0x00, 0x02, 0x03, 0x00, 0x0A, 0x01];
        assert_eq!(
            Request::parse(&pdu).unwrap_err().code,
            ExceptionCode::IllegalDataValue
        );
    }

    #[test]
    fn test_parse_mask_write_and_read_write() {
        let pdu = [0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25];
        assert_eq!(
            Request::parse(&pdu).unwrap(),
            Request::MaskWriteRegister { addr: 4, and_mask: 0x00F2, or_mask: 0x0025 }
        );

        let pdu = [
            0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78,
        ];
        assert_eq!(
            Request::parse(&pdu).unwrap(),
            Request::ReadWriteMultipleRegisters {
                read_addr: 3,
                read_count: 6,
                write_addr: 14,
                values: vec![0x1234, 0x5678],
            }
        );
    }

    #[test]
    fn test_parse_unknown_function() {
        let err = Request::parse(&[0x2B, 0x00]).unwrap_err();
        assert_eq!(err.function, 0x2B);
        assert_eq!(err.code, ExceptionCode::IllegalFunction);
    }

    #[test]
    fn test_encode_bit_and_register_responses() {
        let resp = Response::Bits {
            function: ServerFunction::ReadCoils,
            bits: vec![true, false, true, true, false, false, false, false, true],
        };
        assert_eq!(resp.encode(), vec![0x01, 0x02, 0x0D, 0x01]);

        let resp = Response::Registers {
            function: ServerFunction::ReadHoldingRegisters,
            regs: vec![0x1234, 0x5678],
        };
        assert_eq!(resp.encode(), vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_encode_echo_and_exception() {
        let resp = Response::Echo {
            function: ServerFunction::WriteSingleCoil,
            addr: 2,
            value: 0xFF00,
        };
        assert_eq!(resp.encode(), vec![0x05, 0x00, 0x02, 0xFF, 0x00]);

        let resp = Response::exception(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(resp.encode(), vec![0x83, 0x02]);
        assert!(resp.is_exception());
    }

    #[test]
    fn test_encode_server_id_with_run_indicator() {
        let resp = Response::ServerId(b"pump".to_vec());
        assert_eq!(resp.encode(), vec![0x11, 0x05, b'p', b'u', b'm', b'p', 0xFF]);
    }

    #[test]
    fn test_encode_exception_status_and_mask_write() {
        assert_eq!(Response::ExceptionStatus(0xA5).encode(), vec![0x07, 0xA5]);
        let resp = Response::MaskWrite { addr: 4, and_mask: 0xF2, or_mask: 0x25 };
        assert_eq!(
            resp.encode(),
            vec![0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]
        );
    }
}
