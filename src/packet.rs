//! TFTP Protocol (Revision 2)
//! from https://datatracker.ietf.org/doc/html/rfc1350
//!
//! Only the five base packet kinds are understood; option extensions are not.

use crate::error::{Error, Malformed, Result};

/// The max number of bytes sent at a time.
pub const DATA_SIZE: usize = 512;

/// Opcode plus block number (or error code).
pub const META_SIZE: usize = 4;

/// The largest packet either side ever emits: a full DATA block.
pub const PACKET_SIZE: usize = META_SIZE + DATA_SIZE;

/// The only transfer mode this crate speaks.
pub const OCTET: &str = "octet";

enum_with_unknown! {
    /// The five TFTP packet types. 2 bytes in length.
    pub enum Type(u16) {
        /// Read request (RRQ)
        Rrq = 0x1,
        /// Write request (WRQ)
        Wrq = 0x2,
        /// Data (DATA)
        Data = 0x3,
        /// Acknowledgement (ACK)
        Ack = 0x4,
        /// Error (ERROR)
        Error = 0x5
    }
}

enum_with_unknown! {
    /// Error codes carried by ERROR packets.
    pub enum ErrorCode(u16) {
        /// Not defined, see error message (if any).
        NotDefined = 0,
        FileNotFound = 1,
        AccessViolation = 2,
        /// Disk full or allocation exceeded.
        DiskFull = 3,
        IllegalOperation = 4,
        UnknownTransferId = 5,
        FileAlreadyExists = 6,
        NoSuchUser = 7,
    }
}

mod field {
    use core::ops::{Range, RangeFrom};

    pub const OPCODE: Range<usize> = 0..2;
    pub const FILENAME: RangeFrom<usize> = 2..;
    pub const BLOCK: Range<usize> = 2..4;
    pub const CODE: Range<usize> = 2..4;
    pub const DATA: RangeFrom<usize> = 4..;
    pub const MSG: RangeFrom<usize> = 4..;
}

/// A TFTP packet.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Wrap a buffer without validating it. Accessors may panic on short buffers.
    pub const fn new_unchecked(buffer: T) -> Self {
        Packet { buffer }
    }

    /// Wrap a buffer, checking that its length suits the opcode it declares.
    pub fn new_checked(buffer: T) -> Result<Self> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let buf = self.buffer.as_ref();
        let len = buf.len();
        if len < field::OPCODE.end {
            return Err(Malformed::Truncated.into());
        }
        match self.opcode() {
            Type::Rrq | Type::Wrq => {
                let name = &buf[field::FILENAME];
                match memchr(name, 0) {
                    None => Err(Malformed::MissingTerminator.into()),
                    Some(0) => Err(Malformed::EmptyFilename.into()),
                    Some(_) => Ok(()),
                }
            }
            Type::Data if len < META_SIZE => Err(Malformed::Truncated.into()),
            Type::Data if len > PACKET_SIZE => Err(Malformed::Oversized.into()),
            Type::Data => Ok(()),
            Type::Ack if len < META_SIZE => Err(Malformed::Truncated.into()),
            Type::Ack if len > META_SIZE => Err(Malformed::Oversized.into()),
            Type::Ack => Ok(()),
            Type::Error if len < META_SIZE => Err(Malformed::Truncated.into()),
            Type::Error if len > PACKET_SIZE => Err(Malformed::Oversized.into()),
            Type::Error => Ok(()),
            Type::Unknown(op) => Err(Malformed::UnknownOpcode(op).into()),
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the type of the packet.
    pub fn opcode(&self) -> Type {
        read_be_u16(&self.buffer.as_ref()[field::OPCODE]).into()
    }

    /// Reads the block number of a DATA or ACK packet.
    pub fn block(&self) -> u16 {
        read_be_u16(&self.buffer.as_ref()[field::BLOCK])
    }

    pub fn error_code(&self) -> ErrorCode {
        read_be_u16(&self.buffer.as_ref()[field::CODE]).into()
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The filename of a request: the bytes between the opcode and the first NUL.
    pub fn filename(&self) -> &'a [u8] {
        let rest = &self.buffer.as_ref()[field::FILENAME];
        let end = memchr(rest, 0).unwrap_or(rest.len());
        &rest[..end]
    }

    /// The mode of a request, read up to the next NUL or the end of the packet.
    pub fn mode(&self) -> &'a [u8] {
        let rest = &self.buffer.as_ref()[field::FILENAME];
        let start = match memchr(rest, 0) {
            Some(nul) => nul + 1,
            None => return &[],
        };
        until_nul(&rest[start..])
    }

    /// The payload of a DATA packet.
    pub fn data(&self) -> &'a [u8] {
        &self.buffer.as_ref()[field::DATA]
    }

    /// The message of an ERROR packet, without its terminator.
    pub fn message(&self) -> &'a [u8] {
        until_nul(&self.buffer.as_ref()[field::MSG])
    }
}

impl<T> Packet<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Set the type of the packet.
    pub fn set_opcode(&mut self, type_: Type) {
        let value: u16 = type_.into();
        self.buffer.as_mut()[field::OPCODE].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_block(&mut self, block: u16) {
        self.buffer.as_mut()[field::BLOCK].copy_from_slice(&block.to_be_bytes());
    }

    pub fn set_error_code(&mut self, code: ErrorCode) {
        let value: u16 = code.into();
        self.buffer.as_mut()[field::CODE].copy_from_slice(&value.to_be_bytes());
    }

    /// Write `filename\0mode\0` after the opcode.
    pub fn set_request(&mut self, filename: &[u8], mode: &[u8]) {
        let buf = &mut self.buffer.as_mut()[field::FILENAME];
        let (name, rest) = buf.split_at_mut(filename.len());
        name.copy_from_slice(filename);
        rest[0] = 0;
        rest[1..=mode.len()].copy_from_slice(mode);
        rest[mode.len() + 1] = 0;
    }

    /// Write `msg\0` after the error code.
    pub fn set_message(&mut self, msg: &[u8]) {
        let buf = &mut self.buffer.as_mut()[field::MSG];
        buf[..msg.len()].copy_from_slice(msg);
        buf[msg.len()] = 0;
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::DATA]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A high-level representation of a TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr<'a> {
    Rrq { filename: &'a [u8], mode: &'a str },
    Wrq { filename: &'a [u8], mode: &'a str },
    // data field of data may only be 512 bytes in length.
    Data { block: u16, data: &'a [u8] },
    Ack { block: u16 },
    Error { code: ErrorCode, message: &'a [u8] },
}

impl<'a> Repr<'a> {
    /// Parse a checked packet into its high-level form.
    pub fn parse<T>(packet: &Packet<&'a T>) -> Result<Self>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;
        match packet.opcode() {
            type_ @ (Type::Rrq | Type::Wrq) => {
                let filename = packet.filename();
                let mode = core::str::from_utf8(packet.mode())
                    .map_err(|_| Error::Malformed(Malformed::InvalidMode))?;
                if type_ == Type::Rrq {
                    Ok(Repr::Rrq { filename, mode })
                } else {
                    Ok(Repr::Wrq { filename, mode })
                }
            }
            Type::Data => Ok(Repr::Data {
                block: packet.block(),
                data: packet.data(),
            }),
            Type::Ack => Ok(Repr::Ack {
                block: packet.block(),
            }),
            Type::Error => Ok(Repr::Error {
                code: packet.error_code(),
                message: packet.message(),
            }),
            Type::Unknown(op) => Err(Malformed::UnknownOpcode(op).into()),
        }
    }

    /// Decode a received datagram.
    pub fn decode(buffer: &'a [u8]) -> Result<Self> {
        let packet = Packet::new_checked(buffer)?;
        Repr::parse(&packet)
    }

    pub fn opcode(&self) -> Type {
        match self {
            Repr::Rrq { .. } => Type::Rrq,
            Repr::Wrq { .. } => Type::Wrq,
            Repr::Data { .. } => Type::Data,
            Repr::Ack { .. } => Type::Ack,
            Repr::Error { .. } => Type::Error,
        }
    }

    /// Return the length of the packet that will be emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        match self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                field::FILENAME.start + filename.len() + 1 + mode.len() + 1
            }
            Repr::Data { data, .. } => META_SIZE + data.len(),
            Repr::Ack { .. } => META_SIZE,
            Repr::Error { message, .. } => META_SIZE + message.len() + 1,
        }
    }

    /// Emit into a buffer of exactly `buffer_len()` bytes.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]>,
    {
        packet.set_opcode(self.opcode());
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                packet.set_request(filename, mode.as_bytes());
            }
            Repr::Data { block, data } => {
                packet.set_block(block);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
            Repr::Ack { block } => packet.set_block(block),
            Repr::Error { code, message } => {
                packet.set_error_code(code);
                packet.set_message(message);
            }
        }
    }

    /// Encode into a fixed-capacity buffer, validating what `emit` assumes.
    pub fn encode(&self) -> Result<heapless::Vec<u8, PACKET_SIZE>> {
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                if filename.is_empty() || memchr(filename, 0).is_some() {
                    return Err(Malformed::InvalidFilename.into());
                }
                if memchr(mode.as_bytes(), 0).is_some() {
                    return Err(Malformed::InvalidMode.into());
                }
            }
            Repr::Data { data, .. } if data.len() > DATA_SIZE => {
                return Err(Malformed::Oversized.into());
            }
            Repr::Error { message, .. } if memchr(message, 0).is_some() => {
                return Err(Malformed::MissingTerminator.into());
            }
            _ => {}
        }

        let len = self.buffer_len();
        let mut buffer = heapless::Vec::new();
        buffer
            .resize(len, 0)
            .map_err(|_| Error::Malformed(Malformed::Oversized))?;
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        self.emit(&mut packet);
        Ok(buffer)
    }
}

/// Read a slice of at least two bytes as a big endian u16.
fn read_be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn until_nul(buf: &[u8]) -> &[u8] {
    let end = memchr(buf, 0).unwrap_or(buf.len());
    &buf[..end]
}

fn memchr<T>(buf: &[T], needle: T) -> Option<usize>
where
    T: core::cmp::PartialEq + core::marker::Copy,
{
    buf.iter().position(|&b| b == needle)
}
