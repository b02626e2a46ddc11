//! TFTP wire codec
//!
//! Pure encode/decode for the five RFC 1350 packet kinds. The codec owns no
//! buffers and performs no I/O; decoders take an immutable byte slice and
//! return a populated packet value or an error, encoders return the packet
//! bytes ready for `send_to`.
//!
//! Option extensions (RFC 2347/2348/2349) are not supported: opcode 6 is
//! unrecognized, and trailing option bytes after the mode string of a
//! request are ignored.

use std::fmt;

use anyhow::{Result, anyhow};

/// Payload bytes per DATA block. A shorter (possibly empty) payload marks
/// the final block of a transfer.
pub const BLOCK_SIZE: usize = 512;

/// Receive buffer size, large enough for any datagram a conforming client
/// sends on a standard MTU link.
pub const MAX_FRAME_SIZE: usize = 1500;

/// Smallest well-formed RRQ/WRQ: opcode + 1-byte filename + NUL + 5-byte
/// mode + NUL.
pub const MIN_REQUEST_SIZE: usize = 10;

/// Longest accepted filename in a request, in bytes.
pub const MAX_FILENAME_LEN: usize = 4095;

/// Longest accepted ERROR message, excluding the terminator.
pub const MAX_ERROR_MSG_LEN: usize = 127;

/// TFTP packet opcodes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - the client pulls a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - the client pushes a file to the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data packet carrying one block of file content.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment of one data block. Block 0 acknowledges a WRQ.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error report; terminates the transfer it refers to.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes, the fixed taxonomy of RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: not defined, see error message (if any).
    NotDefined = 0,

    /// Error code 1: the requested file does not exist on the server.
    FileNotFound = 1,

    /// Error code 2: the file exists but cannot be read.
    AccessViolation = 2,

    /// Error code 3: disk full or allocation exceeded.
    DiskFull = 3,

    /// Error code 4: illegal TFTP operation, including unsupported
    /// transfer modes.
    IllegalOperation = 4,

    /// Error code 5: packet received from an unexpected transfer ID.
    UnknownTransferId = 5,

    /// Error code 6: file already exists.
    FileAlreadyExists = 6,

    /// Error code 7: no such user.
    NoSuchUser = 7,
}

impl TftpErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The canonical message transmitted in an ERROR packet for this code.
    pub fn wire_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined.",
            Self::FileNotFound => "File not found.",
            Self::AccessViolation => "Access violation.",
            Self::DiskFull => "Disk full or allocation exceeded.",
            Self::IllegalOperation => "Illegal TFTP operation.",
            Self::UnknownTransferId => "Unknown transfer ID.",
            Self::FileAlreadyExists => "File already exists.",
            Self::NoSuchUser => "No such user.",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(code: TftpErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.wire_message(), self.as_u16())
    }
}

/// Transfer modes a request may name. Matching is case-sensitive; any other
/// string fails the request decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Text mode. Accepted and serviced identically to octet; no CR/LF
    /// translation is performed.
    Netascii,

    /// Binary mode, transferred as-is.
    Octet,

    /// Mail transfer. Decodes, but a session carrying it is rejected with
    /// ILLEGAL_OPERATION.
    Mail,
}

impl TransferMode {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "netascii" => Some(Self::Netascii),
            "octet" => Some(Self::Octet),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
            Self::Mail => "mail",
        }
    }

    /// Whether the server is willing to run a transfer in this mode.
    pub fn is_supported(self) -> bool {
        match self {
            Self::Netascii | Self::Octet => true,
            Self::Mail => false,
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded RRQ or WRQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    pub opcode: TftpOpcode,
    pub filename: String,
    pub mode: TransferMode,
}

/// A decoded DATA packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
    /// Block number, 1-indexed.
    pub block: u16,
    pub data: Vec<u8>,
}

impl TftpData {
    /// A payload shorter than [`BLOCK_SIZE`] marks the final block.
    pub fn is_last_block(&self) -> bool {
        self.data.len() < BLOCK_SIZE
    }
}

/// A decoded ACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpAck {
    pub block: u16,
}

/// A decoded ERROR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    pub code: TftpErrorCode,
    pub message: String,
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Find the next NUL in `buf` at or after `start`.
fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf[start..].iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Get the raw opcode field from a packet, if the buffer is long enough.
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Get the recognized opcode of a packet buffer.
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

/// Parse an RRQ or WRQ packet.
pub fn parse_request(buf: &[u8]) -> Result<TftpRequest> {
    if buf.len() < MIN_REQUEST_SIZE {
        return Err(anyhow!("request below minimum size"));
    }

    let opcode = match get_tftp_opcode(buf) {
        Some(op @ (TftpOpcode::ReadRequest | TftpOpcode::WriteRequest)) => op,
        _ => return Err(anyhow!("not a request packet")),
    };

    let fname_end = find_zero(buf, 2).ok_or_else(|| anyhow!("filename not terminated"))?;
    let filename = std::str::from_utf8(&buf[2..fname_end])?;
    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return Err(anyhow!("bad filename length {}", filename.len()));
    }

    let mode_start = fname_end + 1;
    if mode_start >= buf.len() {
        return Err(anyhow!("mode missing"));
    }
    let mode_end = find_zero(buf, mode_start).ok_or_else(|| anyhow!("mode not terminated"))?;
    let mode_str = std::str::from_utf8(&buf[mode_start..mode_end])?;
    let mode = TransferMode::from_wire(mode_str)
        .ok_or_else(|| anyhow!("unrecognized transfer mode {:?}", mode_str))?;

    // Anything after the mode terminator would be RFC 2347 options; ignored.

    Ok(TftpRequest {
        opcode,
        filename: filename.to_string(),
        mode,
    })
}

/// Parse a DATA packet.
pub fn parse_data(buf: &[u8]) -> Result<TftpData> {
    if buf.len() < 4 {
        return Err(anyhow!("DATA too short"));
    }
    if get_tftp_opcode(buf) != Some(TftpOpcode::Data) {
        return Err(anyhow!("not a DATA packet"));
    }

    let block = u16::from_be_bytes([buf[2], buf[3]]);
    if block == 0 {
        return Err(anyhow!("DATA block number 0"));
    }

    let data = &buf[4..];
    if data.len() > BLOCK_SIZE {
        return Err(anyhow!("DATA payload of {} bytes", data.len()));
    }

    Ok(TftpData {
        block,
        data: data.to_vec(),
    })
}

/// Parse an ACK packet. ACKs are exactly four bytes.
pub fn parse_ack(buf: &[u8]) -> Result<TftpAck> {
    if buf.len() != 4 {
        return Err(anyhow!("bad ACK size {}", buf.len()));
    }
    if get_tftp_opcode(buf) != Some(TftpOpcode::Acknowledgment) {
        return Err(anyhow!("not an ACK packet"));
    }

    Ok(TftpAck {
        block: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

/// Parse an ERROR packet.
pub fn parse_error(buf: &[u8]) -> Result<TftpError> {
    if buf.len() < 5 {
        return Err(anyhow!("ERROR too short"));
    }
    if get_tftp_opcode(buf) != Some(TftpOpcode::Error) {
        return Err(anyhow!("not an ERROR packet"));
    }

    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let code = TftpErrorCode::from_u16(code).ok_or_else(|| anyhow!("error code {} out of range", code))?;

    let msg_end = find_zero(buf, 4).ok_or_else(|| anyhow!("message not terminated"))?;
    if msg_end - 4 > MAX_ERROR_MSG_LEN {
        return Err(anyhow!("message of {} bytes", msg_end - 4));
    }
    let message = std::str::from_utf8(&buf[4..msg_end])?.to_string();

    Ok(TftpError { code, message })
}

/// Build an RRQ or WRQ packet.
pub fn build_request(opcode: TftpOpcode, filename: &str, mode: TransferMode) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + filename.len() + mode.as_str().len());
    v.extend_from_slice(&opcode.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_str().as_bytes());
    v.push(0);
    v
}

/// Build a DATA packet. The payload is capped at [`BLOCK_SIZE`] bytes; the
/// returned length is `4 + payload_len`.
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(BLOCK_SIZE)];
    let mut v = Vec::with_capacity(4 + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Build an ACK packet.
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(4);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build an ERROR packet carrying the canonical message for `code`.
pub fn build_error(code: TftpErrorCode) -> Vec<u8> {
    let msg = code.wire_message();
    let mut v = Vec::with_capacity(5 + msg.len());
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.as_u16().to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_conversion() {
        assert_eq!(TftpOpcode::ReadRequest.as_u16(), 1);
        assert_eq!(TftpOpcode::Error.as_u16(), 5);
        assert_eq!(TftpOpcode::from_u16(2), Some(TftpOpcode::WriteRequest));
        assert_eq!(TftpOpcode::from_u16(6), None);
        assert_eq!(TftpOpcode::from_u16(0), None);
    }

    #[test]
    fn error_code_conversion() {
        assert_eq!(TftpErrorCode::FileNotFound.as_u16(), 1);
        assert_eq!(TftpErrorCode::from_u16(7), Some(TftpErrorCode::NoSuchUser));
        assert_eq!(TftpErrorCode::from_u16(8), None);
        assert_eq!(TftpErrorCode::FileNotFound.wire_message(), "File not found.");
    }

    #[test]
    fn transfer_mode_is_case_sensitive() {
        assert_eq!(TransferMode::from_wire("octet"), Some(TransferMode::Octet));
        assert_eq!(TransferMode::from_wire("netascii"), Some(TransferMode::Netascii));
        assert_eq!(TransferMode::from_wire("mail"), Some(TransferMode::Mail));
        assert_eq!(TransferMode::from_wire("OCTET"), None);
        assert_eq!(TransferMode::from_wire("NetAscii"), None);
        assert_eq!(TransferMode::from_wire("binary"), None);
        assert_eq!(TransferMode::from_wire(""), None);

        assert!(TransferMode::Octet.is_supported());
        assert!(TransferMode::Netascii.is_supported());
        assert!(!TransferMode::Mail.is_supported());
    }

    #[test]
    fn request_round_trip() {
        for opcode in [TftpOpcode::ReadRequest, TftpOpcode::WriteRequest] {
            for mode in [TransferMode::Netascii, TransferMode::Octet, TransferMode::Mail] {
                let bytes = build_request(opcode, "boot/image.bin", mode);
                let parsed = parse_request(&bytes).unwrap();
                assert_eq!(parsed.opcode, opcode);
                assert_eq!(parsed.filename, "boot/image.bin");
                assert_eq!(parsed.mode, mode);
            }
        }
    }

    #[test]
    fn request_rejects_short_and_malformed() {
        // Below the 10-byte minimum.
        assert!(parse_request(&build_request(TftpOpcode::ReadRequest, "a", TransferMode::Octet)[..9]).is_err());

        // Wrong opcode for a request.
        let mut bytes = build_request(TftpOpcode::ReadRequest, "file.bin", TransferMode::Octet);
        bytes[1] = 3;
        assert!(parse_request(&bytes).is_err());

        // Unterminated mode string.
        let mut bytes = build_request(TftpOpcode::ReadRequest, "file.bin", TransferMode::Octet);
        bytes.pop();
        assert!(parse_request(&bytes).is_err());

        // Unknown mode.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(b"file.bin\0binary\0");
        assert!(parse_request(&bytes).is_err());

        // Over-long filename.
        let long = "x".repeat(MAX_FILENAME_LEN + 1);
        assert!(parse_request(&build_request(TftpOpcode::ReadRequest, &long, TransferMode::Octet)).is_err());
    }

    #[test]
    fn request_ignores_trailing_options() {
        let mut bytes = build_request(TftpOpcode::ReadRequest, "pxelinux.0", TransferMode::Octet);
        bytes.extend_from_slice(b"blksize\x001400\0");
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.filename, "pxelinux.0");
        assert_eq!(parsed.mode, TransferMode::Octet);
    }

    #[test]
    fn data_round_trip() {
        let payload = vec![0xabu8; 512];
        let bytes = build_data(7, &payload);
        assert_eq!(bytes.len(), 4 + payload.len());
        let parsed = parse_data(&bytes).unwrap();
        assert_eq!(parsed.block, 7);
        assert_eq!(parsed.data, payload);
        assert!(!parsed.is_last_block());

        // Zero-length payload legally signals end-of-file.
        let parsed = parse_data(&build_data(3, &[])).unwrap();
        assert!(parsed.data.is_empty());
        assert!(parsed.is_last_block());
    }

    #[test]
    fn data_rejects_bad_frames() {
        assert!(parse_data(&[0, 3, 0]).is_err());
        assert!(parse_data(&build_ack(1)).is_err());
        // Block 0 is never a valid DATA block.
        let mut bytes = build_data(1, b"xyz");
        bytes[3] = 0;
        assert!(parse_data(&bytes).is_err());
        // Oversized payload.
        let mut bytes = build_data(1, &[0u8; 512]);
        bytes.push(0);
        assert!(parse_data(&bytes).is_err());
    }

    #[test]
    fn ack_round_trip() {
        let bytes = build_ack(65535);
        assert_eq!(bytes.len(), 4);
        assert_eq!(parse_ack(&bytes).unwrap().block, 65535);

        assert!(parse_ack(&bytes[..3]).is_err());
        // ACKs are fixed size.
        let mut long = bytes.clone();
        long.push(0);
        assert!(parse_ack(&long).is_err());
        assert!(parse_ack(&build_data(1, b"")).is_err());
    }

    #[test]
    fn error_round_trip() {
        let bytes = build_error(TftpErrorCode::IllegalOperation);
        assert_eq!(&bytes[..2], &5u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &4u16.to_be_bytes());
        assert_eq!(bytes[bytes.len() - 1], 0);

        let parsed = parse_error(&bytes).unwrap();
        assert_eq!(parsed.code, TftpErrorCode::IllegalOperation);
        assert_eq!(parsed.message, "Illegal TFTP operation.");
    }

    #[test]
    fn error_rejects_bad_frames() {
        assert!(parse_error(&[0, 5, 0, 0]).is_err());

        // Code out of taxonomy.
        let mut bytes = build_error(TftpErrorCode::NotDefined);
        bytes[3] = 8;
        assert!(parse_error(&bytes).is_err());

        // Missing terminator.
        let mut bytes = build_error(TftpErrorCode::NotDefined);
        bytes.pop();
        assert!(parse_error(&bytes).is_err());

        // Over-long message.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&vec![b'm'; MAX_ERROR_MSG_LEN + 1]);
        bytes.push(0);
        assert!(parse_error(&bytes).is_err());
    }

    #[test]
    fn opcode_dispatch() {
        assert_eq!(get_tftp_opcode(&build_ack(1)), Some(TftpOpcode::Acknowledgment));
        assert_eq!(get_tftp_opcode(&build_data(1, b"x")), Some(TftpOpcode::Data));
        assert_eq!(get_tftp_opcode(&[0, 9]), None);
        assert_eq!(get_tftp_opcode(&[1]), None);
        assert_eq!(get_opcode(&[]), None);
    }

    #[test]
    fn build_data_caps_payload() {
        let oversized = vec![1u8; BLOCK_SIZE + 100];
        let bytes = build_data(1, &oversized);
        assert_eq!(bytes.len(), 4 + BLOCK_SIZE);
    }
}
