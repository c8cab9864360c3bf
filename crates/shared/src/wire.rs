//! ASCII line framing for the per-device serial wire protocol (§6).
//!
//! Frame: `<token> <opcode> [args...] [*<crc16>]\r\n`
//! Response: `<token> <status> [payload] [*<crc16>]\r\n`
//!
//! CRC is optional and negotiated at connect; when absent, framing relies
//! on CR-LF alone. The polynomial is unspecified upstream (§9 Open
//! Questions); CRC16/CCITT-FALSE (poly 0x1021, init 0xFFFF) is used here,
//! a common default for line-oriented instrument protocols.

use crate::command::{Command, Token};
use crate::response::{Response, Status};

pub const LINE_TERMINATOR: &str = "\r\n";

/// Computes CRC16/CCITT-FALSE over `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty line")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid token: \"{0}\"")]
    InvalidToken(String),
    #[error("invalid status: \"{0}\"")]
    InvalidStatus(String),
    #[error("crc mismatch: expected {expected:04x}, got {actual:04x}")]
    CrcMismatch { expected: u16, actual: u16 },
}

/// Encodes a command as a CR-LF terminated ASCII line, optionally appending
/// a `*<crc16>` suffix computed over everything preceding it.
pub fn encode_command(cmd: &Command, with_crc: bool) -> String {
    let args = cmd.args.as_str();
    let body = if args.is_empty() {
        format!("{} {}", cmd.token, cmd.opcode)
    } else {
        format!("{} {} {}", cmd.token, cmd.opcode, args)
    };
    append_frame(body, with_crc)
}

/// Encodes a response line, mirroring [`encode_command`]; used by test
/// doubles and simulated peripherals that stand in for real firmware.
pub fn encode_response(token: Token, status: Status, payload: Option<&str>, with_crc: bool) -> String {
    let body = match payload {
        Some(p) if !p.is_empty() => format!("{token} {status} {p}"),
        _ => format!("{token} {status}"),
    };
    append_frame(body, with_crc)
}

fn append_frame(mut body: String, with_crc: bool) -> String {
    if with_crc {
        let crc = crc16_ccitt(body.as_bytes());
        body.push_str(&format!(" *{crc:04x}"));
    }
    body.push_str(LINE_TERMINATOR);
    body
}

/// Strips and verifies an optional trailing `*<crc16>` field, returning the
/// remaining fields split on whitespace.
fn split_and_verify<'a>(line: &'a str, require_crc: bool) -> Result<Vec<&'a str>, WireError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(WireError::Empty);
    }
    let mut fields: Vec<&str> = line.split_whitespace().collect();
    match fields.last().and_then(|f| f.strip_prefix('*')) {
        Some(hex) => {
            let actual = u16::from_str_radix(hex, 16)
                .map_err(|_| WireError::InvalidToken(hex.to_string()))?;
            fields.pop();
            let body = fields.join(" ");
            let expected = crc16_ccitt(body.as_bytes());
            if expected != actual {
                return Err(WireError::CrcMismatch { expected, actual });
            }
            Ok(fields)
        }
        None => {
            if require_crc {
                return Err(WireError::MissingField("crc"));
            }
            Ok(fields)
        }
    }
}

/// Parses a reply line into a [`Response`]. The caller supplies the receive
/// timestamp so tests can control it.
pub fn decode_response(
    line: &str,
    require_crc: bool,
    received_at: std::time::SystemTime,
) -> Result<Response, WireError> {
    let fields = split_and_verify(line, require_crc)?;
    let token_str = *fields.first().ok_or(WireError::MissingField("token"))?;
    let token: Token = token_str
        .parse()
        .map_err(|_| WireError::InvalidToken(token_str.to_string()))?;
    let status_str = *fields.get(1).ok_or(WireError::MissingField("status"))?;
    let status: Status = status_str
        .parse()
        .map_err(|_| WireError::InvalidStatus(status_str.to_string()))?;
    let payload = if fields.len() > 2 {
        Some(crate::inline::ArgPayload::from_str(&fields[2..].join(" ")))
    } else {
        None
    };
    Ok(Response {
        token,
        status,
        payload,
        received_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::time::SystemTime;

    #[test]
    fn round_trips_without_crc() {
        let cmd = Command::new(Device::PowerSupply, 7, "enable", "");
        let line = encode_command(&cmd, false);
        assert_eq!(line, "7 enable\r\n");

        let resp_line = encode_response(7, Status::Ok, None, false);
        let resp = decode_response(&resp_line, false, SystemTime::now()).unwrap();
        assert_eq!(resp.token, 7);
        assert_eq!(resp.status, Status::Ok);
    }

    #[test]
    fn round_trips_with_crc() {
        let cmd = Command::new(Device::PulseGen, 3, "fire", "12.0");
        let line = encode_command(&cmd, true);
        assert!(line.contains('*'));

        let resp_line = encode_response(3, Status::Ok, Some("ack"), true);
        let resp = decode_response(&resp_line, true, SystemTime::now()).unwrap();
        assert_eq!(resp.token, 3);
        assert_eq!(resp.payload.unwrap().as_str(), "ack");
    }

    #[test]
    fn rejects_tampered_crc() {
        let cmd = Command::new(Device::Pump, 1, "run", "");
        let mut line = encode_command(&cmd, true);
        // Flip a digit in the CRC suffix.
        let idx = line.find('*').unwrap() + 1;
        let bytes = unsafe { line.as_bytes_mut() };
        bytes[idx] = if bytes[idx] == b'0' { b'1' } else { b'0' };
        let err = decode_response(&line, true, SystemTime::now()).unwrap_err();
        assert!(matches!(err, WireError::CrcMismatch { .. }));
    }

    #[test]
    fn rejects_missing_required_crc() {
        let line = "1 ok\r\n";
        let err = decode_response(line, true, SystemTime::now()).unwrap_err();
        assert_eq!(err, WireError::MissingField("crc"));
    }
}
