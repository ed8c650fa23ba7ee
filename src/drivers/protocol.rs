//! Frame codec for the sweep board's serial protocol.
//!
//! Every message, in both directions, is framed as
//! `SYNC | code | len (u16 LE) | payload | checksum`, where the checksum is the
//! XOR of the code byte, both length bytes and every payload byte.
use std::io::{Read, Write};

use crate::drivers::error::ProtocolError;

pub const SYNC: u8 = 0x7E;
pub const MAX_PAYLOAD: usize = 4096;

mod code {
    pub const HANDSHAKE: u8 = 0x01;
    pub const VERSION: u8 = 0x02;
    pub const SET_START_FREQ: u8 = 0x03;
    pub const SET_STOP_FREQ: u8 = 0x04;
    pub const SET_NUM_POINTS: u8 = 0x05;
    pub const SET_AMPLITUDE: u8 = 0x06;
    pub const START_SWEEP: u8 = 0x07;
    pub const SLEEP: u8 = 0x08;
    pub const WAKE: u8 = 0x09;
    pub const RESET: u8 = 0x0A;

    pub const OK: u8 = 0x80;
    pub const SEND_DATA: u8 = 0x81;
    pub const HANDSHAKE_ECHO: u8 = 0x82;
    pub const VERSION_REPLY: u8 = 0x83;
    pub const ERROR: u8 = 0xE0;
}

/// Host to device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Handshake(u32),
    Version,
    SetStartFreq(u32),
    SetStopFreq(u32),
    SetNumPoints(u32),
    SetAmplitude(u16),
    StartSweep,
    Sleep,
    Wake,
    Reset,
}

/// Device to host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    SendData(Vec<u16>),
    HandshakeEcho(u32),
    Version(String),
    Error(u8),
}

impl Command {
    fn code(&self) -> u8 {
        match self {
            Command::Handshake(_) => code::HANDSHAKE,
            Command::Version => code::VERSION,
            Command::SetStartFreq(_) => code::SET_START_FREQ,
            Command::SetStopFreq(_) => code::SET_STOP_FREQ,
            Command::SetNumPoints(_) => code::SET_NUM_POINTS,
            Command::SetAmplitude(_) => code::SET_AMPLITUDE,
            Command::StartSweep => code::START_SWEEP,
            Command::Sleep => code::SLEEP,
            Command::Wake => code::WAKE,
            Command::Reset => code::RESET,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Command::Handshake(v)
            | Command::SetStartFreq(v)
            | Command::SetStopFreq(v)
            | Command::SetNumPoints(v) => v.to_le_bytes().to_vec(),
            Command::SetAmplitude(v) => v.to_le_bytes().to_vec(),
            Command::Version
            | Command::StartSweep
            | Command::Sleep
            | Command::Wake
            | Command::Reset => Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.code(), &self.payload())
    }

    /// Parse a command frame body. Used by simulated boards.
    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let cmd = match code {
            code::HANDSHAKE => Command::Handshake(read_u32(payload, "handshake")?),
            code::VERSION => Command::Version,
            code::SET_START_FREQ => Command::SetStartFreq(read_u32(payload, "start frequency")?),
            code::SET_STOP_FREQ => Command::SetStopFreq(read_u32(payload, "stop frequency")?),
            code::SET_NUM_POINTS => Command::SetNumPoints(read_u32(payload, "point count")?),
            code::SET_AMPLITUDE => {
                let bytes: [u8; 2] = payload.try_into().map_err(|_| ProtocolError::Malformed {
                    what: "amplitude",
                    len: payload.len(),
                })?;
                Command::SetAmplitude(u16::from_le_bytes(bytes))
            }
            code::START_SWEEP => Command::StartSweep,
            code::SLEEP => Command::Sleep,
            code::WAKE => Command::Wake,
            code::RESET => Command::Reset,
            other => return Err(ProtocolError::Unrecognized(other)),
        };
        Ok(cmd)
    }
}

impl Response {
    /// Short form for logs and errors; sample payloads are reduced to a count.
    pub fn summary(&self) -> String {
        match self {
            Response::SendData(samples) => format!("SendData({} samples)", samples.len()),
            other => format!("{other:?}"),
        }
    }

    fn code(&self) -> u8 {
        match self {
            Response::Ok => code::OK,
            Response::SendData(_) => code::SEND_DATA,
            Response::HandshakeEcho(_) => code::HANDSHAKE_ECHO,
            Response::Version(_) => code::VERSION_REPLY,
            Response::Error(_) => code::ERROR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Response::Ok => Vec::new(),
            Response::SendData(samples) => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            Response::HandshakeEcho(v) => v.to_le_bytes().to_vec(),
            Response::Version(s) => s.as_bytes().to_vec(),
            Response::Error(c) => vec![*c],
        };
        encode_frame(self.code(), &payload)
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let resp = match code {
            code::OK => Response::Ok,
            code::SEND_DATA => {
                if payload.len() % 2 != 0 {
                    return Err(ProtocolError::Malformed {
                        what: "sample",
                        len: payload.len(),
                    });
                }
                Response::SendData(
                    payload
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            code::HANDSHAKE_ECHO => Response::HandshakeEcho(read_u32(payload, "handshake echo")?),
            code::VERSION_REPLY => Response::Version(String::from_utf8_lossy(payload).into_owned()),
            code::ERROR => Response::Error(payload.first().copied().unwrap_or(0)),
            other => return Err(ProtocolError::Unrecognized(other)),
        };
        Ok(resp)
    }
}

fn read_u32(payload: &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| ProtocolError::Malformed {
        what,
        len: payload.len(),
    })?;
    Ok(u32::from_le_bytes(bytes))
}

fn checksum(code: u8, len: [u8; 2], payload: &[u8]) -> u8 {
    payload.iter().fold(code ^ len[0] ^ len[1], |acc, b| acc ^ b)
}

pub fn encode_frame(code: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u16).to_le_bytes();
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(SYNC);
    out.push(code);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
    out.push(checksum(code, len, payload));
    out
}

/// Read one frame, returning its code and payload after sync/checksum validation.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    if header[0] != SYNC {
        return Err(ProtocolError::BadSync(header[0]));
    }
    let code = header[1];
    let len_bytes = [header[2], header[3]];
    let len = u16::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLong(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut trailer = [0u8; 1];
    reader.read_exact(&mut trailer)?;
    let expected = checksum(code, len_bytes, &payload);
    if trailer[0] != expected {
        return Err(ProtocolError::Checksum {
            expected,
            actual: trailer[0],
        });
    }
    Ok((code, payload))
}

pub fn read_response<R: Read + ?Sized>(reader: &mut R) -> Result<Response, ProtocolError> {
    let (code, payload) = read_frame(reader)?;
    Response::decode(code, &payload)
}

pub fn write_command<W: Write + ?Sized>(writer: &mut W, cmd: &Command) -> Result<(), ProtocolError> {
    writer.write_all(&cmd.encode())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn send_data_frame_decodes_samples() {
        let frame = Response::SendData(vec![1, 0x0fff, 512]).encode();
        let resp = read_response(&mut Cursor::new(frame)).unwrap();
        assert_eq!(resp, Response::SendData(vec![1, 0x0fff, 512]));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut frame = Command::SetNumPoints(1501).encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, ProtocolError::Checksum { .. }));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn unknown_response_code_is_unrecognized() {
        let frame = encode_frame(0x42, &[]);
        let err = read_response(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, ProtocolError::Unrecognized(0x42)));
    }

    #[test]
    fn truncated_stream_is_a_link_failure() {
        let frame = Response::Ok.encode();
        let err = read_frame(&mut Cursor::new(&frame[..2])).unwrap_err();
        assert!(err.is_link_failure());
    }

    #[test]
    fn summary_reduces_samples_to_a_count() {
        let resp = Response::SendData(vec![7; 256]);
        assert_eq!(resp.summary(), "SendData(256 samples)");
        assert_eq!(Response::Error(3).summary(), "Error(3)");
    }

    #[test]
    fn command_payloads_decode() {
        let frame = Command::SetAmplitude(2000).encode();
        let (code, payload) = read_frame(&mut Cursor::new(frame)).unwrap();
        assert_eq!(Command::decode(code, &payload).unwrap(), Command::SetAmplitude(2000));
    }
}
