//! Visualization wire protocol
//!
//! Every message is `type(u16) length(u16) payload[length] check(u8)`; a FRAME
//! is additionally preceded by a four byte magic number. All integers are
//! big-endian and all floats are big-endian IEEE-754 single precision.

use bytes::{Buf, BufMut};
use visualization::FrequencyAnalyzer;

/// Protocol version offered by this server
pub const PROTOCOL_MAJOR: u8 = 0;
pub const PROTOCOL_MINOR: u8 = 1;

pub const CLIHLO_TYPE: u16 = 0x0000;
pub const SRVHLO_TYPE: u16 = 0x0001;
pub const FRAME_TYPE: u16 = 0x0010;

/// Marks the start of every FRAME
pub const FRAME_MAGIC: [u8; 4] = [0x63, 0xac, 0x84, 0x03];

const CLIHLO_PAYLOAD_LEN: u16 = 6;
/// Header, payload and check byte
pub const CLIHLO_LEN: usize = 4 + CLIHLO_PAYLOAD_LEN as usize + 1;
pub const SRVHLO_LEN: usize = 7;

/// The client's opening message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub major_version: u8,
    pub minor_version: u8,
    /// Frames per second the client would like to receive
    pub requested_fps: u16,
    /// Offset in ms between "now" and the audio each frame should describe
    pub tau: i16,
}

/// Outcome of trying to parse a message from a partially received buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult<T> {
    Ok(T),
    NeedMoreData,
    Error,
}

/// Parse a CLIHLO from the front of `buf`.
///
/// The trailing check byte is not validated.
pub fn parse_clihlo(buf: &[u8]) -> ParseResult<ClientHello> {
    if buf.len() < CLIHLO_LEN {
        return ParseResult::NeedMoreData;
    }

    let mut buf = buf;
    let msg_type = buf.get_u16();
    if msg_type != CLIHLO_TYPE {
        return ParseResult::Error;
    }
    let length = buf.get_u16();
    if length != CLIHLO_PAYLOAD_LEN {
        return ParseResult::Error;
    }

    ParseResult::Ok(ClientHello {
        major_version: buf.get_u8(),
        minor_version: buf.get_u8(),
        requested_fps: buf.get_u16(),
        tau: buf.get_i16(),
    })
}

pub fn serialize_srvhlo<B: BufMut>(major: u8, minor: u8, buf: &mut B) {
    buf.put_u16(SRVHLO_TYPE);
    buf.put_u16(2);
    buf.put_u8(major);
    buf.put_u8(minor);
    buf.put_u8(0);
}

/// Write a FRAME carrying the analyzer's latest results.
pub fn serialize_sound_info_frame<B: BufMut>(analyzer: &FrequencyAnalyzer, buf: &mut B) {
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u16(FRAME_TYPE);
    // Bounded by construction of the analyzer
    buf.put_u16(analyzer.payload_len() as u16);
    analyzer.serialize_frame_payload(buf);
    buf.put_u8(0);
}

/// Total size of the FRAME produced by [`serialize_sound_info_frame`]
pub fn sound_info_frame_len(analyzer: &FrequencyAnalyzer) -> usize {
    FRAME_MAGIC.len() + 4 + analyzer.payload_len() + 1
}
