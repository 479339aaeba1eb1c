//! SPDY frame types and binary serialization.
//!
//! One `Framer` serializes outbound frames into a reusable scratch buffer;
//! one `Parser` turns inbound bytes into typed [`FrameEvent`]s through a
//! resumable state machine. Both are owned by the connection engine and each
//! holds its direction's half of the stateful header codec.

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Uri};

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::version::Version;
use crate::zlib::{HeaderCompressor, HeaderDecompressor};

/// Frame header size (8 bytes for both control and data frames).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest stream id expressible in the 31-bit field.
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Largest payload expressible in the 24-bit length field. Larger writes are
/// split across several DATA frames.
pub const MAX_DATA_LEN: usize = 0xff_ffff;

/// SETTINGS parameter id for the initial flow-control window.
pub const SETTINGS_INITIAL_WINDOW_SIZE: u32 = 7;

/// Control frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    SynStream,
    SynReply,
    RstStream,
    Settings,
    Noop,
    Ping,
    GoAway,
    Headers,
    WindowUpdate,
    Credential,
    Unknown(u16),
}

impl From<u16> for ControlType {
    fn from(v: u16) -> Self {
        match v {
            1 => Self::SynStream,
            2 => Self::SynReply,
            3 => Self::RstStream,
            4 => Self::Settings,
            5 => Self::Noop,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::Headers,
            9 => Self::WindowUpdate,
            10 => Self::Credential,
            other => Self::Unknown(other),
        }
    }
}

impl From<ControlType> for u16 {
    fn from(t: ControlType) -> u16 {
        match t {
            ControlType::SynStream => 1,
            ControlType::SynReply => 2,
            ControlType::RstStream => 3,
            ControlType::Settings => 4,
            ControlType::Noop => 5,
            ControlType::Ping => 6,
            ControlType::GoAway => 7,
            ControlType::Headers => 8,
            ControlType::WindowUpdate => 9,
            ControlType::Credential => 10,
            ControlType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    /// Last frame from this side of the stream.
    pub const FIN: u8 = 0x1;
}

/// RST_STREAM status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RstStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
    InvalidCredentials,
    FrameTooLarge,
    Unknown(u32),
}

impl From<u32> for RstStatus {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::ProtocolError,
            2 => Self::InvalidStream,
            3 => Self::RefusedStream,
            4 => Self::UnsupportedVersion,
            5 => Self::Cancel,
            6 => Self::InternalError,
            7 => Self::FlowControlError,
            8 => Self::StreamInUse,
            9 => Self::StreamAlreadyClosed,
            10 => Self::InvalidCredentials,
            11 => Self::FrameTooLarge,
            other => Self::Unknown(other),
        }
    }
}

impl From<RstStatus> for u32 {
    fn from(s: RstStatus) -> u32 {
        match s {
            RstStatus::ProtocolError => 1,
            RstStatus::InvalidStream => 2,
            RstStatus::RefusedStream => 3,
            RstStatus::UnsupportedVersion => 4,
            RstStatus::Cancel => 5,
            RstStatus::InternalError => 6,
            RstStatus::FlowControlError => 7,
            RstStatus::StreamInUse => 8,
            RstStatus::StreamAlreadyClosed => 9,
            RstStatus::InvalidCredentials => 10,
            RstStatus::FrameTooLarge => 11,
            RstStatus::Unknown(v) => v,
        }
    }
}

impl std::fmt::Display for RstStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolError => f.write_str("PROTOCOL_ERROR"),
            Self::InvalidStream => f.write_str("INVALID_STREAM"),
            Self::RefusedStream => f.write_str("REFUSED_STREAM"),
            Self::UnsupportedVersion => f.write_str("UNSUPPORTED_VERSION"),
            Self::Cancel => f.write_str("CANCEL"),
            Self::InternalError => f.write_str("INTERNAL_ERROR"),
            Self::FlowControlError => f.write_str("FLOW_CONTROL_ERROR"),
            Self::StreamInUse => f.write_str("STREAM_IN_USE"),
            Self::StreamAlreadyClosed => f.write_str("STREAM_ALREADY_CLOSED"),
            Self::InvalidCredentials => f.write_str("INVALID_CREDENTIALS"),
            Self::FrameTooLarge => f.write_str("FRAME_TOO_LARGE"),
            Self::Unknown(v) => write!(f, "UNKNOWN({v})"),
        }
    }
}

/// Inbound frame event produced by the [`Parser`].
///
/// DATA payloads may arrive in several chunks per frame; `fin` is reported on
/// the final chunk only. Frame types the client ignores (PING, GOAWAY, NOOP,
/// server-push SYN_STREAM, HEADERS, CREDENTIAL and unknown types) produce no
/// event at all.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    SynReply {
        stream_id: u32,
        fin: bool,
        headers: Headers,
    },
    Data {
        stream_id: u32,
        fin: bool,
        payload: Bytes,
    },
    RstStream {
        stream_id: u32,
        status: RstStatus,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    Settings {
        initial_window: Option<u32>,
    },
}

/// Serializer for the frames a SPDY client emits.
///
/// Frames are built into a reusable scratch buffer: `clear`, build one or
/// more frames, then copy `output` into the connection's write queue.
pub struct Framer {
    version: Version,
    buf: BytesMut,
    compressor: HeaderCompressor,
}

impl Framer {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            buf: BytesMut::with_capacity(1024),
            compressor: HeaderCompressor::new(version),
        }
    }

    /// Reset the scratch buffer.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes built since the last `clear`.
    pub fn output(&self) -> &[u8] {
        &self.buf
    }

    fn control_header(&mut self, kind: ControlType, frame_flags: u8, length: usize) {
        self.buf.put_u16(0x8000 | self.version.wire());
        self.buf.put_u16(u16::from(kind));
        self.buf.put_u8(frame_flags);
        self.buf.put_uint(length as u64, 3);
    }

    /// SYN_STREAM opening a new stream. Always sent with fin unset; a body-less
    /// request is half-closed with an empty fin DATA frame afterwards.
    pub fn syn_stream(
        &mut self,
        stream_id: u32,
        priority: u8,
        method: &Method,
        url: &Uri,
        host: &str,
        headers: &Headers,
    ) -> Result<()> {
        let scheme = url.scheme_str().unwrap_or("https");
        let path = url.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        let mut pairs = Headers::new();
        match self.version {
            Version::V2 => {
                pairs.insert("method", method.as_str());
                pairs.insert("url", path);
                pairs.insert("version", "HTTP/1.1");
                pairs.insert("host", host);
                pairs.insert("scheme", scheme);
            }
            Version::V3 => {
                pairs.insert(":method", method.as_str());
                pairs.insert(":path", path);
                pairs.insert(":version", "HTTP/1.1");
                pairs.insert(":host", host);
                pairs.insert(":scheme", scheme);
            }
        }
        for (name, value) in headers.iter() {
            pairs.insert(name, value);
        }

        let block = self.compressor.encode(&pairs)?;
        self.control_header(ControlType::SynStream, 0, 10 + block.len());
        self.buf.put_u32(stream_id & MAX_STREAM_ID);
        // Associated-to-stream id: never set by a client-initiated stream.
        self.buf.put_u32(0);
        let shift = if self.version == Version::V2 { 6 } else { 5 };
        self.buf.put_u8(priority << shift);
        self.buf.put_u8(0);
        self.buf.extend_from_slice(&block);
        Ok(())
    }

    /// DATA frame. `payload` must fit the 24-bit length field; the engine
    /// splits larger writes before serializing.
    pub fn data(&mut self, stream_id: u32, fin: bool, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_DATA_LEN);
        self.buf.put_u32(stream_id & MAX_STREAM_ID);
        self.buf.put_u8(if fin { flags::FIN } else { 0 });
        self.buf.put_uint(payload.len() as u64, 3);
        self.buf.extend_from_slice(payload);
    }

    /// RST_STREAM aborting one stream.
    pub fn rst_stream(&mut self, stream_id: u32, status: RstStatus) {
        self.control_header(ControlType::RstStream, 0, 8);
        self.buf.put_u32(stream_id & MAX_STREAM_ID);
        self.buf.put_u32(u32::from(status));
    }

    /// WINDOW_UPDATE granting the peer `delta` more bytes on a stream.
    pub fn window_update(&mut self, stream_id: u32, delta: u32) {
        self.control_header(ControlType::WindowUpdate, 0, 8);
        self.buf.put_u32(stream_id & MAX_STREAM_ID);
        self.buf.put_u32(delta & MAX_STREAM_ID);
    }

    /// SETTINGS advertising our initial window, sent once on SPDY/3 connect.
    pub fn initial_settings(&mut self, window: u32) {
        self.control_header(ControlType::Settings, 0, 12);
        self.buf.put_u32(1);
        self.buf.put_u8(0);
        self.buf.put_uint(u64::from(SETTINGS_INITIAL_WINDOW_SIZE), 3);
        self.buf.put_u32(window);
    }
}

#[derive(Debug, Clone, Copy)]
enum ParseState {
    Header,
    ControlBody {
        kind: ControlType,
        frame_flags: u8,
        length: usize,
    },
    DataBody {
        stream_id: u32,
        fin: bool,
        remaining: usize,
    },
}

/// Resumable inbound frame parser.
///
/// Feed arbitrary byte chunks through [`Parser::execute`]; control bodies are
/// buffered until complete, DATA bodies stream straight through. Any parse
/// failure poisons the connection and is reported as [`Error::Protocol`].
pub struct Parser {
    version: Version,
    decompressor: HeaderDecompressor,
    state: ParseState,
    buf: BytesMut,
}

impl Parser {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            decompressor: HeaderDecompressor::new(version),
            state: ParseState::Header,
            buf: BytesMut::with_capacity(FRAME_HEADER_SIZE),
        }
    }

    /// Consume a chunk of transport bytes and return the events recognized
    /// in it.
    pub fn execute(&mut self, mut input: &[u8]) -> Result<Vec<FrameEvent>> {
        let mut events = Vec::new();
        loop {
            match self.state {
                ParseState::Header => {
                    let need = FRAME_HEADER_SIZE - self.buf.len();
                    let take = need.min(input.len());
                    self.buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.buf.len() < FRAME_HEADER_SIZE {
                        break;
                    }
                    let header = self.buf.split();
                    self.start_frame(&header, &mut events)?;
                }
                ParseState::ControlBody {
                    kind,
                    frame_flags,
                    length,
                } => {
                    let need = length - self.buf.len();
                    let take = need.min(input.len());
                    self.buf.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.buf.len() < length {
                        break;
                    }
                    let body = self.buf.split();
                    self.state = ParseState::Header;
                    self.control_frame(kind, frame_flags, &body, &mut events)?;
                }
                ParseState::DataBody {
                    stream_id,
                    fin,
                    remaining,
                } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = remaining.min(input.len());
                    let payload = Bytes::copy_from_slice(&input[..take]);
                    input = &input[take..];
                    let remaining = remaining - take;
                    events.push(FrameEvent::Data {
                        stream_id,
                        fin: fin && remaining == 0,
                        payload,
                    });
                    self.state = if remaining == 0 {
                        ParseState::Header
                    } else {
                        ParseState::DataBody {
                            stream_id,
                            fin,
                            remaining,
                        }
                    };
                }
            }
        }
        Ok(events)
    }

    fn start_frame(&mut self, header: &[u8], events: &mut Vec<FrameEvent>) -> Result<()> {
        let word = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let frame_flags = header[4];
        let length = u32::from_be_bytes([0, header[5], header[6], header[7]]) as usize;

        if word & 0x8000_0000 != 0 {
            let version = ((word >> 16) & 0x7fff) as u16;
            if version != self.version.wire() {
                return Err(Error::protocol(format!(
                    "control frame for SPDY version {} on a {} connection",
                    version, self.version
                )));
            }
            let kind = ControlType::from((word & 0xffff) as u16);
            if length == 0 {
                self.control_frame(kind, frame_flags, &[], events)?;
            } else {
                self.state = ParseState::ControlBody {
                    kind,
                    frame_flags,
                    length,
                };
            }
        } else {
            let stream_id = word & MAX_STREAM_ID;
            let fin = frame_flags & flags::FIN != 0;
            if length == 0 {
                events.push(FrameEvent::Data {
                    stream_id,
                    fin,
                    payload: Bytes::new(),
                });
            } else {
                self.state = ParseState::DataBody {
                    stream_id,
                    fin,
                    remaining: length,
                };
            }
        }
        Ok(())
    }

    fn control_frame(
        &mut self,
        kind: ControlType,
        frame_flags: u8,
        body: &[u8],
        events: &mut Vec<FrameEvent>,
    ) -> Result<()> {
        match kind {
            ControlType::SynReply => {
                // SPDY/2 carries two unused bytes between stream id and block.
                let block_at = if self.version == Version::V2 { 6 } else { 4 };
                if body.len() < block_at {
                    return Err(Error::protocol("SYN_REPLY frame too short"));
                }
                let stream_id =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & MAX_STREAM_ID;
                let headers = self.decompressor.decode(&body[block_at..])?;
                events.push(FrameEvent::SynReply {
                    stream_id,
                    fin: frame_flags & flags::FIN != 0,
                    headers,
                });
            }
            ControlType::RstStream => {
                if body.len() < 8 {
                    return Err(Error::protocol("RST_STREAM frame too short"));
                }
                let stream_id =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & MAX_STREAM_ID;
                let status = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                events.push(FrameEvent::RstStream {
                    stream_id,
                    status: RstStatus::from(status),
                });
            }
            ControlType::WindowUpdate => {
                // Not a SPDY/2 frame; skipped like any unknown type there.
                if self.version == Version::V2 {
                    return Ok(());
                }
                if body.len() < 8 {
                    return Err(Error::protocol("WINDOW_UPDATE frame too short"));
                }
                let stream_id =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & MAX_STREAM_ID;
                let delta =
                    u32::from_be_bytes([body[4], body[5], body[6], body[7]]) & MAX_STREAM_ID;
                events.push(FrameEvent::WindowUpdate { stream_id, delta });
            }
            ControlType::Settings => {
                if self.version == Version::V2 {
                    return Ok(());
                }
                if body.len() < 4 {
                    return Err(Error::protocol("SETTINGS frame too short"));
                }
                let count =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                if body.len() != 4 + count * 8 {
                    return Err(Error::protocol("SETTINGS frame length mismatch"));
                }
                let mut initial_window = None;
                for entry in body[4..].chunks_exact(8) {
                    let id = u32::from_be_bytes([0, entry[1], entry[2], entry[3]]);
                    let value =
                        u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);
                    if id == SETTINGS_INITIAL_WINDOW_SIZE {
                        initial_window = Some(value);
                    }
                }
                events.push(FrameEvent::Settings { initial_window });
            }
            // PING, GOAWAY, NOOP, server-push SYN_STREAM, HEADERS, CREDENTIAL
            // and unknown types are skipped by length.
            _ => {}
        }
        Ok(())
    }
}
