//! A mock SPDY server for exercising the client at the frame level.
//!
//! The "server" is the far end of an in-memory duplex pipe. Tests script it
//! inline: read the client's frames with [`SpdyPeer::read_frame`] and inject
//! byte-exact responses with the `send_*` helpers. Header blocks pass through
//! real stateful codecs, one per direction, exactly as a remote peer's would.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use spindle::headers::Headers;
use spindle::zlib::{HeaderCompressor, HeaderDecompressor};
use spindle::Version;

/// One raw frame as read off the wire.
#[derive(Debug)]
pub struct Frame {
    pub control: bool,
    /// Control type, or 0 for data frames.
    pub kind: u16,
    pub flags: u8,
    /// Stream id for data frames (control frames carry it in the payload).
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Stream id from the first payload word of a control frame.
    pub fn control_stream_id(&self) -> u32 {
        u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]) & 0x7fff_ffff
    }
}

pub struct SpdyPeer {
    io: DuplexStream,
    version: Version,
    compressor: HeaderCompressor,
    decompressor: HeaderDecompressor,
}

#[allow(dead_code)]
impl SpdyPeer {
    /// Create a peer and the transport to hand to `Connection::with_transport`.
    pub fn new(version: Version) -> (SpdyPeer, DuplexStream) {
        let (server_io, client_io) = tokio::io::duplex(1 << 20);
        (
            SpdyPeer {
                io: server_io,
                version,
                compressor: HeaderCompressor::new(version),
                decompressor: HeaderDecompressor::new(version),
            },
            client_io,
        )
    }

    /// Read the next complete frame from the client.
    pub async fn read_frame(&mut self) -> std::io::Result<Frame> {
        let mut header = [0u8; 8];
        self.io.read_exact(&mut header).await?;
        let word = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_be_bytes([0, header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; length];
        self.io.read_exact(&mut payload).await?;

        let control = word & 0x8000_0000 != 0;
        Ok(Frame {
            control,
            kind: if control { (word & 0xffff) as u16 } else { 0 },
            flags: header[4],
            stream_id: if control { 0 } else { word & 0x7fff_ffff },
            payload: Bytes::from(payload),
        })
    }

    /// Read a frame and assert it is a SYN_STREAM; returns the stream id and
    /// the decoded header block.
    pub async fn read_syn_stream(&mut self) -> std::io::Result<(u32, Headers)> {
        let frame = self.read_frame().await?;
        assert!(frame.control && frame.kind == 1, "expected SYN_STREAM, got {frame:?}");
        let stream_id = frame.control_stream_id();
        let headers = self
            .decompressor
            .decode(&frame.payload[10..])
            .expect("SYN_STREAM header block");
        Ok((stream_id, headers))
    }

    /// Read a frame and assert it is the connect-time SETTINGS.
    pub async fn read_initial_settings(&mut self) -> std::io::Result<()> {
        let frame = self.read_frame().await?;
        assert!(frame.control && frame.kind == 4, "expected SETTINGS, got {frame:?}");
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.write_all(bytes).await
    }

    fn control_header(&self, buf: &mut BytesMut, kind: u16, flags: u8, length: usize) {
        use bytes::BufMut;
        buf.put_u16(0x8000 | self.version.wire());
        buf.put_u16(kind);
        buf.put_u8(flags);
        buf.put_uint(length as u64, 3);
    }

    pub async fn send_syn_reply(
        &mut self,
        stream_id: u32,
        fin: bool,
        headers: &Headers,
    ) -> std::io::Result<()> {
        use bytes::BufMut;
        let block = self.compressor.encode(headers).expect("encode SYN_REPLY");
        let mut buf = BytesMut::new();
        let unused = if self.version == Version::V2 { 2 } else { 0 };
        self.control_header(&mut buf, 2, if fin { 1 } else { 0 }, 4 + unused + block.len());
        buf.put_u32(stream_id);
        buf.put_bytes(0, unused);
        buf.extend_from_slice(&block);
        self.send(&buf).await
    }

    pub async fn send_data(&mut self, stream_id: u32, fin: bool, payload: &[u8]) -> std::io::Result<()> {
        use bytes::BufMut;
        let mut buf = BytesMut::new();
        buf.put_u32(stream_id);
        buf.put_u8(if fin { 1 } else { 0 });
        buf.put_uint(payload.len() as u64, 3);
        buf.extend_from_slice(payload);
        self.send(&buf).await
    }

    pub async fn send_rst_stream(&mut self, stream_id: u32, status: u32) -> std::io::Result<()> {
        use bytes::BufMut;
        let mut buf = BytesMut::new();
        self.control_header(&mut buf, 3, 0, 8);
        buf.put_u32(stream_id);
        buf.put_u32(status);
        self.send(&buf).await
    }

    pub async fn send_window_update(&mut self, stream_id: u32, delta: u32) -> std::io::Result<()> {
        use bytes::BufMut;
        let mut buf = BytesMut::new();
        self.control_header(&mut buf, 9, 0, 8);
        buf.put_u32(stream_id);
        buf.put_u32(delta);
        self.send(&buf).await
    }

    pub async fn send_settings_initial_window(&mut self, window: u32) -> std::io::Result<()> {
        use bytes::BufMut;
        let mut buf = BytesMut::new();
        self.control_header(&mut buf, 4, 0, 12);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_uint(7, 3);
        buf.put_u32(window);
        self.send(&buf).await
    }

    /// Send a PING; the client is expected to ignore it.
    pub async fn send_ping(&mut self, id: u32) -> std::io::Result<()> {
        use bytes::BufMut;
        let mut buf = BytesMut::new();
        self.control_header(&mut buf, 6, 0, 4);
        buf.put_u32(id);
        self.send(&buf).await
    }

    /// Assert the client sends nothing for `millis`.
    pub async fn expect_silence(&mut self, millis: u64) {
        let quiet = tokio::time::timeout(
            std::time::Duration::from_millis(millis),
            self.read_frame(),
        )
        .await;
        assert!(quiet.is_err(), "expected silence, got {:?}", quiet.unwrap());
    }
}
