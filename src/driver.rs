//! The connection engine.
//!
//! One driver task owns everything mutable about a connection: the framer and
//! parser (each with its half of the header codec), the stream table, the
//! outbound write queue, and every per-stream window and half-close flag. All
//! public operations arrive as [`Command`]s on a channel and are executed
//! serially; transport reads and writes are driven by readiness inside a
//! single `select!` loop. The engine itself never blocks on I/O and never
//! invokes application callbacks inline.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::connection::Delivery;
use crate::error::{Error, Result};
use crate::frame::{FrameEvent, Framer, Parser, RstStatus, MAX_DATA_LEN, MAX_STREAM_ID};
use crate::headers::Headers;
use crate::request::RequestInner;
use crate::version::Version;

/// Initial flow-control window, ours and the peer's, until SETTINGS says
/// otherwise.
pub(crate) const INITIAL_WINDOW: i32 = 65536;

const READ_CHUNK: usize = 16384;

/// Operations enqueued by `Connection` and `Request` handles.
pub(crate) enum Command {
    Send(Arc<RequestInner>),
    WriteData {
        request: Arc<RequestInner>,
        data: Bytes,
    },
    End(Arc<RequestInner>),
    Close(Arc<RequestInner>),
}

/// Engine-side state for one live stream.
///
/// An entry exists in the table exactly while neither side has fully closed
/// the stream; both windows are signed because peer SETTINGS may drive
/// `window_out` negative.
struct StreamEntry {
    request: Arc<RequestInner>,
    window_in: i32,
    window_out: i32,
    closed_by_us: bool,
    closed_by_them: bool,
    pending_closed_by_us: bool,
    seen_response: bool,
    data_queue: VecDeque<Bytes>,
}

impl StreamEntry {
    fn new(request: Arc<RequestInner>, window_out: i32) -> Self {
        Self {
            request,
            window_in: INITIAL_WINDOW,
            window_out,
            closed_by_us: false,
            closed_by_them: false,
            pending_closed_by_us: false,
            seen_response: false,
            data_queue: VecDeque::new(),
        }
    }
}

pub(crate) struct Driver<S> {
    version: Version,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    /// Fallback `:host` for requests whose URL has no authority.
    authority: Option<String>,
    framer: Framer,
    parser: Parser,
    command_rx: mpsc::UnboundedReceiver<Command>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    initial_peer_window: i32,
    out_buf: BytesMut,
    closed: bool,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub(crate) fn new(
        version: Version,
        io: S,
        authority: Option<String>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        delivery_tx: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        let (reader, writer) = split(io);
        let mut driver = Self {
            version,
            reader,
            writer,
            authority,
            framer: Framer::new(version),
            parser: Parser::new(version),
            command_rx,
            delivery_tx,
            streams: HashMap::new(),
            next_stream_id: 1,
            initial_peer_window: INITIAL_WINDOW,
            out_buf: BytesMut::with_capacity(READ_CHUNK),
            closed: false,
        };
        if version.has_flow_control() {
            driver.framer.clear();
            driver.framer.initial_settings(INITIAL_WINDOW as u32);
            driver.flush_framer();
        }
        driver
    }

    /// Run until the transport dies, the peer misbehaves, or every handle is
    /// dropped; then tear down whatever is still live.
    pub(crate) async fn run(mut self) {
        let error = match self.run_loop().await {
            Ok(()) => Error::Cancelled,
            Err(error) => error,
        };
        // Best effort: whatever is already serialized (a final RST, a fin)
        // still goes out before the socket closes.
        let _ = self.drain_writer().await;
        self.shutdown(error);
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command)?,
                        // Application dropped the connection and every bound
                        // request; nothing is left to serve.
                        None => return Ok(()),
                    }
                }
                written = self.writer.write(&self.out_buf), if !self.out_buf.is_empty() => {
                    let n = written?;
                    if n == 0 {
                        return Err(Error::Transport(io::ErrorKind::WriteZero.into()));
                    }
                    self.out_buf.advance(n);
                }
                read = self.reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(Error::ConnectionEnd);
                    }
                    let events = self.parser.execute(&chunk[..n])?;
                    for event in events {
                        self.handle_frame(event)?;
                    }
                }
            }
        }
    }

    async fn drain_writer(&mut self) -> io::Result<()> {
        if !self.out_buf.is_empty() {
            let out = self.out_buf.split();
            self.writer.write_all(&out).await?;
        }
        self.writer.shutdown().await
    }

    /// Idempotent connection teardown: every live stream gets one error and
    /// one end callback, then the application gets one connection-level
    /// error. A driver that merely ran out of handles reports nothing.
    fn shutdown(&mut self, error: Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        if error.is_connection_fatal() {
            tracing::warn!(error = %error, "connection failed");
        } else {
            tracing::debug!("connection closed");
        }
        let entries: Vec<StreamEntry> = self.streams.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.request.detach();
            self.post(Delivery::StreamError {
                request: entry.request.clone(),
                error: error.clone(),
            });
            self.post(Delivery::StreamEnd {
                request: entry.request,
            });
        }
        if error.is_connection_fatal() {
            self.post(Delivery::ConnectionError { error });
        }
    }

    fn post(&self, delivery: Delivery) {
        let _ = self.delivery_tx.send(delivery);
    }

    /// Append the framer scratch to the write queue. Frames are contiguous
    /// and FIFO ordered; the select loop pushes them out as the socket
    /// accepts them.
    fn flush_framer(&mut self) {
        self.out_buf.extend_from_slice(self.framer.output());
        self.framer.clear();
    }

    // ---- commands -------------------------------------------------------

    fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Send(request) => self.start_stream(request),
            Command::WriteData { request, data } => self.write_data(&request, data),
            Command::End(request) => {
                self.end_request(&request);
                Ok(())
            }
            Command::Close(request) => {
                self.close_request(&request);
                Ok(())
            }
        }
    }

    fn start_stream(&mut self, request: Arc<RequestInner>) -> Result<()> {
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(Error::protocol("client stream id space exhausted"));
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        let _ = request.stream_id.set(stream_id);

        let host = request
            .url
            .authority()
            .map(|a| a.to_string())
            .or_else(|| self.authority.clone())
            .unwrap_or_default();

        self.framer.clear();
        self.framer.syn_stream(
            stream_id,
            0,
            &request.method,
            &request.url,
            &host,
            &request.headers,
        )?;
        self.flush_framer();

        tracing::debug!(stream_id, method = %request.method, "stream opened");
        self.streams
            .insert(stream_id, StreamEntry::new(request, self.initial_peer_window));
        Ok(())
    }

    fn write_data(&mut self, request: &Arc<RequestInner>, data: Bytes) -> Result<()> {
        let stream_id = match request.stream_id.get() {
            Some(id) => *id,
            None => return Ok(()),
        };
        let accepts = match self.streams.get(&stream_id) {
            Some(entry) => !entry.closed_by_us && !entry.pending_closed_by_us,
            None => false,
        };
        if !accepts {
            return Ok(());
        }
        if !self.version.has_flow_control() {
            self.emit_data(stream_id, false, &data);
            return Ok(());
        }
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.data_queue.push_back(data);
        }
        self.drain_stream(stream_id)
    }

    fn end_request(&mut self, request: &Arc<RequestInner>) {
        let stream_id = match request.stream_id.get() {
            Some(id) => *id,
            None => return,
        };
        let entry = match self.streams.get_mut(&stream_id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.closed_by_us || entry.pending_closed_by_us {
            return;
        }
        if !entry.data_queue.is_empty() {
            // The fin has to wait behind flow-controlled data; it fires when
            // the queue next drains dry.
            entry.pending_closed_by_us = true;
            return;
        }
        self.finish_stream(stream_id);
    }

    fn close_request(&mut self, request: &Arc<RequestInner>) {
        let stream_id = match request.stream_id.get() {
            Some(id) => *id,
            None => return,
        };
        let send_rst = match self.streams.get(&stream_id) {
            Some(entry) => !entry.closed_by_us,
            None => return,
        };
        if send_rst {
            self.framer.clear();
            self.framer.rst_stream(stream_id, RstStatus::Cancel);
            self.flush_framer();
        }
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.request.detach();
        }
        tracing::debug!(stream_id, "stream cancelled");
    }

    // ---- outbound data and half-close -----------------------------------

    fn emit_data(&mut self, stream_id: u32, fin: bool, payload: &[u8]) {
        self.framer.clear();
        if payload.len() <= MAX_DATA_LEN {
            self.framer.data(stream_id, fin, payload);
        } else {
            let mut chunks = payload.chunks(MAX_DATA_LEN).peekable();
            while let Some(chunk) = chunks.next() {
                self.framer.data(stream_id, fin && chunks.peek().is_none(), chunk);
            }
        }
        self.flush_framer();
    }

    /// Send queued data while `window_out` allows, then fire a deferred
    /// half-close if the queue ran dry.
    fn drain_stream(&mut self, stream_id: u32) -> Result<()> {
        loop {
            let chunk = {
                let entry = match self.streams.get_mut(&stream_id) {
                    Some(entry) => entry,
                    None => return Ok(()),
                };
                if entry.window_out <= 0 || entry.data_queue.is_empty() {
                    None
                } else {
                    let mut front = match entry.data_queue.pop_front() {
                        Some(front) => front,
                        None => return Ok(()),
                    };
                    let allow = entry.window_out as usize;
                    if front.len() > allow {
                        let rest = front.split_off(allow);
                        entry.data_queue.push_front(rest);
                    }
                    entry.window_out -= front.len() as i32;
                    Some(front)
                }
            };
            match chunk {
                Some(chunk) => self.emit_data(stream_id, false, &chunk),
                None => break,
            }
        }

        let fire_end = match self.streams.get_mut(&stream_id) {
            Some(entry) if entry.pending_closed_by_us && entry.data_queue.is_empty() => {
                entry.pending_closed_by_us = false;
                true
            }
            _ => false,
        };
        if fire_end {
            self.finish_stream(stream_id);
        }
        Ok(())
    }

    /// Emit our fin, mark the half-close, and tear the stream down if the
    /// peer is already done.
    fn finish_stream(&mut self, stream_id: u32) {
        self.emit_data(stream_id, true, &[]);
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.closed_by_us = true;
        }
        self.try_teardown(stream_id);
    }

    /// Remove the stream once both sides have half-closed. Safe to attempt
    /// any number of times; once the entry is gone this is a no-op.
    fn try_teardown(&mut self, stream_id: u32) {
        let done = match self.streams.get(&stream_id) {
            Some(entry) => entry.closed_by_us && entry.closed_by_them,
            None => false,
        };
        if !done {
            return;
        }
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.request.detach();
            self.post(Delivery::StreamEnd {
                request: entry.request,
            });
            tracing::debug!(stream_id, "stream complete");
        }
    }

    // ---- inbound dispatch -----------------------------------------------

    fn handle_frame(&mut self, event: FrameEvent) -> Result<()> {
        match event {
            FrameEvent::SynReply {
                stream_id,
                fin,
                headers,
            } => self.on_syn_reply(stream_id, fin, headers),
            FrameEvent::Data {
                stream_id,
                fin,
                payload,
            } => self.on_data(stream_id, fin, payload),
            FrameEvent::RstStream { stream_id, status } => {
                self.on_rst_stream(stream_id, status);
                Ok(())
            }
            FrameEvent::WindowUpdate { stream_id, delta } => {
                self.on_window_update(stream_id, delta)
            }
            FrameEvent::Settings { initial_window } => self.on_settings(initial_window),
        }
    }

    fn on_syn_reply(&mut self, stream_id: u32, fin: bool, headers: Headers) -> Result<()> {
        let (request, double) = match self.streams.get_mut(&stream_id) {
            None => return self.unknown_stream(stream_id),
            Some(entry) => {
                let double = entry.seen_response;
                entry.seen_response = true;
                (entry.request.clone(), double)
            }
        };

        if double {
            tracing::warn!(stream_id, "second SYN_REPLY on stream");
            self.framer.clear();
            self.framer.rst_stream(stream_id, RstStatus::ProtocolError);
            self.flush_framer();
            if let Some(entry) = self.streams.remove(&stream_id) {
                entry.request.detach();
            }
            self.post(Delivery::StreamError {
                request: request.clone(),
                error: Error::DoubleResponse,
            });
            self.post(Delivery::StreamEnd { request });
            return Ok(());
        }

        self.post(Delivery::Response { request, headers });
        // The response unblocks anything queued while the stream was young.
        self.drain_stream(stream_id)?;
        if fin {
            self.peer_half_closed(stream_id);
        }
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, fin: bool, payload: Bytes) -> Result<()> {
        if !self.streams.contains_key(&stream_id) {
            return self.unknown_stream(stream_id);
        }

        if self.version.has_flow_control() {
            let mut grant = None;
            if let Some(entry) = self.streams.get_mut(&stream_id) {
                entry.window_in -= payload.len() as i32;
                if entry.window_in <= 0 {
                    // Refill to the full initial window in one credit.
                    let delta = INITIAL_WINDOW - entry.window_in;
                    entry.window_in += delta;
                    grant = Some(delta as u32);
                }
            }
            if let Some(delta) = grant {
                self.framer.clear();
                self.framer.window_update(stream_id, delta);
                self.flush_framer();
            }
        }

        if !payload.is_empty() {
            if let Some(entry) = self.streams.get(&stream_id) {
                self.post(Delivery::Data {
                    request: entry.request.clone(),
                    data: payload,
                });
            }
        }
        if fin {
            self.peer_half_closed(stream_id);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, stream_id: u32, status: RstStatus) {
        // An unknown stream id here is stale, not an error; in particular we
        // never answer a RST with a RST.
        let entry = match self.streams.remove(&stream_id) {
            Some(entry) => entry,
            None => return,
        };
        tracing::debug!(stream_id, status = %status, "stream reset by peer");
        entry.request.detach();
        self.post(Delivery::StreamError {
            request: entry.request.clone(),
            error: Error::RstStream(status),
        });
        self.post(Delivery::StreamEnd {
            request: entry.request,
        });
    }

    fn on_window_update(&mut self, stream_id: u32, delta: u32) -> Result<()> {
        // Stream 0 is the session scope; this client keeps per-stream
        // windows only. Credits for unknown streams are stale, not fatal.
        if stream_id == 0 {
            return Ok(());
        }
        let positive = match self.streams.get_mut(&stream_id) {
            Some(entry) => {
                entry.window_out = entry.window_out.saturating_add(delta as i32);
                entry.window_out > 0
            }
            None => false,
        };
        if positive {
            self.drain_stream(stream_id)?;
        }
        Ok(())
    }

    fn on_settings(&mut self, initial_window: Option<u32>) -> Result<()> {
        let new_window = match initial_window {
            Some(w) if w <= MAX_STREAM_ID => w as i32,
            _ => return Ok(()),
        };
        let delta = new_window - self.initial_peer_window;
        self.initial_peer_window = new_window;
        if delta == 0 {
            return Ok(());
        }
        tracing::debug!(new_window, delta, "peer changed initial window");
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in ids {
            let positive = match self.streams.get_mut(&stream_id) {
                Some(entry) => {
                    entry.window_out = entry.window_out.saturating_add(delta);
                    entry.window_out > 0
                }
                None => false,
            };
            if positive {
                self.drain_stream(stream_id)?;
            }
        }
        Ok(())
    }

    fn peer_half_closed(&mut self, stream_id: u32) {
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.closed_by_them = true;
        }
        self.try_teardown(stream_id);
    }

    /// SYN_REPLY or DATA for a stream we do not know: reset it for the peer's
    /// benefit, then give up on the connection.
    fn unknown_stream(&mut self, stream_id: u32) -> Result<()> {
        self.framer.clear();
        self.framer.rst_stream(stream_id, RstStatus::ProtocolError);
        self.flush_framer();
        Err(Error::protocol(format!(
            "frame for unknown stream {stream_id}"
        )))
    }
}
