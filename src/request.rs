//! Request objects and the per-request delegate surface.
//!
//! A `Request` is constructed inert, bound to a connection by
//! [`Connection::send`](crate::Connection::send), and from then on routes
//! `write`/`end`/`close` through the connection's serial command channel. The
//! back-reference to the connection is cleared when the stream is torn down,
//! so late calls from application code degrade to no-ops.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use http::{Method, Uri};
use tokio::sync::mpsc;

use crate::driver::Command;
use crate::error::{Error, Result};
use crate::headers::Headers;

/// Callbacks delivered for a single request, posted from the connection's
/// delivery task in the order the engine observed the events: response
/// headers, then data, then either error-and-end or end.
pub trait RequestDelegate: Send + Sync {
    /// Response headers arrived (SYN_REPLY).
    fn on_response(&self, headers: Headers);
    /// A chunk of response body arrived.
    fn on_data(&self, data: Bytes);
    /// The stream failed; `on_end` still follows.
    fn on_error(&self, error: Error);
    /// No further callbacks will be delivered for this request.
    fn on_end(&self);
}

/// One logical request/response exchange over a SPDY connection.
#[derive(Clone)]
pub struct Request {
    pub(crate) inner: Arc<RequestInner>,
}

pub(crate) struct RequestInner {
    pub(crate) method: Method,
    pub(crate) url: Uri,
    pub(crate) headers: Headers,
    pub(crate) stream_id: OnceLock<u32>,
    delegate: Mutex<Option<Arc<dyn RequestDelegate>>>,
    conn: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Request {
    /// Create a request; it does nothing until passed to
    /// [`Connection::send`](crate::Connection::send).
    pub fn new(method: Method, url: Uri, headers: Headers) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                method,
                url,
                headers,
                stream_id: OnceLock::new(),
                delegate: Mutex::new(None),
                conn: Mutex::new(None),
            }),
        }
    }

    /// Install the delegate receiving this request's callbacks. Set it
    /// before sending; events delivered earlier are dropped.
    pub fn set_delegate(&self, delegate: Arc<dyn RequestDelegate>) {
        *self.inner.delegate.lock().unwrap() = Some(delegate);
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn url(&self) -> &Uri {
        &self.inner.url
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Stream id assigned when the request was sent.
    pub fn stream_id(&self) -> Option<u32> {
        self.inner.stream_id.get().copied()
    }

    /// Queue body bytes for the stream. A no-op if the request was never
    /// sent, already half-closed by us, or already torn down.
    pub fn write(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.inner.dispatch(Command::WriteData {
            request: self.inner.clone(),
            data,
        });
    }

    /// Write string to the underlying stream.
    pub fn write_str(&self, data: &str) {
        self.write(Bytes::copy_from_slice(data.as_bytes()));
    }

    /// Gracefully half-close our side of the stream. Queued data still
    /// drains under flow control before the fin frame goes out.
    pub fn end(&self) {
        self.inner.dispatch(Command::End(self.inner.clone()));
    }

    /// Abort the stream; the peer sees RST_STREAM(CANCEL) unless we had
    /// already half-closed. No further callbacks are delivered.
    pub fn close(&self) {
        self.inner.dispatch(Command::Close(self.inner.clone()));
    }
}

impl RequestInner {
    /// Bind this request to a connection's command channel. Fails if the
    /// request was already sent somewhere.
    pub(crate) fn bind(&self, tx: mpsc::UnboundedSender<Command>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        if conn.is_some() {
            return Err(Error::AlreadySent);
        }
        *conn = Some(tx);
        Ok(())
    }

    /// Clear the connection back-reference; later `write`/`end`/`close`
    /// calls find nothing and drop out.
    pub(crate) fn detach(&self) {
        *self.conn.lock().unwrap() = None;
    }

    pub(crate) fn delegate(&self) -> Option<Arc<dyn RequestDelegate>> {
        self.delegate.lock().unwrap().clone()
    }

    fn dispatch(&self, command: Command) {
        let conn = self.conn.lock().unwrap();
        if let Some(tx) = conn.as_ref() {
            // The driver going away mid-call is indistinguishable from a
            // teardown that has not reached us yet; drop the command.
            let _ = tx.send(command);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("url", &self.inner.url)
            .field("stream_id", &self.inner.stream_id.get())
            .finish()
    }
}
