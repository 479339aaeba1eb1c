//! SPDY connection handle.
//!
//! The handle enqueues commands onto a driver task that owns all protocol
//! state; callbacks come back through a separate delivery task so slow
//! application code can never stall frame processing.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::request::{Request, RequestInner};
use crate::transport::connector;
use crate::version::Version;

/// Connection-level callbacks.
pub trait ConnectionDelegate: Send + Sync {
    /// The connection failed; every live stream has already received its own
    /// error and end callbacks.
    fn on_connection_error(&self, error: Error);
}

/// A SPDY connection to one remote endpoint.
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

pub(crate) struct ConnectionShared {
    version: Version,
    command_tx: mpsc::UnboundedSender<crate::driver::Command>,
    delegate: Mutex<Option<Arc<dyn ConnectionDelegate>>>,
}

impl ConnectionShared {
    pub(crate) fn delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate.lock().unwrap().clone()
    }
}

impl Connection {
    /// Connect to a remote server and start the connection engine.
    pub async fn open(version: Version, host: &str, port: u16, secure: bool) -> Result<Connection> {
        Self::builder(version).secure(secure).open(host, port).await
    }

    /// Builder for connections needing a connect timeout or explicit TLS
    /// choice.
    pub fn builder(version: Version) -> ConnectionBuilder {
        ConnectionBuilder {
            version,
            secure: true,
            connect_timeout: None,
        }
    }

    /// Run the connection engine over a transport the caller already holds
    /// (an established TLS session, a proxied tunnel, an in-memory pipe in
    /// tests). Requests must then carry absolute URLs so SYN_STREAM can name
    /// the host.
    pub fn with_transport<S>(version: Version, io: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(version, io, None)
    }

    fn spawn<S>(version: Version, io: S, authority: Option<String>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ConnectionShared {
            version,
            command_tx,
            delegate: Mutex::new(None),
        });

        tokio::spawn(deliver(delivery_rx, Arc::downgrade(&shared)));
        tokio::spawn(Driver::new(version, io, authority, command_rx, delivery_tx).run());

        Connection { shared }
    }

    /// Install the delegate receiving connection-level errors.
    pub fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(delegate);
    }

    /// Protocol version this connection speaks.
    pub fn version(&self) -> Version {
        self.shared.version
    }

    /// Send a request over this connection: a stream id is assigned, the
    /// SYN_STREAM goes out, and the request joins the stream table. Fails
    /// with [`Error::AlreadySent`] if the request is already bound.
    pub fn send(&self, request: &Request) -> Result<()> {
        request.inner.bind(self.shared.command_tx.clone())?;
        if self
            .shared
            .command_tx
            .send(crate::driver::Command::Send(request.inner.clone()))
            .is_err()
        {
            request.inner.detach();
            return Err(Error::ConnectionEnd);
        }
        Ok(())
    }
}

/// Builder returned by [`Connection::builder`].
pub struct ConnectionBuilder {
    version: Version,
    secure: bool,
    connect_timeout: Option<Duration>,
}

impl ConnectionBuilder {
    /// Use TLS for the transport (the default). ALPN offers the version's
    /// SPDY protocol identifier.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Bound the TCP + TLS establishment; `open` fails with a timeout error
    /// when exceeded.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Connect and start the engine.
    pub async fn open(self, host: &str, port: u16) -> Result<Connection> {
        let connect = connector::connect(self.version, host, port, self.secure);
        let io = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {host}:{port} timed out"),
                    ))
                })??,
            None => connect.await?,
        };
        tracing::debug!(host, port, version = %self.version, "connection opened");
        Ok(Connection::spawn(self.version, io, Some(host.to_string())))
    }
}

/// Event posted by the driver for the delivery task.
pub(crate) enum Delivery {
    Response {
        request: Arc<RequestInner>,
        headers: Headers,
    },
    Data {
        request: Arc<RequestInner>,
        data: Bytes,
    },
    StreamError {
        request: Arc<RequestInner>,
        error: Error,
    },
    StreamEnd {
        request: Arc<RequestInner>,
    },
    ConnectionError {
        error: Error,
    },
}

/// The application-side executor: drains deliveries in FIFO order and invokes
/// delegate callbacks. Runs until the driver drops its sender.
pub(crate) async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    conn: Weak<ConnectionShared>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Response { request, headers } => {
                if let Some(delegate) = request.delegate() {
                    delegate.on_response(headers);
                }
            }
            Delivery::Data { request, data } => {
                if let Some(delegate) = request.delegate() {
                    delegate.on_data(data);
                }
            }
            Delivery::StreamError { request, error } => {
                if let Some(delegate) = request.delegate() {
                    delegate.on_error(error);
                }
            }
            Delivery::StreamEnd { request } => {
                if let Some(delegate) = request.delegate() {
                    delegate.on_end();
                }
            }
            Delivery::ConnectionError { error } => {
                if let Some(shared) = conn.upgrade() {
                    if let Some(delegate) = shared.delegate() {
                        delegate.on_connection_error(error);
                    }
                }
            }
        }
    }
}
