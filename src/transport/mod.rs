//! Transport layer: the TCP and TLS byte streams beneath the SPDY engine.
//!
//! The engine itself is transport-agnostic (any `AsyncRead + AsyncWrite`
//! works, see [`Connection::with_transport`](crate::Connection::with_transport));
//! this module supplies the default client connector.

pub mod connector;

pub use connector::MaybeTlsStream;
