//! # Spindle
//!
//! A SPDY/2 and SPDY/3 client: many concurrent request streams multiplexed
//! over one TCP (optionally TLS) connection, with per-stream flow control,
//! zlib header compression, and graceful or abrupt stream shutdown.
//!
//! All protocol state lives on a single background task per connection;
//! `Connection` and `Request` handles enqueue work onto it and results come
//! back through delegate callbacks on a separate delivery task, so
//! application code can never stall frame processing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use spindle::{Connection, Headers, Request, Version};
//!
//! # struct Printer;
//! # impl spindle::RequestDelegate for Printer {
//! #     fn on_response(&self, headers: Headers) { println!("{headers:?}"); }
//! #     fn on_data(&self, data: bytes::Bytes) { println!("{} bytes", data.len()); }
//! #     fn on_error(&self, error: spindle::Error) { eprintln!("{error}"); }
//! #     fn on_end(&self) {}
//! # }
//! # async fn example() -> spindle::Result<()> {
//! let conn = Connection::open(Version::V3, "example.com", 443, true).await?;
//!
//! let request = Request::new(
//!     http::Method::GET,
//!     "https://example.com/".parse().unwrap(),
//!     Headers::new(),
//! );
//! request.set_delegate(Arc::new(Printer));
//! conn.send(&request)?;
//! request.end();
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod connection;
pub mod error;
pub mod frame;
pub mod headers;
pub mod request;
pub mod version;
pub mod zlib;

// Transport layer
pub mod transport;

// The connection engine task
mod driver;

// Re-exports for convenient access
pub use connection::{Connection, ConnectionBuilder, ConnectionDelegate};
pub use error::{Error, Result};
pub use frame::RstStatus;
pub use headers::Headers;
pub use request::{Request, RequestDelegate};
pub use version::Version;
