//! SPDY protocol version configuration.

/// SPDY protocol version spoken on a connection.
///
/// The version is fixed when the connection is opened and affects the
/// control-frame layout, the width of header-block length fields, and
/// whether per-stream flow control is in effect (SPDY/2 has none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// SPDY/2: 16-bit header-block fields, no flow control.
    V2,
    /// SPDY/3: 32-bit header-block fields, per-stream flow control.
    #[default]
    V3,
}

impl Version {
    /// Version number carried in every control-frame header.
    pub fn wire(&self) -> u16 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Width in bytes of the pair count and length fields inside a
    /// name/value header block.
    pub(crate) fn nv_len_width(&self) -> usize {
        match self {
            Self::V2 => 2,
            Self::V3 => 4,
        }
    }

    /// ALPN protocol identifier offered during the TLS handshake.
    pub fn alpn(&self) -> &'static [u8] {
        match self {
            Self::V2 => b"spdy/2",
            Self::V3 => b"spdy/3",
        }
    }

    /// Get human-readable version string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2 => "spdy/2",
            Self::V3 => "spdy/3",
        }
    }

    /// Whether per-stream flow control applies to this version.
    pub fn has_flow_control(&self) -> bool {
        matches!(self, Self::V3)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
