use std::error::Error;
use std::fmt;

/// Errors that can terminate a [`crate::session::Session`] or the listener itself.
///
/// Per-request upstream failures are not represented here: they are converted
/// into synthesized HTTP responses by [`crate::response::http_error`] and never
/// propagate out of the request loop.
#[derive(Debug)]
pub enum ProxyError {
    BindFailed(std::io::Error),
    AcceptFatal(std::io::Error),
    ParseFailed(String),
    InvalidProtocol,
    TlsHandshakeFailed(std::io::Error),
    UpstreamFailed(String),
    UpstreamBuildFailed(String),
    MissingClient,
    InvalidAuthority(String),
    Io(std::io::Error),
    /// An I/O error while writing a response head or body that had already
    /// started landing on the client socket. Unlike [`ProxyError::UpstreamFailed`]
    /// and [`ProxyError::UpstreamBuildFailed`], which fire before any byte of
    /// the response has been written and so are safe to convert into a
    /// synthesized error response, this one means framing on the wire may
    /// already be underway — writing a second response on top of it would
    /// corrupt the client's view of the stream, so the session just
    /// terminates instead (see `Session::run`).
    ResponseWriteFailed(std::io::Error),
}

impl Error for ProxyError {}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::BindFailed(e) => write!(f, "failed to bind listener: {e}"),
            ProxyError::AcceptFatal(e) => write!(f, "accept failed: {e}"),
            ProxyError::ParseFailed(msg) => write!(f, "failed to parse request: {msg}"),
            ProxyError::InvalidProtocol => {
                write!(f, "expected a TLS handshake after CONNECT")
            }
            ProxyError::TlsHandshakeFailed(e) => write!(f, "TLS handshake failed: {e}"),
            ProxyError::UpstreamFailed(msg) => write!(f, "upstream request failed: {msg}"),
            ProxyError::UpstreamBuildFailed(msg) => {
                write!(f, "failed to build upstream request: {msg}")
            }
            ProxyError::MissingClient => write!(f, "no upstream client configured"),
            ProxyError::InvalidAuthority(msg) => write!(f, "invalid root authority: {msg}"),
            ProxyError::Io(e) => write!(f, "io error: {e}"),
            ProxyError::ResponseWriteFailed(e) => {
                write!(f, "failed writing response to client: {e}")
            }
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(value: std::io::Error) -> Self {
        ProxyError::Io(value)
    }
}
