//! HTTP Upgrade handshake.
//!
//! # Responsibilities
//! - Validate upgrade headers and the declared origin
//! - Compute `Sec-WebSocket-Accept`
//! - Take ownership of the socket through a dispatcher capability
//!
//! # Data Flow
//! ```text
//! request headers
//!     → validate() (400 / 403 on failure, socket untouched)
//!     → SocketTakeover present? (500 if not, socket untouched)
//!     → take_over(accept) → owned socket → Connection
//! ```
//!
//! # Design Decisions
//! - Every rejection happens before ownership is taken, so failures still
//!   travel through the ordinary HTTP response path
//! - Two takeover flavours: hyper's upgrade future (hyper emits the 101 the
//!   handler returns) and a raw stream (the 101 is written here, bypassing
//!   any buffered response writer)

use std::future::Future;
use std::io;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// Reasons an upgrade request is refused before the socket is taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("upgrade required: {0}")]
    UpgradeRequired(&'static str),

    #[error("origin {0:?} is not allowed")]
    OriginRejected(String),

    #[error("connection does not support socket takeover")]
    UpgradeUnsupported,

    #[error("no endpoint registered at {0}")]
    UnknownEndpoint(String),
}

impl HandshakeError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::UpgradeRequired(_) => StatusCode::BAD_REQUEST,
            HandshakeError::OriginRejected(_) => StatusCode::FORBIDDEN,
            HandshakeError::UpgradeUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            HandshakeError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Short label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::UpgradeRequired(_) => "upgrade_required",
            HandshakeError::OriginRejected(_) => "origin_rejected",
            HandshakeError::UpgradeUnsupported => "upgrade_unsupported",
            HandshakeError::UnknownEndpoint(_) => "unknown_endpoint",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Capability to take raw ownership of the socket behind a request.
///
/// Implementations are responsible for the `101 Switching Protocols` bytes
/// reaching the peer before the returned stream is used for frames.
pub trait SocketTakeover: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn take_over(self, accept: String) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

/// Takeover through hyper's upgrade mechanism.
///
/// The 101 response is the one the HTTP handler returns (see
/// [`switching_protocols`]); the future resolves once hyper has flushed it
/// and released the connection.
pub struct HyperUpgrade(pub OnUpgrade);

impl HyperUpgrade {
    /// Remove the upgrade capability from a request's extensions, if the
    /// serving connection offers one.
    pub fn from_extensions(extensions: &mut axum::http::Extensions) -> Option<Self> {
        extensions.remove::<OnUpgrade>().map(HyperUpgrade)
    }
}

impl SocketTakeover for HyperUpgrade {
    type Io = TokioIo<hyper::upgrade::Upgraded>;

    async fn take_over(self, _accept: String) -> io::Result<Self::Io> {
        let upgraded = self.0.await.map_err(io::Error::other)?;
        Ok(TokioIo::new(upgraded))
    }
}

/// Takeover of a stream the dispatcher already owns outright.
///
/// The 101 response is written directly onto the stream.
pub struct RawSocket<S>(pub S);

impl<S> SocketTakeover for RawSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = S;

    async fn take_over(self, accept: String) -> io::Result<S> {
        let mut socket = self.0;
        write_switching_protocols(&mut socket, &accept).await?;
        Ok(socket)
    }
}

/// Compute the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Validate an upgrade request and return the accept token.
///
/// An empty `allowed_origins` disables the origin check; otherwise the
/// `Origin` header must match an entry exactly or an entry must be `*`.
pub fn validate(headers: &HeaderMap, allowed_origins: &[String]) -> Result<String, HandshakeError> {
    let upgrade = header_str(headers, header::UPGRADE);
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::UpgradeRequired("Upgrade header must be websocket"));
    }

    let connection = header_str(headers, header::CONNECTION);
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::UpgradeRequired("Connection header must contain upgrade"));
    }

    let version = header_str(headers, header::SEC_WEBSOCKET_VERSION);
    if version.trim() != SUPPORTED_VERSION {
        return Err(HandshakeError::UpgradeRequired("Sec-WebSocket-Version must be 13"));
    }

    let key = header_str(headers, header::SEC_WEBSOCKET_KEY).trim();
    match BASE64.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => {
            return Err(HandshakeError::UpgradeRequired(
                "Sec-WebSocket-Key must be a base64 encoded 16 byte nonce",
            ))
        }
    }

    if !allowed_origins.is_empty() {
        let origin = header_str(headers, header::ORIGIN);
        let allowed = allowed_origins
            .iter()
            .any(|entry| entry == "*" || entry == origin);
        if !allowed {
            return Err(HandshakeError::OriginRejected(origin.to_string()));
        }
    }

    Ok(accept_key(key))
}

/// Raw `101 Switching Protocols` response head.
pub fn switching_protocols_head(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// Write the 101 response head straight onto an owned socket.
pub async fn write_switching_protocols<S>(socket: &mut S, accept: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(switching_protocols_head(accept).as_bytes()).await?;
    socket.flush().await
}

/// The 101 response an HTTP handler returns when hyper performs the takeover.
pub fn switching_protocols(accept: &str) -> Response {
    let accept = match HeaderValue::from_str(accept) {
        Ok(value) => value,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
