use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use httparse::{EMPTY_HEADER, Status};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::ca::{ImpersonationCache, normalize_host};
use crate::client::{self as upstream, Client};
use crate::error::ProxyError;
use crate::peek::ReplayStream;
use crate::response::{RequestContext, ResponseHead, http_error};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// How long a session will wait for a new request (or the rest of one
/// already in progress) before giving up. Generous enough for a real client
/// on a slow link, tight enough to bound a slowloris-style idle connection.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A duplex, owned byte stream -- a raw `TcpStream` to start, a
/// `tokio_rustls` server stream after a successful `CONNECT` upgrade.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

#[derive(Debug, Clone)]
struct RequestHead {
    method: String,
    target: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Headers that are meaningful only for the hop between client and proxy and
/// must never be forwarded to the origin. The source this behavior was
/// distilled from also filters a misspelled `Prxoy-Authenticate`; kept here
/// for bug-compatibility (see DESIGN.md).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-authenticate",
    "prxoy-authenticate",
    "proxy-connection",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// One accepted connection's full proxy lifecycle: CONNECT tunneling with TLS
/// impersonation, or direct HTTP forwarding, looping until EOF or a
/// non-recoverable error.
pub struct Session {
    peer_addr: SocketAddr,
    cache: Arc<ImpersonationCache>,
    client: Arc<dyn Client>,
    secure: bool,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, cache: Arc<ImpersonationCache>, client: Arc<dyn Client>) -> Self {
        Session {
            peer_addr,
            cache,
            client,
            secure: false,
        }
    }

    pub async fn run(mut self, stream: TcpStream) -> Result<(), ProxyError> {
        let mut current: Box<dyn Stream> = Box::new(stream);
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let parsed = tokio::time::timeout(
                IDLE_READ_TIMEOUT,
                read_request(current.as_mut(), &mut carry),
            )
            .await
            .map_err(|_| ProxyError::ParseFailed("idle timeout waiting for request".into()))??;
            let (head, body) = match parsed {
                None => return Ok(()),
                Some(v) => v,
            };

            if head.method.eq_ignore_ascii_case("CONNECT") {
                if self.secure {
                    // A client should never CONNECT again through an already
                    // tunneled stream; treat it as a protocol violation.
                    return Err(ProxyError::InvalidProtocol);
                }
                let host = connect_host(&head.target);
                info!(peer = %self.peer_addr, host = %host, "CONNECT");

                write_all(current.as_mut(), connect_established(head.version_minor).as_bytes())
                    .await?;

                let (raw, prefix) = peek_tls_prefix(current, carry).await?;
                let tls_config = self
                    .cache
                    .tls_config_for_host(&host)
                    .await
                    .map_err(|e| ProxyError::InvalidAuthority(e.to_string()))?;

                let acceptor = TlsAcceptor::from(tls_config);
                let replay = ReplayStream::new(raw, prefix);
                let tls = acceptor
                    .accept(replay)
                    .await
                    .map_err(ProxyError::TlsHandshakeFailed)?;

                current = Box::new(tls);
                carry = Vec::new();
                self.secure = true;
                continue;
            }

            if let Err(err) = self.handle_http(current.as_mut(), &head, body).await {
                warn!(peer = %self.peer_addr, error = %err, "request failed");
                match err {
                    // Nothing has been written to the client yet at this
                    // point -- it is safe to synthesize a response in place
                    // of the one that couldn't be built or dispatched.
                    ProxyError::UpstreamBuildFailed(_) | ProxyError::UpstreamFailed(_) => {
                        let status = match err {
                            ProxyError::UpstreamBuildFailed(_) => 400,
                            _ => 500,
                        };
                        let ctx = RequestContext::new(head.version_minor, &head.headers);
                        let (resp_head, resp_body) = http_error(&ctx, status, &err.to_string());
                        let mut out = Vec::new();
                        resp_head.write_head(&mut out);
                        out.extend_from_slice(&resp_body);
                        write_all(current.as_mut(), &out).await?;
                    }
                    // The response head or body was already (at least
                    // partially) written to the client socket when this
                    // failed. Writing a second response on top of it would
                    // corrupt HTTP/1.1 framing, so the session just ends
                    // instead of trying to recover in-band.
                    other => return Err(other),
                }
            }
        }
    }

    async fn handle_http(
        &self,
        stream: &mut dyn Stream,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<(), ProxyError> {
        let started = std::time::Instant::now();
        let scheme = if self.secure { "https" } else { "http" };
        let absolute_uri = resolve_uri(scheme, head)?;

        let (body, decoded) = decode_request_body(head, body)?;

        let mut outbound_headers: Vec<(String, String)> = head
            .headers
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k))
            .cloned()
            .collect();
        if decoded {
            for (k, v) in outbound_headers.iter_mut() {
                if k.eq_ignore_ascii_case("content-encoding") {
                    *v = "identity".to_string();
                }
            }
        }
        // The body we hand upstream may differ in length from whatever the
        // client declared (decompressed here, or dechunked in `read_request`),
        // so the declared length is recomputed rather than forwarded verbatim.
        outbound_headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        outbound_headers.push(("Content-Length".to_string(), body.len().to_string()));

        let outbound = upstream::Request {
            method: head.method.clone(),
            uri: absolute_uri,
            version_minor: head.version_minor,
            headers: outbound_headers,
            body,
        };

        debug!(method = %outbound.method, uri = %outbound.uri, "dispatching to client");
        let response = self
            .client
            .call(outbound)
            .await
            .map_err(|e| ProxyError::UpstreamFailed(e.to_string()))?;

        let mut headers: Vec<(String, String)> = response
            .headers
            .into_iter()
            .filter(|(k, _)| !is_hop_by_hop(k))
            .collect();
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));

        let status = response.status;
        let content_length = response.content_length;
        let mut body = response.body;
        if let Some(len) = content_length {
            headers.push(("Content-Length".to_string(), len.to_string()));
            let resp_head = ResponseHead {
                version_minor: head.version_minor,
                status,
                reason: response.reason,
                headers,
            };
            let mut head_bytes = Vec::new();
            resp_head.write_head(&mut head_bytes);
            write_all(stream, &head_bytes).await.map_err(as_write_failed)?;
            // Bounded by `Content-Length` at the reader level (see
            // `read_response`'s `Take` wrapper), so this copies exactly the
            // declared body and stops.
            tokio::io::copy(&mut body, stream)
                .await
                .map_err(ProxyError::ResponseWriteFailed)?;
        } else {
            // The origin did not declare a length (chunked or `Connection:
            // close`-delimited); re-frame the live body as chunked toward
            // the client rather than claim a length we never had.
            headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
            let resp_head = ResponseHead {
                version_minor: head.version_minor,
                status,
                reason: response.reason,
                headers,
            };
            let mut head_bytes = Vec::new();
            resp_head.write_head(&mut head_bytes);
            write_all(stream, &head_bytes).await.map_err(as_write_failed)?;
            stream_chunked(body.as_mut(), stream)
                .await
                .map_err(as_write_failed)?;
        }

        info!(
            peer = %self.peer_addr,
            uri = %absolute_uri,
            status,
            content_length = content_length.map(|l| l as i64).unwrap_or(-1),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
        Ok(())
    }
}

/// Streams `body` to `stream` as HTTP/1.1 chunked transfer-coding, one chunk
/// per underlying read rather than buffering the whole body first.
async fn stream_chunked(
    body: &mut (dyn AsyncRead + Send + Unpin),
    stream: &mut dyn Stream,
) -> Result<(), ProxyError> {
    let mut buf = [0u8; 8192];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut frame = Vec::with_capacity(n + 16);
        frame.extend_from_slice(format!("{n:x}\r\n").as_bytes());
        frame.extend_from_slice(&buf[..n]);
        frame.extend_from_slice(b"\r\n");
        write_all(stream, &frame).await?;
    }
    write_all(stream, b"0\r\n\r\n").await?;
    Ok(())
}

/// Decodes a `gzip` or `deflate` request body, rewriting the header to
/// `identity` happens in the caller once it knows decoding actually ran.
/// Any other `Content-Encoding` passes through untouched.
fn decode_request_body(head: &RequestHead, body: Bytes) -> Result<(Bytes, bool), ProxyError> {
    use std::io::Read;

    let encoding = match head.header("content-encoding") {
        Some(v) => v.to_ascii_lowercase(),
        None => return Ok((body, false)),
    };

    match encoding.as_str() {
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ProxyError::UpstreamBuildFailed(format!("bad gzip body: {e}")))?;
            Ok((Bytes::from(out), true))
        }
        "deflate" => {
            let mut decoder = flate2::read::DeflateDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ProxyError::UpstreamBuildFailed(format!("bad deflate body: {e}")))?;
            Ok((Bytes::from(out), true))
        }
        _ => Ok((body, false)),
    }
}

fn resolve_uri(scheme: &str, head: &RequestHead) -> Result<http::Uri, ProxyError> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return head
            .target
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::UpstreamBuildFailed(e.to_string()));
    }
    let host = head
        .header("host")
        .ok_or_else(|| ProxyError::UpstreamBuildFailed("missing Host header".into()))?;
    let path = if head.target.is_empty() {
        "/".to_string()
    } else {
        head.target.clone()
    };
    format!("{scheme}://{host}{path}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::UpstreamBuildFailed(e.to_string()))
}

fn connect_host(target: &str) -> String {
    normalize_host(target)
}

fn connect_established(version_minor: u8) -> String {
    format!("HTTP/1.{version_minor} 200 Connection established\r\n\r\n")
}

/// Reads the one byte that must be the start of the TLS handshake, taking it
/// from whatever was already buffered during request parsing before falling
/// back to a fresh read. Any further bytes already sitting in `carry` are
/// folded into the replay prefix alongside it.
async fn peek_tls_prefix(
    mut stream: Box<dyn Stream>,
    mut carry: Vec<u8>,
) -> Result<(Box<dyn Stream>, Bytes), ProxyError> {
    let first = if !carry.is_empty() {
        carry.remove(0)
    } else {
        let mut b = [0u8; 1];
        let n = stream.read(&mut b).await?;
        if n == 0 {
            return Err(ProxyError::InvalidProtocol);
        }
        b[0]
    };

    if first != 0x16 {
        return Err(ProxyError::InvalidProtocol);
    }

    let mut prefix = Vec::with_capacity(1 + carry.len());
    prefix.push(first);
    prefix.extend_from_slice(&carry);
    Ok((stream, Bytes::from(prefix)))
}

async fn write_all(stream: &mut dyn Stream, bytes: &[u8]) -> Result<(), ProxyError> {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Recasts a plain I/O failure as one that happened while writing a response
/// back to the client, so `Session::run` knows not to attempt a second,
/// overlapping response on the same socket (see `ProxyError::ResponseWriteFailed`).
fn as_write_failed(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Io(e) => ProxyError::ResponseWriteFailed(e),
        other => other,
    }
}

/// Reads one HTTP/1.x message (headers + body) off `stream`, using `carry` as
/// both the source of already-buffered bytes from a previous read and the
/// destination for anything read past the current message's end. Returns
/// `None` on a clean EOF with nothing pending.
async fn read_request(
    stream: &mut dyn Stream,
    carry: &mut Vec<u8>,
) -> Result<Option<(RequestHead, Bytes)>, ProxyError> {
    let mut buf = BytesMut::from(&carry[..]);
    carry.clear();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::ParseFailed("request headers too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::ParseFailed("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut headers = [EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(&buf[..header_end])
        .map_err(|e| ProxyError::ParseFailed(e.to_string()))?;
    if matches!(status, Status::Partial) {
        return Err(ProxyError::ParseFailed("incomplete request line".into()));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let target = req.path.unwrap_or("/").to_string();
    let version_minor = req.version.unwrap_or(1);
    let header_pairs: Vec<(String, String)> = req
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let is_chunked = header_pairs.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });

    let body = if is_chunked {
        let (body, leftover) = read_chunked_request_body(stream, buf, header_end).await?;
        carry.extend_from_slice(&leftover);
        body
    } else {
        let content_length = header_pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::ParseFailed("connection closed mid-body".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let body = Bytes::copy_from_slice(&buf[header_end..header_end + content_length]);
        carry.extend_from_slice(&buf[header_end + content_length..]);
        body
    };

    Ok(Some((
        RequestHead {
            method,
            target,
            version_minor,
            headers: header_pairs,
        },
        body,
    )))
}

/// Decodes a chunked request body starting at `pos` in `buf`, pulling more
/// bytes from `stream` as needed. Returns the decoded body and whatever
/// bytes followed the terminating chunk (the start of the next pipelined
/// request, if any).
async fn read_chunked_request_body(
    stream: &mut dyn Stream,
    mut buf: BytesMut,
    mut pos: usize,
) -> Result<(Bytes, BytesMut), ProxyError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let size_line_end = loop {
            if let Some(idx) = find_crlf(&buf[pos..]) {
                break pos + idx + 2;
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::ParseFailed("eof reading chunk size".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let size_line = std::str::from_utf8(&buf[pos..size_line_end - 2])
            .map_err(|_| ProxyError::ParseFailed("non-utf8 chunk size line".into()))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::ParseFailed(format!("bad chunk size {size_str:?}")))?;
        pos = size_line_end;

        if size == 0 {
            let base = pos.saturating_sub(2);
            loop {
                if let Some(idx) = buf[base..].windows(4).position(|w| w == b"\r\n\r\n") {
                    pos = base + idx + 4;
                    break;
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(ProxyError::ParseFailed("eof reading chunk trailers".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            break;
        }

        while buf.len() < pos + size + 2 {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::ParseFailed("eof mid chunk".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        out.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }

    let leftover = buf.split_off(pos);
    Ok((Bytes::from(out), leftover))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_filters_known_set_and_misspelling() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("Proxy-Authenticate"));
        assert!(is_hop_by_hop("Prxoy-Authenticate"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[tokio::test]
    async fn read_request_parses_headers_and_body_and_keeps_trailing_bytes() {
        let mut data = BytesMut::new();
        data.extend_from_slice(
            b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\nhiGET /next HTTP/1.1\r\n\r\n",
        );
        let mut cursor = std::io::Cursor::new(data.to_vec());
        let mut carry = Vec::new();
        let (head, body) = read_request(&mut cursor, &mut carry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/x");
        assert_eq!(body.as_ref(), b"hi");
        assert!(carry.starts_with(b"GET /next"));
    }

    #[tokio::test]
    async fn read_request_returns_none_on_clean_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let mut carry = Vec::new();
        let result = read_request(&mut cursor, &mut carry).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn resolve_uri_prefers_absolute_form() {
        let head = RequestHead {
            method: "GET".into(),
            target: "http://example.com/a".into(),
            version_minor: 1,
            headers: vec![],
        };
        let uri = resolve_uri("http", &head).unwrap();
        assert_eq!(uri, "http://example.com/a");
    }

    #[test]
    fn resolve_uri_falls_back_to_host_header() {
        let head = RequestHead {
            method: "GET".into(),
            target: "/a".into(),
            version_minor: 1,
            headers: vec![("Host".into(), "example.com".into())],
        };
        let uri = resolve_uri("https", &head).unwrap();
        assert_eq!(uri, "https://example.com/a");
    }

    #[test]
    fn decode_request_body_inflates_gzip_and_reports_rewrite() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = encoder.finish().unwrap();

        let head = RequestHead {
            method: "POST".into(),
            target: "/x".into(),
            version_minor: 1,
            headers: vec![("Content-Encoding".into(), "gzip".into())],
        };
        let (body, decoded) = decode_request_body(&head, Bytes::from(compressed)).unwrap();
        assert!(decoded);
        assert_eq!(body.as_ref(), b"hello gzip");
    }

    #[test]
    fn decode_request_body_passes_through_unknown_encoding() {
        let head = RequestHead {
            method: "POST".into(),
            target: "/x".into(),
            version_minor: 1,
            headers: vec![("Content-Encoding".into(), "br".into())],
        };
        let (body, decoded) = decode_request_body(&head, Bytes::from_static(b"raw")).unwrap();
        assert!(!decoded);
        assert_eq!(body.as_ref(), b"raw");
    }

    /// An origin that drops mid-body after the response head has already
    /// landed on the client socket must not be followed by a second,
    /// synthesized response on top of it (see `ProxyError::ResponseWriteFailed`
    /// and the `other => return Err(other)` arm in `Session::run`).
    #[tokio::test]
    async fn write_failure_after_partial_response_does_not_double_respond() {
        use crate::ca::{ImpersonationCache, RootAuthority};
        use crate::client::{Client, ClientError, Request as UpstreamRequest, Response as UpstreamResponse};
        use futures::future::BoxFuture;
        use std::io;
        use std::pin::Pin;
        use std::task::{Context, Poll};
        use tokio::io::ReadBuf;
        use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

        struct FlakyBody(u8);
        impl AsyncRead for FlakyBody {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                if self.0 == 0 {
                    self.0 = 1;
                    buf.put_slice(b"partial-body");
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::Error::other("origin connection reset")))
                }
            }
        }

        struct FlakyClient;
        impl Client for FlakyClient {
            fn call<'a>(
                &'a self,
                _request: UpstreamRequest,
            ) -> BoxFuture<'a, Result<UpstreamResponse, ClientError>> {
                Box::pin(async move {
                    Ok(UpstreamResponse {
                        version_minor: 1,
                        status: 200,
                        reason: "OK".to_string(),
                        headers: vec![],
                        body: Box::new(FlakyBody(0)),
                        content_length: Some(1000),
                    })
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
        let cache = Arc::new(ImpersonationCache::new(authority).unwrap());
        let client: Arc<dyn Client> = Arc::new(FlakyClient);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let session = Session::new(peer, cache, client);
            session.run(stream).await
        });

        let mut client_stream = TokioTcpStream::connect(addr).await.unwrap();
        client_stream
            .write_all(b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        client_stream.read_to_end(&mut received).await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(ProxyError::ResponseWriteFailed(_))));

        // Exactly one status line should ever have reached the client -- the
        // head from the doomed real response, never a second synthesized one.
        let status_lines = received
            .windows(b"HTTP/1.1".len())
            .filter(|w| *w == b"HTTP/1.1")
            .count();
        assert_eq!(status_lines, 1);
        assert!(received.starts_with(b"HTTP/1.1 200"));
    }
}
