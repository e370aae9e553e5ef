use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use http::Uri;
use httparse::{EMPTY_HEADER, Status};
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::peek::ReplayStream;

/// A response body not yet (fully) read off the wire. Boxed so `Response` can
/// hand back whichever concrete reader its framing required -- a bounded
/// `Take` for `Content-Length`, a `ChunkedBodyReader` for chunked, or the raw
/// stream tail for a close-delimited body -- without `Session` caring which.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// A request ready to be re-originated toward the real server. Headers are
/// already filtered of hop-by-hop fields by the time a [`Client`] sees them.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: Uri,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct Response {
    pub version_minor: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: BodyReader,
    /// `Some(n)` if the origin declared a definite length (`Content-Length`);
    /// `None` if the body was chunked or delimited by connection close. A
    /// [`crate::session::Session`] re-frames a `None` body as chunked toward
    /// the client rather than claim a length it never had.
    pub content_length: Option<usize>,
}

#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Tls(std::io::Error),
    InvalidUri,
    BadHost,
    ParseFailed(String),
}

impl Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Io(value)
    }
}

/// The injected upstream capability. A `Session` never talks to an origin
/// server directly -- it always goes through whatever `Client` the
/// `ProxyService` was built with, which is free to log, cache, rewrite, or
/// fault-inject around the real network call.
pub trait Client: Send + Sync {
    fn call<'a>(&'a self, request: Request) -> BoxFuture<'a, Result<Response, ClientError>>;
}

/// Accepts any server certificate. Used when `--skip-tls-verify` is passed,
/// e.g. against origins presenting self-signed or expired certificates in a
/// test environment.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

enum Verification {
    Platform(Arc<RootCertStore>),
    Skip,
}

/// The default `Client`: connects straight to the origin named by the
/// request URI, plain TCP for `http://`, `rustls` over TCP for `https://`.
pub struct DirectClient {
    verification: Verification,
}

impl DirectClient {
    pub fn new(skip_tls_verify: bool) -> Self {
        if skip_tls_verify {
            return DirectClient {
                verification: Verification::Skip,
            };
        }
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        DirectClient {
            verification: Verification::Platform(Arc::new(roots)),
        }
    }

    fn client_config(&self) -> rustls::ClientConfig {
        match &self.verification {
            Verification::Platform(roots) => rustls::ClientConfig::builder()
                .with_root_certificates(roots.as_ref().clone())
                .with_no_client_auth(),
            Verification::Skip => rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify))
                .with_no_client_auth(),
        }
    }
}

impl Client for DirectClient {
    fn call<'a>(&'a self, request: Request) -> BoxFuture<'a, Result<Response, ClientError>> {
        Box::pin(async move { self.do_call(request).await })
    }
}

impl DirectClient {
    async fn do_call(&self, request: Request) -> Result<Response, ClientError> {
        let host = request.uri.host().ok_or(ClientError::BadHost)?.to_string();
        let is_https = request.uri.scheme_str() == Some("https");
        let port = request
            .uri
            .port_u16()
            .unwrap_or(if is_https { 443 } else { 80 });

        debug!(host = %host, port, https = is_https, "connecting to origin");
        let tcp = TcpStream::connect((host.as_str(), port)).await?;

        let request_bytes = encode_request(&request, &host, port);

        if is_https {
            let connector = TlsConnector::from(Arc::new(self.client_config()));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| ClientError::BadHost)?
                .to_owned();
            let mut tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ClientError::Tls(std::io::Error::other(e)))?;
            tls.write_all(&request_bytes).await?;
            read_response(tls).await
        } else {
            let mut tcp = tcp;
            tcp.write_all(&request_bytes).await?;
            read_response(tcp).await
        }
    }
}

fn encode_request(request: &Request, host: &str, port: u16) -> Vec<u8> {
    let path = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut out = Vec::new();
    out.extend_from_slice(
        format!(
            "{} {} HTTP/1.{}\r\n",
            request.method, path, request.version_minor
        )
        .as_bytes(),
    );
    let has_host = request.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host"));
    if !has_host {
        let host_header = if port == 80 || port == 443 {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        out.extend_from_slice(format!("Host: {host_header}\r\n").as_bytes());
    }
    for (k, v) in &request.headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

async fn read_response<S>(mut stream: S) -> Result<Response, ClientError>
where
    S: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::ParseFailed("connection closed before headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Err(ClientError::ParseFailed("response headers too large".into()));
        }
    };

    let mut headers = [EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut headers);
    let status = res
        .parse(&buf[..header_end])
        .map_err(|e| ClientError::ParseFailed(e.to_string()))?;
    if matches!(status, Status::Partial) {
        return Err(ClientError::ParseFailed("incomplete status line".into()));
    }

    let version_minor = res.version.unwrap_or(1);
    let code = res.code.unwrap_or(502);
    let reason = res.reason.unwrap_or("").to_string();
    let header_pairs: Vec<(String, String)> = res
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let is_chunked = header_pairs
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));
    let declared_length = header_pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok());

    // Whatever of the body already landed in `buf` while we were still
    // scanning for the header terminator becomes the prefix of whichever
    // reader we hand back; the rest streams straight off `stream` on demand.
    let rest = Bytes::copy_from_slice(&buf[header_end..]);

    let (body, content_length): (BodyReader, Option<usize>) = if is_chunked {
        (Box::new(ChunkedBodyReader::new(stream, rest)), None)
    } else if let Some(len) = declared_length {
        let tail = ReplayStream::new(stream, rest);
        (Box::new(tail.take(len as u64)), Some(len))
    } else {
        // No declared length and not chunked: the body runs until the
        // origin closes the connection.
        (Box::new(ReplayStream::new(stream, rest)), None)
    };

    Ok(Response {
        version_minor,
        status: code,
        reason,
        headers: header_pairs,
        body,
        content_length,
    })
}

/// Decodes HTTP/1.1 chunked transfer-coding as the body is read, rather than
/// buffering the whole thing up front. `prefix` is whatever chunk-encoded
/// bytes were already pulled into the header-parsing buffer before the rest
/// of the body arrived. Trailer headers, if any, are read and discarded;
/// reading stops for good once the zero-length terminating chunk and its
/// trailer block have been consumed, without touching `inner` again.
struct ChunkedBodyReader<S> {
    inner: S,
    buf: BytesMut,
    state: ChunkedState,
}

enum ChunkedState {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
    Done,
}

impl<S> ChunkedBodyReader<S> {
    fn new(inner: S, prefix: Bytes) -> Self {
        ChunkedBodyReader {
            inner,
            buf: BytesMut::from(&prefix[..]),
            state: ChunkedState::Size,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ChunkedBodyReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ChunkedState::Done => return Poll::Ready(Ok(())),
                ChunkedState::Size => match find_crlf(&this.buf) {
                    Some(idx) => {
                        let line = this.buf.split_to(idx + 2);
                        let line_str = std::str::from_utf8(&line[..line.len() - 2])
                            .map_err(|_| invalid_data("non-utf8 chunk size line"))?;
                        let size_str = line_str.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_str, 16)
                            .map_err(|_| invalid_data("bad chunk size"))?;
                        this.state = if size == 0 {
                            ChunkedState::Trailer
                        } else {
                            ChunkedState::Data(size)
                        };
                    }
                    None => match poll_fill(Pin::new(&mut this.inner), cx, &mut this.buf)? {
                        Poll::Ready(true) => continue,
                        Poll::Ready(false) => {
                            return Poll::Ready(Err(unexpected_eof("eof reading chunk size")));
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                },
                ChunkedState::Data(remaining) => {
                    if remaining == 0 {
                        this.state = ChunkedState::DataCrlf;
                        continue;
                    }
                    if this.buf.is_empty() {
                        match poll_fill(Pin::new(&mut this.inner), cx, &mut this.buf)? {
                            Poll::Ready(true) => continue,
                            Poll::Ready(false) => {
                                return Poll::Ready(Err(unexpected_eof("eof mid chunk")));
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let n = remaining.min(this.buf.len()).min(out.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let data = this.buf.split_to(n);
                    out.put_slice(&data);
                    this.state = ChunkedState::Data(remaining - n);
                    return Poll::Ready(Ok(()));
                }
                ChunkedState::DataCrlf => {
                    if this.buf.len() < 2 {
                        match poll_fill(Pin::new(&mut this.inner), cx, &mut this.buf)? {
                            Poll::Ready(true) => continue,
                            Poll::Ready(false) => {
                                return Poll::Ready(Err(unexpected_eof("eof after chunk data")));
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    this.buf.advance(2);
                    this.state = ChunkedState::Size;
                }
                ChunkedState::Trailer => match find_crlf(&this.buf) {
                    Some(idx) => {
                        let line = this.buf.split_to(idx + 2);
                        if line.len() == 2 {
                            this.state = ChunkedState::Done;
                            return Poll::Ready(Ok(()));
                        }
                    }
                    None => match poll_fill(Pin::new(&mut this.inner), cx, &mut this.buf)? {
                        Poll::Ready(true) => continue,
                        Poll::Ready(false) => {
                            return Poll::Ready(Err(unexpected_eof("eof reading chunk trailers")));
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                },
            }
        }
    }
}

/// Pulls more bytes from `inner` into `buf`. `Ready(true)` means progress was
/// made and the caller should retry its parse; `Ready(false)` is EOF.
fn poll_fill<S: AsyncRead + Unpin>(
    mut inner: Pin<&mut S>,
    cx: &mut Context<'_>,
    buf: &mut BytesMut,
) -> Poll<std::io::Result<bool>> {
    let mut scratch = [0u8; 4096];
    let mut read_buf = ReadBuf::new(&mut scratch);
    match inner.as_mut().poll_read(cx, &mut read_buf) {
        Poll::Ready(Ok(())) => {
            let filled = read_buf.filled();
            if filled.is_empty() {
                Poll::Ready(Ok(false))
            } else {
                buf.extend_from_slice(filled);
                Poll::Ready(Ok(true))
            }
        }
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
    }
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn unexpected_eof(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg.to_string())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
