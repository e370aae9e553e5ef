use bytes::Bytes;

/// A parsed or synthesized HTTP/1.x response ready to be written back to the
/// client. `body` is fully buffered only for locally synthesized responses;
/// upstream responses stream their body separately (see [`crate::session`]).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version_minor: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn write_head(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version_minor, self.status, self.reason)
                .as_bytes(),
        );
        for (k, v) in &self.headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Just enough of the originating request for [`new_response`] to mirror its
/// protocol version and closing intent, without needing the whole parsed
/// request struct (which lives in [`crate::session`]).
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub version_minor: u8,
    pub close: bool,
}

impl RequestContext {
    /// Reads the `Connection` header's close intent off a request's header
    /// list, alongside its protocol version.
    pub fn new(version_minor: u8, headers: &[(String, String)]) -> Self {
        let close = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));
        RequestContext {
            version_minor,
            close,
        }
    }
}

/// Builds a plain response, defaulting empty headers/body, copying the
/// protocol version from `request_ctx` and setting `Connection: close` on
/// the reply whenever the originating request asked for it (spec §4.4).
pub fn new_response(
    request_ctx: &RequestContext,
    status: u16,
    reason: &str,
    mut headers: Vec<(String, String)>,
    body: &Bytes,
) -> (ResponseHead, Bytes) {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        headers.push(("Content-Length".to_string(), body.len().to_string()));
    }
    if request_ctx.close && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("connection")) {
        headers.push(("Connection".to_string(), "close".to_string()));
    }
    (
        ResponseHead {
            version_minor: request_ctx.version_minor,
            status,
            reason: reason.to_string(),
            headers,
        },
        body.clone(),
    )
}

/// Synthesizes a `text/plain` proxy-generated error response. This is what
/// the client sees in place of an origin response when the proxy itself
/// cannot complete a request (bad upstream, malformed request, etc).
pub fn http_error(
    request_ctx: &RequestContext,
    status: u16,
    message: &str,
) -> (ResponseHead, Bytes) {
    let body = Bytes::from(message.to_string());
    let headers = vec![
        (
            "Content-Type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        ),
        ("Via".to_string(), "betproxy".to_string()),
    ];
    new_response(request_ctx, status, reason_phrase(status), headers, &body)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_sets_via_and_content_length() {
        let ctx = RequestContext::new(1, &[]);
        let (head, body) = http_error(&ctx, 500, "boom");
        assert_eq!(head.status, 500);
        assert_eq!(head.version_minor, 1);
        assert_eq!(body.as_ref(), b"boom");
        assert!(
            head.headers
                .iter()
                .any(|(k, v)| k == "Via" && v == "betproxy")
        );
        assert!(
            head.headers
                .iter()
                .any(|(k, v)| k == "Content-Length" && v == "4")
        );
    }

    #[test]
    fn new_response_defaults_content_length() {
        let ctx = RequestContext::new(1, &[]);
        let (head, _) = new_response(&ctx, 200, "OK", vec![], &Bytes::from_static(b"hi"));
        assert!(
            head.headers
                .iter()
                .any(|(k, v)| k == "Content-Length" && v == "2")
        );
    }

    #[test]
    fn new_response_propagates_connection_close_from_request() {
        let ctx = RequestContext::new(1, &[("Connection".to_string(), "close".to_string())]);
        let (head, _) = new_response(&ctx, 200, "OK", vec![], &Bytes::from_static(b"hi"));
        assert!(
            head.headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case("connection") && v == "close")
        );
    }

    #[test]
    fn new_response_omits_connection_close_when_request_did_not_ask() {
        let ctx = RequestContext::new(1, &[]);
        let (head, _) = new_response(&ctx, 200, "OK", vec![], &Bytes::from_static(b"hi"));
        assert!(!head.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("connection")));
    }
}
