use std::{net::SocketAddr, str::FromStr};

use bytes::{Buf, Bytes, BytesMut};
use http::{
    HeaderMap, HeaderValue, Method, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, WARNING},
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncReadExt};

use crate::{HEADER_SECTION_MAX_LENGTH, mitm::TlsInfo};

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }
}

impl Authority {
    /// Parses an authority-form request target, as used by `CONNECT`.
    ///
    /// Note: the target must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Extracts host and port from a request URI, inferring the port from
    /// the scheme when absent.
    ///
    /// Note: without a port, only `http` and `https` schemes are accepted.
    pub fn from_request_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }
}

/// A single parsed HTTP/1 request, together with the per-request metadata
/// the pipeline attaches before dispatch.
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target. The pipeline normalizes this to an absolute URI with
    /// `http` or `https` scheme according to the session's secure flag.
    pub uri: Uri,
    /// Protocol version from the request line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
    /// Request body, already de-framed.
    pub body: Bytes,
    /// Peer address of the client connection.
    pub remote_addr: Option<SocketAddr>,
    /// TLS state of the client connection after MITM termination.
    pub tls: Option<TlsInfo>,
}

impl HttpRequest {
    /// Reads one request (header section and body) from `reader`.
    ///
    /// Bytes beyond the request stay in `buf` for the next read. Returns
    /// [`io::ErrorKind::UnexpectedEof`] when the peer closes mid-request or
    /// before sending one, and [`io::ErrorKind::InvalidData`] on malformed
    /// requests or an oversized header section.
    pub(crate) async fn read(
        reader: &mut (impl AsyncRead + Unpin),
        buf: &mut BytesMut,
    ) -> io::Result<Self> {
        let (header_len, mut req) = loop {
            if let Some(parsed) = Self::parse(buf)? {
                break parsed;
            }
            if buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request header section exceeds limit",
                ));
            }
            if reader.read_buf(buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        };
        buf.advance(header_len);
        req.body = read_request_body(reader, buf, &req.method, &req.headers).await?;
        Ok(req)
    }

    /// Parses the request line and header section from a buffer.
    ///
    /// Returns `None` when the buffer does not yet hold a complete header
    /// section, otherwise the header section length and the request.
    pub fn parse(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).map_err(invalid_data)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let request = Self::from_httparse(req)?;
                Ok(Some((header_len, request)))
            }
        }
    }

    fn from_httparse(req: httparse::Request) -> io::Result<Self> {
        let method = req
            .method
            .ok_or_else(|| invalid_data("missing method"))?
            .parse()
            .map_err(invalid_data)?;
        let path = req.path.ok_or_else(|| invalid_data("missing target"))?;
        let uri = Uri::from_str(path).map_err(invalid_data)?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = header_map(req.headers);
        Ok(Self {
            method,
            uri,
            version,
            headers,
            body: Bytes::new(),
            remote_addr: None,
            tls: None,
        })
    }

    /// Rewrites the request target to an absolute URI.
    ///
    /// The scheme follows the session's secure flag; a missing host is
    /// copied from the `Host` header. `CONNECT` targets stay in
    /// authority-form. Targets that cannot be made absolute are left
    /// untouched and fail later, at the round trip.
    pub(crate) fn normalize_uri(&mut self, secure: bool) {
        if self.method == Method::CONNECT {
            return;
        }
        let authority = match self.uri.authority() {
            Some(authority) => authority.to_string(),
            None => match self.headers.get(HOST).and_then(|v| v.to_str().ok()) {
                Some(host) => host.to_string(),
                None => return,
            },
        };
        let path_and_query = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let scheme = if secure { "https" } else { "http" };
        if let Ok(uri) = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
        {
            self.uri = uri;
        }
    }

    /// Origin-form request target, `/path?query`.
    pub fn origin_form_target(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Serializes the request line and header section with the given
    /// request target.
    ///
    /// The body was de-framed on read, so any `Transfer-Encoding` is
    /// dropped and a `Content-Length` emitted instead.
    pub(crate) fn encode_head(&self, request_target: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(format!("{} {request_target} HTTP/1.1\r\n", self.method).as_bytes());
        for (name, value) in self.headers.iter() {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// Serializes the whole request with the given request target.
    pub(crate) fn encode(&self, request_target: &str) -> Bytes {
        let mut out = BytesMut::from(self.encode_head(request_target).as_ref());
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    /// Whether the connection must close after this request is answered.
    pub fn wants_close(&self) -> bool {
        wants_close(self.version, &self.headers)
    }
}

/// A parsed or synthesized HTTP/1 response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Protocol version from the response line.
    pub version: Version,
    /// Raw header map.
    pub headers: HeaderMap<HeaderValue>,
    /// De-framed response body. `None` means headers-only framing: no
    /// `Content-Length` is emitted and the payload follows out of band
    /// (`CONNECT` tunnels).
    pub body: Option<Bytes>,
    /// Forces `Connection: close` on the wire and tears the connection
    /// down after the response is written.
    pub close: bool,
}

impl HttpResponse {
    /// Creates a synthetic response with an empty body.
    pub fn synthetic(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Some(Bytes::new()),
            close: false,
        }
    }

    /// The `200` written to a client before its `CONNECT` tunnel opens.
    pub(crate) fn connect_established() -> Self {
        Self {
            status: StatusCode::OK,
            reason: Some("Connection Established".to_string()),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            close: false,
        }
    }

    /// Parses the status line and header section from a buffer.
    ///
    /// Returns `None` when the buffer does not yet hold a complete header
    /// section, otherwise the header section length and the response.
    pub fn parse(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).map_err(invalid_data)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.ok_or_else(|| invalid_data("missing status"))?;
                let status = StatusCode::from_u16(code).map_err(invalid_data)?;
                let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let headers = header_map(res.headers);
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        version,
                        headers,
                        body: None,
                        close: false,
                    },
                )))
            }
        }
    }

    /// Reads a response header section from `reader`, leaving any body
    /// bytes in `buf`.
    pub(crate) async fn read_head(
        reader: &mut (impl AsyncRead + Unpin),
        buf: &mut BytesMut,
    ) -> io::Result<Self> {
        let (header_len, res) = loop {
            if let Some(parsed) = Self::parse(buf)? {
                break parsed;
            }
            if buf.len() >= HEADER_SECTION_MAX_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response header section exceeds limit",
                ));
            }
            if reader.read_buf(buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        };
        buf.advance(header_len);
        Ok(res)
    }

    /// The reason phrase, falling back to the canonical one.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Whether the connection must close after this response.
    pub fn wants_close(&self) -> bool {
        self.close || wants_close(self.version, &self.headers)
    }

    /// Serializes the response for the wire.
    ///
    /// Bodies are re-framed with an exact `Content-Length`; a `None` body
    /// emits headers only. The `close` flag forces `Connection: close`.
    pub(crate) fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.as_ref().map_or(0, |b| b.len()));
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            // The body was de-framed on read; framing headers are rebuilt below.
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            if name == CONNECTION && self.close {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if self.close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        if let Some(body) = &self.body {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out.freeze()
    }
}

/// Appends a `Warning` header describing a non-fatal pipeline error, as
/// produced by failing modifiers and failed round trips.
pub fn append_warning(headers: &mut HeaderMap<HeaderValue>, cause: impl std::fmt::Display) {
    let warning = format!("199 tapwire \"{cause:#}\"");
    let value = HeaderValue::from_str(&warning)
        .unwrap_or_else(|_| HeaderValue::from_static("199 tapwire \"unprintable error\""));
    headers.append(WARNING, value);
}

/// Removes hop-by-hop headers before a message crosses the proxy, per
/// RFC 9110 section 7.6.1.
pub(crate) fn filter_hop_by_hop_headers(headers: &mut HeaderMap<HeaderValue>) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "proxy-authenticate",
        "proxy-authorization",
    ] {
        headers.remove(name);
    }
}

fn wants_close(version: Version, headers: &HeaderMap<HeaderValue>) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if has_token("close") {
        return true;
    }
    version == Version::HTTP_10 && !has_token("keep-alive")
}

fn header_map(headers: &mut [httparse::Header]) -> HeaderMap<HeaderValue> {
    HeaderMap::from_iter(headers.iter_mut().flat_map(|h| {
        let value = HeaderValue::from_bytes(h.value).ok()?;
        let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        Some((name, value))
    }))
}

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// How the remaining bytes of a message body are framed.
pub(crate) enum Framing {
    None,
    Length(u64),
    Chunked,
    Eof,
}

fn request_framing(method: &Method, headers: &HeaderMap<HeaderValue>) -> io::Result<Framing> {
    if method == Method::CONNECT {
        return Ok(Framing::None);
    }
    if is_chunked(headers) {
        return Ok(Framing::Chunked);
    }
    match content_length(headers)? {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::None),
    }
}

/// Framing rules for response bodies, per RFC 9112 section 6.3.
pub(crate) fn response_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap<HeaderValue>,
) -> io::Result<Framing> {
    if method == Method::HEAD
        || method == Method::CONNECT
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::None);
    }
    if is_chunked(headers) {
        return Ok(Framing::Chunked);
    }
    match content_length(headers)? {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::Eof),
    }
}

fn is_chunked(headers: &HeaderMap<HeaderValue>) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap<HeaderValue>) -> io::Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => {
            let n = value
                .to_str()
                .map_err(invalid_data)?
                .trim()
                .parse::<u64>()
                .map_err(invalid_data)?;
            Ok(Some(n))
        }
    }
}

async fn read_request_body(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
    method: &Method,
    headers: &HeaderMap<HeaderValue>,
) -> io::Result<Bytes> {
    match request_framing(method, headers)? {
        Framing::None => Ok(Bytes::new()),
        Framing::Length(n) => read_exact_body(reader, buf, n).await,
        Framing::Chunked => read_chunked_body(reader, buf).await,
        Framing::Eof => Ok(Bytes::new()),
    }
}

/// Reads a response body according to a previously decided framing.
pub(crate) async fn read_response_body(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
    framing: Framing,
) -> io::Result<Bytes> {
    match framing {
        Framing::None => Ok(Bytes::new()),
        Framing::Length(n) => read_exact_body(reader, buf, n).await,
        Framing::Chunked => read_chunked_body(reader, buf).await,
        Framing::Eof => {
            while reader.read_buf(buf).await? != 0 {}
            Ok(buf.split().freeze())
        }
    }
}

async fn read_exact_body(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
    len: u64,
) -> io::Result<Bytes> {
    let len = usize::try_from(len).map_err(invalid_data)?;
    while buf.len() < len {
        if reader.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(buf.split_to(len).freeze())
}

async fn read_chunked_body(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
) -> io::Result<Bytes> {
    let mut out = BytesMut::new();
    loop {
        let line = read_line(reader, buf).await?;
        let size_field = line
            .split(|&b| b == b';')
            .next()
            .unwrap_or_default()
            .to_vec();
        let size_str = std::str::from_utf8(&size_field).map_err(invalid_data)?;
        let size = usize::from_str_radix(size_str.trim(), 16).map_err(invalid_data)?;
        if size == 0 {
            // Trailer section, dropped.
            loop {
                if read_line(reader, buf).await?.is_empty() {
                    return Ok(out.freeze());
                }
            }
        }
        while buf.len() < size + 2 {
            if reader.read_buf(buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        out.extend_from_slice(&buf[..size]);
        buf.advance(size);
        if &buf[..2] != b"\r\n" {
            return Err(invalid_data("chunk missing CRLF terminator"));
        }
        buf.advance(2);
    }
}

async fn read_line(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut BytesMut,
) -> io::Result<Bytes> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(invalid_data("line exceeds limit"));
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}
