//! The upstream side of the proxy: the dial capability and the default
//! HTTP/1 round tripper.
//!
//! The round tripper deliberately speaks HTTP/1 only and opens one
//! connection per exchange. It honors the proxy's dialer and downstream
//! proxy: plain requests through a downstream proxy are relayed in
//! absolute-form, TLS requests open a `CONNECT` tunnel through it first.

use std::{future::Future, sync::Arc, time::Duration};

use bytes::BytesMut;
use dynosaur::dynosaur;
use http::{
    StatusCode, Uri,
    header::{EXPECT, HOST},
    uri::Scheme,
};
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing::debug;

use crate::{
    parse::{
        Authority, HttpRequest, HttpResponse, filter_hop_by_hop_headers, read_response_body,
        response_framing,
    },
    util::{ClientIo, PeekStream, disable_sigpipe, set_tcp_keepalive},
};

/// Upper bound on the TLS handshake with an origin.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for an interim response to `Expect: 100-continue`
/// before sending the body anyway.
const EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);

#[dynosaur(pub(crate) DynDialer = dyn Dialer)]
/// Opens a transport connection to a `host:port` address.
pub trait Dialer: Send + Sync {
    /// Dials the address and returns the connected stream.
    fn dial<'a>(&'a self, addr: &'a str) -> impl Future<Output = io::Result<ClientIo>> + Send + 'a;
}

/// Plain TCP dialer with connect timeout and keep-alive probing.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Maximum time to establish the connection.
    pub connect_timeout: Duration,
    /// TCP keep-alive period for dialed connections.
    pub keepalive: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl Dialer for TcpDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> io::Result<ClientIo> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        set_tcp_keepalive(&stream, self.keepalive).ok();
        disable_sigpipe(&stream);
        Ok(Box::new(stream))
    }
}

#[dynosaur(pub(crate) DynRoundTripper = dyn RoundTripper)]
/// Performs the upstream exchange for one request.
pub trait RoundTripper: Send + Sync {
    /// Sends the request to its origin and returns the response.
    fn round_trip<'a>(
        &'a self,
        req: &'a HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, AnyError>> + Send + 'a;
}

/// The stock [`RoundTripper`].
#[derive(derive_more::Debug)]
pub struct HttpClient {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
    proxy: Option<Uri>,
    #[debug(skip)]
    tls: TlsConnector,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default dialer and the webpki root store.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            dialer: Arc::from(DynDialer::boxed(TcpDialer::default())),
            proxy: None,
            tls: tls_connector(roots),
        }
    }

    /// Replaces the dial capability.
    pub fn with_dialer(self, dialer: impl Dialer + 'static) -> Self {
        self.with_shared_dialer(Arc::from(DynDialer::boxed(dialer)))
    }

    pub(crate) fn with_shared_dialer(mut self, dialer: Arc<DynDialer<'static>>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Routes all upstream traffic through this proxy.
    pub fn with_proxy(mut self, proxy: Uri) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub(crate) fn with_shared_proxy(mut self, proxy: Option<Uri>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Replaces the TLS root store used to verify origins.
    pub fn with_roots(mut self, roots: RootCertStore) -> Self {
        self.tls = tls_connector(roots);
        self
    }

    /// Establishes the transport to the origin, going through the
    /// downstream proxy when one is configured. Returns the stream and the
    /// request target to put on the request line.
    async fn open(&self, req: &HttpRequest, target: &Authority) -> Result<(ClientIo, String)> {
        let secure = req.uri.scheme() == Some(&Scheme::HTTPS);
        let conn = match &self.proxy {
            None => {
                let conn = self
                    .dialer
                    .dial(&target.to_string())
                    .await
                    .std_context("failed to dial origin")?;
                conn
            }
            Some(proxy) => {
                let proxy_addr = Authority::from_request_uri(proxy)
                    .context("invalid downstream proxy URI")?
                    .to_string();
                let mut conn = self
                    .dialer
                    .dial(&proxy_addr)
                    .await
                    .std_context("failed to dial downstream proxy")?;
                if !secure {
                    // Plain requests are relayed in absolute-form.
                    return Ok((conn, req.uri.to_string()));
                }
                debug!(%target, %proxy_addr, "opening CONNECT tunnel through downstream proxy");
                conn.write_all(
                    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes(),
                )
                .await
                .std_context("failed to send CONNECT to downstream proxy")?;
                let mut buf = BytesMut::new();
                let res = HttpResponse::read_head(&mut conn, &mut buf)
                    .await
                    .std_context("failed to read CONNECT response from downstream proxy")?;
                if !res.status.is_success() {
                    return Err(anyerr!("downstream proxy refused CONNECT: {}", res.status));
                }
                if buf.is_empty() {
                    conn
                } else {
                    Box::new(PeekStream::new(conn, buf.split().freeze()))
                }
            }
        };
        let conn = if secure {
            self.tls_connect(conn, &target.host).await?
        } else {
            conn
        };
        Ok((conn, req.origin_form_target().to_string()))
    }

    async fn tls_connect(&self, conn: ClientIo, host: &str) -> Result<ClientIo> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name =
            ServerName::try_from(host.to_string()).std_context("invalid TLS server name")?;
        let tls = timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(server_name, conn))
            .await
            .map_err(|_| anyerr!("TLS handshake with origin timed out"))?
            .std_context("TLS handshake with origin failed")?;
        Ok(Box::new(tls))
    }
}

impl RoundTripper for HttpClient {
    async fn round_trip<'a>(&'a self, req: &'a HttpRequest) -> Result<HttpResponse, AnyError> {
        let target =
            Authority::from_request_uri(&req.uri).context("request URI is not absolute")?;
        let (mut conn, request_target) = self.open(req, &target).await?;

        let mut headers = req.headers.clone();
        filter_hop_by_hop_headers(&mut headers);
        if !headers.contains_key(HOST) {
            let host = target.to_string();
            if let Ok(value) = host.parse() {
                headers.insert(HOST, value);
            }
        }
        let expects_continue = headers
            .get(EXPECT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        let upstream_req = HttpRequest {
            method: req.method.clone(),
            uri: req.uri.clone(),
            version: req.version,
            headers,
            body: req.body.clone(),
            remote_addr: None,
            tls: None,
        };

        conn.write_all(&upstream_req.encode_head(&request_target))
            .await
            .std_context("failed to write request head")?;
        let mut buf = BytesMut::new();
        if expects_continue && !upstream_req.body.is_empty() {
            match timeout(
                EXPECT_CONTINUE_TIMEOUT,
                HttpResponse::read_head(&mut conn, &mut buf),
            )
            .await
            {
                // No interim response in time, send the body anyway.
                Err(_) => {}
                Ok(Ok(res)) if res.status == StatusCode::CONTINUE => {}
                // Final response before the body was uploaded.
                Ok(Ok(mut res)) => {
                    let framing = response_framing(&req.method, res.status, &res.headers)
                        .anyerr()?;
                    res.body = Some(read_response_body(&mut conn, &mut buf, framing).await.anyerr()?);
                    return Ok(res);
                }
                Ok(Err(err)) => {
                    return Err(err).std_context("failed to read interim response");
                }
            }
        }
        conn.write_all(&upstream_req.body)
            .await
            .std_context("failed to write request body")?;
        conn.flush().await.std_context("failed to flush request")?;

        let mut res = loop {
            let res = HttpResponse::read_head(&mut conn, &mut buf)
                .await
                .std_context("failed to read response head")?;
            if res.status.is_informational() && res.status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            break res;
        };
        let framing = response_framing(&req.method, res.status, &res.headers).anyerr()?;
        res.body = Some(read_response_body(&mut conn, &mut buf, framing).await.anyerr()?);
        Ok(res)
    }
}

fn tls_connector(roots: RootCertStore) -> TlsConnector {
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    // HTTP/2 upgrade towards origins is disabled; the proxy speaks HTTP/1
    // upstream.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}
