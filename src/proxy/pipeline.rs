//! The per-connection request pipeline and the `CONNECT` tunnel handling.
//!
//! One task per client connection runs [`Proxy::serve_conn`]. Each
//! iteration reads one request under the idle deadline and the shutdown
//! signal, routes it through the modifiers and the round tripper, writes
//! the response, and decides between keeping the connection and tearing it
//! down. `CONNECT` either re-enters the same loop over the terminated TLS
//! stream (MITM) or degrades into a blind byte tunnel.

use std::{io, pin::Pin, sync::Arc};

use bytes::BytesMut;
use http::{Method, StatusCode};
use n0_error::{AnyError, Result, StackResultExt, StdResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::{
    TLS_HANDSHAKE_RECORD_TYPE,
    client::{Dialer, RoundTripper},
    error::{is_closeable, is_other_closeable},
    mitm::{H2Handler, MitmConfig, TlsInfo},
    modify::{RequestModifier, ResponseModifier},
    parse::{Authority, HttpRequest, HttpResponse, append_warning},
    proxy::Proxy,
    session::{RequestContext, Session},
    util::{ClientIo, PeekStream, forward_bidi},
};

/// Outcome of one pipeline iteration.
enum Flow {
    /// Keep reading requests, with the stream and any buffered bytes.
    KeepAlive(ClientIo, BytesMut),
    /// Tear the connection down.
    Close(ClientIo),
    /// The stream moved on: hijacked, tunneled, or consumed by recursion.
    Detached,
}

impl Proxy {
    pub(crate) async fn serve_conn(&self, io: ClientIo, session: Arc<Session>) {
        if self.closing() {
            return;
        }
        self.request_loop(io, BytesMut::new(), session, None).await;
    }

    /// Reads and answers requests on one stream until a closeable
    /// condition. Re-entered over the TLS stream after a MITM'd `CONNECT`.
    async fn request_loop(
        &self,
        mut io: ClientIo,
        mut buf: BytesMut,
        session: Arc<Session>,
        tls: Option<TlsInfo>,
    ) {
        loop {
            match self.handle(io, buf, &session, tls.as_ref()).await {
                Flow::KeepAlive(next_io, next_buf) => {
                    io = next_io;
                    buf = next_buf;
                }
                Flow::Close(mut io) => {
                    io.shutdown().await.ok();
                    return;
                }
                Flow::Detached => return,
            }
        }
    }

    async fn handle(
        &self,
        mut io: ClientIo,
        mut buf: BytesMut,
        session: &Arc<Session>,
        tls: Option<&TlsInfo>,
    ) -> Flow {
        // Three outcomes race: a parsed request, an error (deadline
        // included), and the shutdown signal.
        let read = tokio::select! {
            read = tokio::time::timeout(self.timeout, HttpRequest::read(&mut io, &mut buf)) => read,
            _ = self.shutdown.cancelled() => {
                debug!("closing connection: proxy is shutting down");
                return Flow::Close(io);
            }
        };
        let mut req = match read {
            Ok(Ok(req)) => req,
            Ok(Err(err)) => {
                if is_closeable(&err) {
                    debug!("closing connection: {err:#}");
                } else {
                    warn!("failed to read request: {err:#}");
                }
                return Flow::Close(io);
            }
            Err(_) => {
                debug!("closing connection: request read timed out");
                return Flow::Close(io);
            }
        };

        let mut ctx = RequestContext::new(session.clone());
        if let Some(tls) = tls {
            session.mark_secure();
            req.tls = Some(tls.clone());
        }
        req.normalize_uri(session.is_secure());
        req.remote_addr = Some(session.remote_addr());
        debug!(method = %req.method, uri = %req.uri, "handling request");

        if req.method == Method::CONNECT {
            return self.handle_connect(io, buf, session, ctx, req).await;
        }

        if let Err(err) = self.reqmod.modify_request(&mut ctx, &mut req).await {
            warn!("request modifier failed: {err:#}");
            append_warning(&mut req.headers, &err);
        }
        if session.is_hijacked() {
            return self.detach(io, buf, session).await;
        }

        let mut res = self.round_trip(&ctx, &req).await;

        if let Err(err) = self.resmod.modify_response(&mut ctx, &mut res).await {
            warn!("response modifier failed: {err:#}");
            append_warning(&mut res.headers, &err);
        }
        if session.is_hijacked() {
            return self.detach(io, buf, session).await;
        }

        let mut closing = req.wants_close() || res.wants_close() || self.closing();
        res.close = closing;
        if let Err(err) = self.write_response(&mut io, &res).await {
            warn!("failed to write response: {err:#}");
            if is_other_closeable(&err) {
                closing = true;
            }
        }
        if closing {
            debug!("closing connection after response");
            Flow::Close(io)
        } else {
            Flow::KeepAlive(io, buf)
        }
    }

    async fn round_trip(&self, ctx: &RequestContext, req: &HttpRequest) -> HttpResponse {
        if ctx.skipping_round_trip() {
            debug!("skipping round trip");
            return HttpResponse::synthetic(StatusCode::OK);
        }
        match self.round_tripper.round_trip(req).await {
            Ok(res) => res,
            Err(err) => {
                warn!("round trip failed: {err:#}");
                let mut res = HttpResponse::synthetic(StatusCode::BAD_GATEWAY);
                append_warning(&mut res.headers, &err);
                res
            }
        }
    }

    async fn handle_connect(
        &self,
        io: ClientIo,
        buf: BytesMut,
        session: &Arc<Session>,
        mut ctx: RequestContext,
        mut req: HttpRequest,
    ) -> Flow {
        if let Err(err) = self.reqmod.modify_request(&mut ctx, &mut req).await {
            warn!("request modifier failed for CONNECT: {err:#}");
            append_warning(&mut req.headers, &err);
        }
        if session.is_hijacked() {
            return self.detach(io, buf, session).await;
        }
        match &self.mitm {
            Some(mitm) => self.mitm_connect(mitm, io, buf, session, ctx, req).await,
            None => self.blind_connect(io, buf, session, ctx, req).await,
        }
    }

    /// MITM path: answer `200`, sniff the first tunnel byte, then either
    /// terminate TLS (and recurse or delegate to h2) or pass plaintext
    /// through to the request loop.
    async fn mitm_connect(
        &self,
        mitm: &MitmConfig,
        mut io: ClientIo,
        mut buf: BytesMut,
        session: &Arc<Session>,
        mut ctx: RequestContext,
        req: HttpRequest,
    ) -> Flow {
        debug!(target = %req.uri, "terminating CONNECT tunnel");
        let mut res = HttpResponse::connect_established();
        if let Err(err) = self.resmod.modify_response(&mut ctx, &mut res).await {
            warn!("response modifier failed for CONNECT: {err:#}");
            append_warning(&mut res.headers, &err);
        }
        if session.is_hijacked() {
            return self.detach(io, buf, session).await;
        }
        if let Err(err) = self.write_response(&mut io, &res).await {
            warn!("failed to write tunnel response: {err:#}");
            return Flow::Close(io);
        }

        // The client now believes it has a clear tunnel. Its first byte
        // decides the branch; whatever was read is replayed afterwards.
        if buf.is_empty() {
            match io.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("client closed tunnel before sending data");
                    return Flow::Close(io);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("failed to sniff tunnel: {err:#}");
                    return Flow::Close(io);
                }
            }
        }
        let first = buf[0];
        let peeked = PeekStream::new(io, buf.split().freeze());

        if first != TLS_HANDSHAKE_RECORD_TYPE {
            debug!("tunnel client speaks plaintext, re-entering request loop");
            let inner: Pin<Box<dyn Future<Output = ()> + Send + '_>> = Box::pin(self.request_loop(
                Box::new(peeked),
                BytesMut::new(),
                session.clone(),
                None,
            ));
            inner.await;
            return Flow::Detached;
        }

        let host = req.uri.host().unwrap_or_default().to_string();
        let config = match mitm.tls_config_for(&host).await {
            Ok(config) => config,
            Err(err) => {
                warn!(%host, "no TLS config for tunnel host: {err:#}");
                mitm.handshake_error(&req, &io::Error::other(format!("{err:#}")));
                return Flow::Close(Box::new(peeked));
            }
        };
        let tls_stream = match TlsAcceptor::from(config).accept(peeked).await {
            Ok(tls_stream) => tls_stream,
            Err(err) => {
                debug!(%host, "tunnel TLS handshake failed: {err:#}");
                mitm.handshake_error(&req, &err);
                return Flow::Detached;
            }
        };
        let (server_name, alpn) = {
            let (_, server_conn) = tls_stream.get_ref();
            (
                server_conn.server_name().map(str::to_string),
                server_conn
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned()),
            )
        };

        if alpn.as_deref() == Some("h2") {
            let Some(h2) = mitm.h2_handler() else {
                warn!("client negotiated h2 but no h2 handler is configured");
                return Flow::Detached;
            };
            debug!(target = %req.uri, "delegating tunnel to the h2 handler");
            if let Err(err) = h2
                .serve(self.shutdown.clone(), Box::new(tls_stream), req.uri.clone())
                .await
            {
                warn!("h2 handler failed: {err:#}");
            }
            return Flow::Detached;
        }

        session.mark_secure();
        debug!(%host, "tunnel TLS established, re-entering request loop");
        let tls_info = TlsInfo {
            server_name,
            alpn_protocol: alpn,
        };
        let inner: Pin<Box<dyn Future<Output = ()> + Send + '_>> = Box::pin(self.request_loop(
            Box::new(tls_stream),
            BytesMut::new(),
            session.clone(),
            Some(tls_info),
        ));
        inner.await;
        Flow::Detached
    }

    /// Blind path: dial the target (or relay the `CONNECT` to the
    /// downstream proxy), answer, then copy bytes both ways until both
    /// directions finish.
    async fn blind_connect(
        &self,
        mut io: ClientIo,
        mut buf: BytesMut,
        session: &Arc<Session>,
        mut ctx: RequestContext,
        req: HttpRequest,
    ) -> Flow {
        let (mut res, origin) = match self.connect_origin(&req).await {
            Ok(established) => established,
            Err(err) => {
                warn!("failed to establish CONNECT tunnel: {err:#}");
                let mut res = HttpResponse::synthetic(StatusCode::BAD_GATEWAY);
                append_warning(&mut res.headers, &err);
                if let Err(err) = self.resmod.modify_response(&mut ctx, &mut res).await {
                    warn!("response modifier failed for CONNECT: {err:#}");
                    append_warning(&mut res.headers, &err);
                }
                if session.is_hijacked() {
                    return self.detach(io, buf, session).await;
                }
                if let Err(err) = self.write_response(&mut io, &res).await {
                    warn!("failed to write tunnel error response: {err:#}");
                }
                return Flow::Close(io);
            }
        };
        if let Err(err) = self.resmod.modify_response(&mut ctx, &mut res).await {
            warn!("response modifier failed for CONNECT: {err:#}");
            append_warning(&mut res.headers, &err);
        }
        if session.is_hijacked() {
            return self.detach(io, buf, session).await;
        }
        // Headers only; the tunnel payload follows out of band.
        res.body = None;
        if let Err(err) = self.write_response(&mut io, &res).await {
            warn!("failed to write tunnel response: {err:#}");
            return Flow::Close(io);
        }
        let client: ClientIo = if buf.is_empty() {
            io
        } else {
            Box::new(PeekStream::new(io, buf.split().freeze()))
        };
        debug!("CONNECT tunnel established, proxying traffic");
        let (to_origin, from_origin) = forward_bidi(client, origin).await;
        debug!(to_origin, from_origin, "CONNECT tunnel closed");
        Flow::Detached
    }

    /// Opens the origin side of a blind tunnel. With a downstream proxy,
    /// the client's `CONNECT` is relayed verbatim and the proxy's response
    /// returned as-is; otherwise the target is dialed directly and a `200`
    /// fabricated.
    async fn connect_origin(&self, req: &HttpRequest) -> Result<(HttpResponse, ClientIo), AnyError> {
        if let Some(proxy_uri) = &self.proxy_uri {
            let proxy_addr = Authority::from_request_uri(proxy_uri)
                .context("invalid downstream proxy URI")?
                .to_string();
            debug!(%proxy_addr, "relaying CONNECT to downstream proxy");
            let mut conn = self
                .dialer
                .dial(&proxy_addr)
                .await
                .std_context("failed to dial downstream proxy")?;
            let target = req
                .uri
                .authority()
                .map(|a| a.as_str().to_string())
                .context("CONNECT request without authority")?;
            conn.write_all(&req.encode(&target))
                .await
                .std_context("failed to relay CONNECT to downstream proxy")?;
            conn.flush()
                .await
                .std_context("failed to relay CONNECT to downstream proxy")?;
            let mut buf = BytesMut::new();
            let res = HttpResponse::read_head(&mut conn, &mut buf)
                .await
                .std_context("failed to read downstream proxy response")?;
            let conn: ClientIo = if buf.is_empty() {
                conn
            } else {
                Box::new(PeekStream::new(conn, buf.split().freeze()))
            };
            Ok((res, conn))
        } else {
            let target = Authority::from_authority_uri(&req.uri).context("invalid CONNECT target")?;
            debug!(%target, "dialing CONNECT target");
            let conn = self
                .dialer
                .dial(&target.to_string())
                .await
                .std_context("failed to dial CONNECT target")?;
            Ok((HttpResponse::connect_established(), conn))
        }
    }

    /// Hands the stream to the hijacking modifier and forgets about it.
    async fn detach(&self, io: ClientIo, buf: BytesMut, session: &Session) -> Flow {
        debug!("connection hijacked by modifier, releasing stream");
        if let Some(handler) = session.take_hijacker() {
            let io: ClientIo = if buf.is_empty() {
                io
            } else {
                Box::new(PeekStream::new(io, buf.freeze()))
            };
            handler(io).await;
        }
        Flow::Detached
    }

    async fn write_response(&self, io: &mut ClientIo, res: &HttpResponse) -> io::Result<()> {
        let encoded = res.encode();
        tokio::time::timeout(self.timeout, async {
            io.write_all(&encoded).await?;
            io.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response write timed out"))?
    }
}
