//! The proxy engine: configuration surface, accept loop, and shutdown
//! coordination. The per-connection request pipeline lives in
//! [`pipeline`](self::pipeline).

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use http::Uri;
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    client::{Dialer, DynDialer, DynRoundTripper, HttpClient, RoundTripper, TcpDialer},
    error::is_temporary_accept_error,
    mitm::MitmConfig,
    modify::{DynRequestModifier, DynResponseModifier, Noop, RequestModifier, ResponseModifier},
    session::Session,
    util::{disable_sigpipe, set_tcp_keepalive},
};

mod pipeline;

/// Idle deadline applied to each request on a connection.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// TCP keep-alive period for accepted client connections.
const ACCEPT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

const ACCEPT_BACKOFF_FLOOR: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_CEIL: Duration = Duration::from_secs(1);

/// An intercepting HTTP(S) forward proxy.
///
/// Configure with the setters, share behind an [`Arc`], then run
/// [`serve`](Self::serve). [`close`](Self::close) stops accepting, lets
/// in-flight requests finish, and waits for every connection task to exit.
#[derive(derive_more::Debug)]
pub struct Proxy {
    #[debug("Arc<dyn RoundTripper>")]
    pub(crate) round_tripper: Arc<DynRoundTripper<'static>>,
    stock_round_tripper: bool,
    #[debug("Arc<dyn Dialer>")]
    pub(crate) dialer: Arc<DynDialer<'static>>,
    pub(crate) timeout: Duration,
    pub(crate) mitm: Option<MitmConfig>,
    pub(crate) proxy_uri: Option<Uri>,
    #[debug("Arc<dyn RequestModifier>")]
    pub(crate) reqmod: Arc<DynRequestModifier<'static>>,
    #[debug("Arc<dyn ResponseModifier>")]
    pub(crate) resmod: Arc<DynResponseModifier<'static>>,
    pub(crate) shutdown: CancellationToken,
    conns: TaskTracker,
    session_ids: AtomicU64,
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxy {
    /// Creates a proxy with the stock round tripper, plain TCP dialing, a
    /// five minute request timeout, and no MITM configuration.
    pub fn new() -> Self {
        let dialer: Arc<DynDialer<'static>> = Arc::from(DynDialer::boxed(TcpDialer::default()));
        Self {
            round_tripper: Arc::from(DynRoundTripper::boxed(
                HttpClient::new().with_shared_dialer(dialer.clone()),
            )),
            stock_round_tripper: true,
            dialer,
            timeout: DEFAULT_TIMEOUT,
            mitm: None,
            proxy_uri: None,
            reqmod: Arc::from(DynRequestModifier::boxed(Noop)),
            resmod: Arc::from(DynResponseModifier::boxed(Noop)),
            shutdown: CancellationToken::new(),
            conns: TaskTracker::new(),
            session_ids: AtomicU64::new(0),
        }
    }

    /// Overrides the upstream round tripper.
    pub fn set_round_tripper(&mut self, round_tripper: impl RoundTripper + 'static) {
        self.round_tripper = Arc::from(DynRoundTripper::boxed(round_tripper));
        self.stock_round_tripper = false;
    }

    /// Overrides the dial capability used for tunnels and, unless the round
    /// tripper was replaced, for upstream requests.
    pub fn set_dialer(&mut self, dialer: impl Dialer + 'static) {
        self.dialer = Arc::from(DynDialer::boxed(dialer));
        self.rebuild_stock_round_tripper();
    }

    /// Sets the per-request idle deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Enables TLS interception of `CONNECT` tunnels. Without it, tunnels
    /// are relayed blindly.
    pub fn set_mitm(&mut self, mitm: MitmConfig) {
        self.mitm = Some(mitm);
    }

    /// Routes all upstream traffic through this downstream proxy.
    pub fn set_downstream_proxy(&mut self, proxy_uri: Uri) {
        self.proxy_uri = Some(proxy_uri);
        self.rebuild_stock_round_tripper();
    }

    /// Sets the modifier applied to every request, including `CONNECT`.
    pub fn set_request_modifier(&mut self, reqmod: impl RequestModifier + 'static) {
        self.reqmod = Arc::from(DynRequestModifier::boxed(reqmod));
    }

    /// Sets the modifier applied to every response, including synthetic
    /// ones.
    pub fn set_response_modifier(&mut self, resmod: impl ResponseModifier + 'static) {
        self.resmod = Arc::from(DynResponseModifier::boxed(resmod));
    }

    fn rebuild_stock_round_tripper(&mut self) {
        if self.stock_round_tripper {
            let client = HttpClient::new()
                .with_shared_dialer(self.dialer.clone())
                .with_shared_proxy(self.proxy_uri.clone());
            self.round_tripper = Arc::from(DynRoundTripper::boxed(client));
        }
    }

    /// Accepts connections from the listener and handles their requests
    /// until the proxy enters the closing state or accepting fails
    /// permanently.
    ///
    /// Transient accept failures back off exponentially from 5 ms, clamped
    /// to one second, resetting after any successful accept.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut delay = Duration::ZERO;
        loop {
            if self.closing() {
                debug!("proxy is closing, leaving accept loop");
                return Ok(());
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    debug!("proxy is closing, leaving accept loop");
                    return Ok(());
                }
            };
            let (stream, client_addr) = match accepted {
                Ok(conn) => conn,
                Err(err) if is_temporary_accept_error(&err) => {
                    delay = next_accept_delay(delay);
                    warn!("temporary accept failure, backing off {delay:?}: {err:#}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    return Err(err).std_context("failed to accept connection");
                }
            };
            delay = Duration::ZERO;
            if let Err(err) = set_tcp_keepalive(&stream, ACCEPT_KEEPALIVE_PERIOD) {
                debug!("failed to enable TCP keep-alive: {err:#}");
            }
            disable_sigpipe(&stream);
            let id = self.session_ids.fetch_add(1, Ordering::SeqCst);
            debug!(%client_addr, id, "accepted connection");
            let session = Session::new(id, client_addr);
            let this = self.clone();
            self.conns.spawn(
                async move {
                    this.serve_conn(Box::new(stream), session).await;
                }
                .instrument(error_span!("conn", id, client = %client_addr)),
            );
        }
    }

    /// Puts the proxy into the closing state and waits for every
    /// connection task to exit.
    ///
    /// New accepts observe the state and return cleanly; in-flight requests
    /// complete, their responses carrying `Connection: close`.
    pub async fn close(&self) {
        debug!("closing proxy");
        self.shutdown.cancel();
        self.conns.close();
        debug!("waiting for {} connections to close", self.conns.len());
        self.conns.wait().await;
        debug!("all connections closed");
    }

    /// Whether the proxy is in the closing state.
    pub fn closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn next_accept_delay(delay: Duration) -> Duration {
    if delay.is_zero() {
        ACCEPT_BACKOFF_FLOOR
    } else {
        (delay * 2).min(ACCEPT_BACKOFF_CEIL)
    }
}
