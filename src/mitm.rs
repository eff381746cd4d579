//! Configuration surface for TLS interception of `CONNECT` tunnels.
//!
//! Certificate authority handling and per-host certificate minting live
//! outside the engine; the pipeline only consumes a ready-made
//! [`rustls::ServerConfig`] per hostname through [`HostTlsConfig`]. When
//! the terminated client negotiates `h2` via ALPN, the tunnel is handed to
//! an injected [`H2Handler`] instead of the HTTP/1 request loop.

use std::{future::Future, io, sync::Arc};

use dynosaur::dynosaur;
use http::Uri;
use n0_error::AnyError;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

use crate::{parse::HttpRequest, util::ClientIo};

#[dynosaur(pub(crate) DynHostTlsConfig = dyn HostTlsConfig)]
/// Produces the TLS server configuration used to terminate a tunnel to the
/// given hostname.
pub trait HostTlsConfig: Send + Sync {
    /// Returns a server config whose certificate is valid for `host`.
    fn tls_config_for<'a>(
        &'a self,
        host: &'a str,
    ) -> impl Future<Output = Result<Arc<ServerConfig>, AnyError>> + Send + 'a;
}

#[dynosaur(pub(crate) DynH2Handler = dyn H2Handler)]
/// Serves a terminated tunnel whose client negotiated HTTP/2.
pub trait H2Handler: Send + Sync {
    /// Takes over `stream` until the connection ends or `shutdown` fires.
    fn serve<'a>(
        &'a self,
        shutdown: CancellationToken,
        stream: ClientIo,
        target: Uri,
    ) -> impl Future<Output = Result<(), AnyError>> + Send + 'a;
}

/// Callback invoked when terminating a tunnel fails during the TLS
/// handshake.
pub type HandshakeErrorCallback = Box<dyn Fn(&HttpRequest, &io::Error) + Send + Sync>;

/// Enables MITM handling of `CONNECT` requests. Without it, tunnels are
/// relayed blindly.
#[derive(derive_more::Debug)]
pub struct MitmConfig {
    #[debug("Arc<dyn HostTlsConfig>")]
    tls_configs: Arc<DynHostTlsConfig<'static>>,
    #[debug(skip)]
    handshake_error_callback: Option<HandshakeErrorCallback>,
    #[debug("{:?}", h2.as_ref().map(|_| "Arc<dyn H2Handler>"))]
    h2: Option<Arc<DynH2Handler<'static>>>,
}

impl MitmConfig {
    /// Creates a MITM configuration from a per-host TLS config source.
    pub fn new(tls_configs: impl HostTlsConfig + 'static) -> Self {
        Self {
            tls_configs: Arc::from(DynHostTlsConfig::boxed(tls_configs)),
            handshake_error_callback: None,
            h2: None,
        }
    }

    /// Installs a callback for failed tunnel handshakes.
    pub fn with_handshake_error_callback(
        mut self,
        callback: impl Fn(&HttpRequest, &io::Error) + Send + Sync + 'static,
    ) -> Self {
        self.handshake_error_callback = Some(Box::new(callback));
        self
    }

    /// Delegates tunnels whose client negotiates `h2` to the given handler.
    ///
    /// Note: without a handler, the TLS config source should not advertise
    /// `h2` in its ALPN protocols.
    pub fn with_h2_handler(mut self, handler: impl H2Handler + 'static) -> Self {
        self.h2 = Some(Arc::from(DynH2Handler::boxed(handler)));
        self
    }

    pub(crate) async fn tls_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, AnyError> {
        self.tls_configs.tls_config_for(host).await
    }

    pub(crate) fn handshake_error(&self, req: &HttpRequest, err: &io::Error) {
        if let Some(callback) = &self.handshake_error_callback {
            callback(req, err);
        }
    }

    pub(crate) fn h2_handler(&self) -> Option<&Arc<DynH2Handler<'static>>> {
        self.h2.as_ref()
    }
}

/// TLS state of a terminated client connection, attached to every request
/// parsed from inside the tunnel.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// SNI hostname presented by the client, if any.
    pub server_name: Option<String>,
    /// ALPN protocol negotiated with the client, if any.
    pub alpn_protocol: Option<String>,
}
