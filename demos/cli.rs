use std::{sync::Arc, time::Duration};

use clap::Parser;
use http::Uri;
use n0_error::{AnyError, Result};
use tapwire::{
    HttpRequest, HttpResponse, Proxy, RequestContext, RequestModifier, ResponseModifier,
};
use tokio::net::TcpListener;
use tracing::info;

/// Runs a forward proxy that logs every exchange.
///
/// Without a MITM certificate source, CONNECT tunnels are relayed blindly.
#[derive(Parser)]
struct Cli {
    /// Port to listen on.
    #[clap(short, long, default_value_t = 8080)]
    port: u16,
    /// Forward all upstream traffic through this proxy.
    #[clap(long)]
    downstream_proxy: Option<Uri>,
    /// Per-request idle timeout in seconds.
    #[clap(long, default_value_t = 300)]
    timeout: u64,
}

struct LogTraffic;

impl RequestModifier for LogTraffic {
    async fn modify_request<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        req: &'a mut HttpRequest,
    ) -> Result<(), AnyError> {
        info!(
            session = ctx.session().id(),
            client = %ctx.session().remote_addr(),
            "{} {}",
            req.method,
            req.uri
        );
        Ok(())
    }
}

impl ResponseModifier for LogTraffic {
    async fn modify_response<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        res: &'a mut HttpResponse,
    ) -> Result<(), AnyError> {
        info!(session = ctx.session().id(), "{}", res.status);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut proxy = Proxy::new();
    proxy.set_timeout(Duration::from_secs(cli.timeout));
    proxy.set_request_modifier(LogTraffic);
    proxy.set_response_modifier(LogTraffic);
    if let Some(uri) = cli.downstream_proxy {
        proxy.set_downstream_proxy(uri);
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", cli.port)).await?;
    println!("proxy listening on {}", listener.local_addr()?);
    let proxy = Arc::new(proxy);
    tokio::select! {
        res = proxy.clone().serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => proxy.close().await,
    }
    Ok(())
}
