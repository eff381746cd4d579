use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub(crate) use self::peek::PeekStream;

mod peek;

/// Marker for the byte streams the engine moves around: client sockets,
/// TLS-wrapped sockets, dialed origin connections.
pub trait ConnIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnIo for T {}

/// An owned, type-erased connection stream.
pub type ClientIo = Box<dyn ConnIo>;

/// Bidirectionally copies between the client side and the origin side of a
/// tunnel until both directions have finished.
///
/// Each direction half-closes its write side when its copy ends. Errors
/// other than EOF are logged and do not abort the peer direction; the
/// peer's read terminates naturally once the stream closes.
pub(crate) async fn forward_bidi(
    client: impl AsyncRead + AsyncWrite + Send + Unpin,
    origin: impl AsyncRead + AsyncWrite + Send + Unpin,
) -> (u64, u64) {
    let (mut client_recv, mut client_send) = io::split(client);
    let (mut origin_recv, mut origin_send) = io::split(origin);
    let (to_origin, from_origin) = tokio::join!(
        async {
            let res = io::copy(&mut client_recv, &mut origin_send).await;
            origin_send.shutdown().await.ok();
            trace!(?res, "tunnel client-to-origin finished");
            res
        },
        async {
            let res = io::copy(&mut origin_recv, &mut client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, "tunnel origin-to-client finished");
            res
        }
    );
    let to_origin = to_origin.unwrap_or_else(|err| {
        debug!("tunnel client-to-origin failed: {err:#}");
        0
    });
    let from_origin = from_origin.unwrap_or_else(|err| {
        debug!("tunnel origin-to-client failed: {err:#}");
        0
    });
    (to_origin, from_origin)
}

/// Enables TCP keep-alive probing with the given period.
pub(crate) fn set_tcp_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Keeps writes to a closed peer from raising SIGPIPE on platforms where
/// the signal is per-socket. Elsewhere the runtime already ignores it.
pub(crate) fn disable_sigpipe(stream: &TcpStream) {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    SockRef::from(stream).set_nosigpipe(true).ok();
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let _ = stream;
}
