//! Per-connection and per-request state shared with modifiers.

use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::util::ClientIo;

/// A function that takes over a hijacked client stream.
pub type HijackHandler =
    Box<dyn FnOnce(ClientIo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// State for one client connection, spanning every request on it including
/// requests inside a MITM'd `CONNECT` tunnel.
///
/// The `secure` and `hijacked` flags are monotonic: once set they are never
/// cleared for the lifetime of the session.
#[derive(derive_more::Debug)]
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    secure: AtomicBool,
    hijacked: AtomicBool,
    #[debug(skip)]
    hijacker: Mutex<Option<HijackHandler>>,
}

impl Session {
    pub(crate) fn new(id: u64, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            secure: AtomicBool::new(false),
            hijacked: AtomicBool::new(false),
            hijacker: Mutex::new(None),
        })
    }

    /// Identifier of this session, unique within the proxy.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the client connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the client connection is TLS at this point.
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub(crate) fn mark_secure(&self) {
        self.secure.store(true, Ordering::Release);
    }

    /// Whether a modifier has taken ownership of the client stream.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::Acquire)
    }

    /// Takes ownership of the raw client stream.
    ///
    /// After the current modifier returns, the pipeline hands the stream
    /// (with any already-buffered bytes replayed in front) to `handler` and
    /// performs no further I/O on it. The session stays hijacked for good.
    pub fn hijack<F>(&self, handler: impl FnOnce(ClientIo) -> F + Send + 'static)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.hijacker.lock().expect("hijacker lock poisoned");
        *slot = Some(Box::new(move |io| Box::pin(handler(io))));
        self.hijacked.store(true, Ordering::Release);
    }

    pub(crate) fn take_hijacker(&self) -> Option<HijackHandler> {
        self.hijacker.lock().expect("hijacker lock poisoned").take()
    }
}

/// Per-request state handed to modifiers alongside the message.
///
/// Rebuilt for every request on a connection; only the [`Session`] carries
/// over.
#[derive(derive_more::Debug)]
pub struct RequestContext {
    session: Arc<Session>,
    skip_round_trip: bool,
    #[debug(skip)]
    storage: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            skip_round_trip: false,
            storage: HashMap::new(),
        }
    }

    /// The session this request belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Instructs the pipeline to answer with a synthetic `200 OK` instead
    /// of contacting any origin.
    pub fn skip_round_trip(&mut self) {
        self.skip_round_trip = true;
    }

    /// Whether the round trip will be skipped.
    pub fn skipping_round_trip(&self) -> bool {
        self.skip_round_trip
    }

    /// Stores a value for later modifier invocations on this request.
    pub fn set(&mut self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.storage.insert(key.into(), Box::new(value));
    }

    /// Returns a value stored by an earlier modifier invocation.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn secure_flag_is_monotonic() {
        let session = Session::new(1, addr());
        assert!(!session.is_secure());
        session.mark_secure();
        session.mark_secure();
        assert!(session.is_secure());
    }

    #[tokio::test]
    async fn hijack_installs_handler_once() {
        let session = Session::new(2, addr());
        assert!(!session.is_hijacked());
        session.hijack(|_io| async {});
        assert!(session.is_hijacked());
        assert!(session.take_hijacker().is_some());
        assert!(session.take_hijacker().is_none());
        assert!(session.is_hijacked());
    }

    #[test]
    fn context_storage_roundtrips_by_type() {
        let mut ctx = RequestContext::new(Session::new(3, addr()));
        ctx.set("attempt", 7u32);
        assert_eq!(ctx.get::<u32>("attempt"), Some(&7));
        assert_eq!(ctx.get::<String>("attempt"), None);
    }
}
