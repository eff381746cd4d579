//! A programmable intercepting HTTP(S) forward proxy engine.
//!
//! The proxy terminates client connections, parses HTTP/1 requests, lets
//! user-supplied [`RequestModifier`]s and [`ResponseModifier`]s inspect and
//! rewrite traffic, forwards requests to origins (directly or through a
//! downstream proxy), and streams responses back. `CONNECT` tunnels are
//! either relayed blindly or terminated with a per-host TLS certificate
//! when a [`mitm::MitmConfig`] is installed.

pub mod client;
mod error;
pub mod mitm;
mod modify;
mod parse;
pub mod proxy;
pub mod session;
mod util;

pub use modify::{Noop, RequestModifier, ResponseModifier};
pub use parse::{Authority, HttpRequest, HttpResponse, append_warning};
pub use proxy::Proxy;
pub use session::{RequestContext, Session};
pub use util::{ClientIo, ConnIo};

/// How much data to read for a request or response header section before
/// it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// First byte of a TLS handshake record (RFC 8446, section 5.1).
///
/// Inside a `CONNECT` tunnel this byte decides between TLS termination and
/// plaintext passthrough.
pub(crate) const TLS_HANDSHAKE_RECORD_TYPE: u8 = 0x16;
