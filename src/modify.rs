//! Modifier interfaces applied to every request and response that crosses
//! the proxy.
//!
//! Modifier failures are never fatal: the pipeline records them as a
//! `Warning` header on the message and carries on.

use std::future::Future;

use dynosaur::dynosaur;
use n0_error::AnyError;

use crate::{
    parse::{HttpRequest, HttpResponse},
    session::RequestContext,
};

#[dynosaur(pub(crate) DynRequestModifier = dyn RequestModifier)]
/// Inspects and rewrites requests before they are forwarded, including
/// `CONNECT` requests.
pub trait RequestModifier: Send + Sync {
    /// Modifies the request in place.
    ///
    /// Note: errors surface as a `Warning` header, not as a failure of the
    /// exchange.
    fn modify_request<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        req: &'a mut HttpRequest,
    ) -> impl Future<Output = Result<(), AnyError>> + Send + 'a;
}

#[dynosaur(pub(crate) DynResponseModifier = dyn ResponseModifier)]
/// Inspects and rewrites responses before they are written back, including
/// synthetic `200`s and `502`s.
pub trait ResponseModifier: Send + Sync {
    /// Modifies the response in place.
    ///
    /// Note: errors surface as a `Warning` header, not as a failure of the
    /// exchange.
    fn modify_response<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        res: &'a mut HttpResponse,
    ) -> impl Future<Output = Result<(), AnyError>> + Send + 'a;
}

/// Modifier that leaves every message untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl RequestModifier for Noop {
    async fn modify_request<'a>(
        &'a self,
        _ctx: &'a mut RequestContext,
        _req: &'a mut HttpRequest,
    ) -> Result<(), AnyError> {
        Ok(())
    }
}

impl ResponseModifier for Noop {
    async fn modify_response<'a>(
        &'a self,
        _ctx: &'a mut RequestContext,
        _res: &'a mut HttpResponse,
    ) -> Result<(), AnyError> {
        Ok(())
    }
}
