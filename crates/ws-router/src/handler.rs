use std::future::Future;

use async_trait::async_trait;

use crate::decide::Decide;
use crate::error::RouteError;
use crate::request::Request;
use crate::response::Response;

/// What a handler wants dispatch to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next handler or layer.
    Next,
    /// Skip the remaining handlers of the current route.
    NextRoute,
    /// The exchange is handled; stop dispatching.
    Stop,
}

/// HTTP middleware or route handler.
///
/// Also runs for WebSocket upgrade attempts that reach it, in which case
/// `res` is the upgrade shim and writing to it rejects the upgrade.
///
/// Sync closures of the shape
/// `Fn(&mut Request, &mut Response) -> Result<Flow, RouteError>` implement
/// this trait.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Flow, RouteError>;
}

#[async_trait]
impl<F> Middleware for F
where
    F: Fn(&mut Request, &mut Response) -> Result<Flow, RouteError> + Send + Sync + 'static,
{
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Flow, RouteError> {
        self(req, res)
    }
}

/// Error-handling middleware. Only runs while dispatch carries an error.
///
/// Returning `Ok(Flow::Next)` clears the error, returning `Err` passes an
/// error on, and `Ok(Flow::Stop)` ends dispatch.
#[async_trait]
pub trait ErrorMiddleware: Send + Sync + 'static {
    async fn handle_error(
        &self,
        err: RouteError,
        req: &mut Request,
        res: &mut Response,
    ) -> Result<Flow, RouteError>;
}

#[async_trait]
impl<F> ErrorMiddleware for F
where
    F: Fn(RouteError, &mut Request, &mut Response) -> Result<Flow, RouteError>
        + Send
        + Sync
        + 'static,
{
    async fn handle_error(
        &self,
        err: RouteError,
        req: &mut Request,
        res: &mut Response,
    ) -> Result<Flow, RouteError> {
        self(err, req, res)
    }
}

/// Handler registered under the websocket verb.
///
/// Receives the upgrade attempt and a route-scoped [`Decide`] handle. The
/// handle may be settled before returning, or cloned and settled later from
/// another task.
///
/// Closures `Fn(&Request, Decide) -> impl Future<Output = Result<Flow, RouteError>>`
/// implement this trait; the returned future cannot borrow the request, so
/// copy what it needs out first.
#[async_trait]
pub trait UpgradeHandler: Send + Sync + 'static {
    async fn upgrade(&self, req: &Request, cb: Decide) -> Result<Flow, RouteError>;
}

#[async_trait]
impl<F, Fut> UpgradeHandler for F
where
    F: Fn(&Request, Decide) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, RouteError>> + Send + 'static,
{
    async fn upgrade(&self, req: &Request, cb: Decide) -> Result<Flow, RouteError> {
        self(req, cb).await
    }
}
