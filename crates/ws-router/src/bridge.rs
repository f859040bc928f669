use std::fmt;
use std::sync::Arc;

use http::{Method, StatusCode};

use crate::decide::{ConnectionHandler, Decide, Decision, WebSocket};
use crate::error::RouteError;
use crate::options::ResolvedOptions;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Outcome, Router};

/// Result of verifying one upgrade attempt.
#[derive(Debug)]
pub enum Verification {
    Accepted(PendingConnection),
    Rejected {
        status: StatusCode,
        message: Option<String>,
    },
}

impl Verification {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// An accepted attempt waiting for the transport to finish the handshake.
///
/// Owns the connection handler; [`complete`](Self::complete) consumes both,
/// so the handler runs at most once.
#[derive(Debug)]
pub struct PendingConnection {
    handler: ConnectionHandler,
    request: Request,
}

impl PendingConnection {
    /// The request that was accepted, with its original method restored.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Run the connection handler on the established socket.
    pub async fn complete(self, socket: WebSocket) {
        self.handler.call(socket, self.request).await;
    }
}

/// Runs upgrade attempts through a router and produces exactly one decision
/// per attempt.
#[derive(Clone)]
pub struct HandshakeBridge {
    router: Arc<Router>,
    method: Method,
    module_name: String,
}

impl HandshakeBridge {
    pub fn new(router: Arc<Router>, options: &ResolvedOptions) -> Self {
        Self {
            router,
            method: options.method().clone(),
            module_name: options.module_name().to_string(),
        }
    }

    /// Dispatch `req` as an upgrade attempt.
    ///
    /// The request runs under the synthetic websocket method with an upgrade
    /// shim as its response. Unless a layer decides first, the attempt is
    /// rejected with 404, or with the status of the error dispatch ended
    /// with. Resolves once some holder of the [`Decide`] handle settles it,
    /// which may happen after dispatch returned.
    pub async fn verify(&self, mut req: Request) -> Verification {
        let (decide, rx) = Decide::channel();
        req.set_method(self.method.clone());
        let mut res = Response::upgrade(decide.clone());

        let outcome = self.router.handle(&mut req, &mut res).await;
        match outcome {
            Outcome::Handled => {}
            Outcome::Unhandled(None) => {
                if decide.settle_if_pending(Decision::Reject {
                    status: StatusCode::NOT_FOUND,
                    message: None,
                }) {
                    tracing::debug!(
                        module = %self.module_name,
                        path = %req.uri().path(),
                        "no websocket route handled upgrade"
                    );
                }
            }
            Outcome::Unhandled(Some(err)) => {
                tracing::warn!(
                    module = %self.module_name,
                    path = %req.uri().path(),
                    error = %err,
                    "upgrade dispatch ended with unhandled error"
                );
                let message = match &err {
                    RouteError::Status { message, .. } => Some(message.clone()),
                    _ => None,
                };
                decide.settle_if_pending(Decision::Reject {
                    status: err.status_code(),
                    message,
                });
            }
        }

        // Only clones kept by handlers may still settle the attempt.
        drop(res);
        drop(decide);

        let decision = rx.await;
        req.restore_method();

        match decision {
            Ok(Decision::Accept(handler)) => Verification::Accepted(PendingConnection {
                handler,
                request: req,
            }),
            Ok(Decision::Reject { status, message }) => {
                Verification::Rejected { status, message }
            }
            Err(_) => {
                tracing::warn!(
                    module = %self.module_name,
                    path = %req.uri().path(),
                    "upgrade decision handle dropped without a decision"
                );
                Verification::Rejected {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: None,
                }
            }
        }
    }
}

impl fmt::Debug for HandshakeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeBridge")
            .field("method", &self.method)
            .field("module_name", &self.module_name)
            .finish()
    }
}
