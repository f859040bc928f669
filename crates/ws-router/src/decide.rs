use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use http::StatusCode;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;

use crate::error::UsageError;
use crate::request::Request;

/// A live server-side WebSocket produced by an accepted upgrade.
pub type WebSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Status used when an upgrade is rejected without an explicit code.
pub const DEFAULT_REJECT_STATUS: StatusCode = StatusCode::UNAUTHORIZED;

type HandlerFn = Box<dyn FnOnce(WebSocket, Request) -> BoxFuture<'static, ()> + Send>;

/// User code run once the socket handshake completes at the transport layer.
pub struct ConnectionHandler(HandlerFn);

impl ConnectionHandler {
    /// Handler receiving the live socket and the original request.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(WebSocket, Request) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move |socket, req| Box::pin(f(socket, req))))
    }

    /// Handler that only needs the socket.
    pub fn from_socket<F, Fut>(f: F) -> Self
    where
        F: FnOnce(WebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(move |socket, _req| f(socket))
    }

    pub(crate) fn call(self, socket: WebSocket, req: Request) -> BoxFuture<'static, ()> {
        (self.0)(socket, req)
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionHandler(..)")
    }
}

/// Final resolution of one upgrade attempt.
#[derive(Debug)]
pub enum Decision {
    Accept(ConnectionHandler),
    Reject {
        status: StatusCode,
        message: Option<String>,
    },
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Argument given to [`Decide::decide`].
///
/// * a [`ConnectionHandler`] accepts;
/// * `false` rejects with [`DEFAULT_REJECT_STATUS`];
/// * a [`StatusCode`] is `false` with an explicit status, so
///   `decide(StatusCode::FORBIDDEN)` rejects with 403;
/// * `true` is not a connection handler and is a usage error.
#[derive(Debug)]
pub enum Verdict {
    Accept(ConnectionHandler),
    Reject {
        status: Option<StatusCode>,
        message: Option<String>,
    },
    /// Anything that is neither a handler nor a rejection. The string
    /// describes what was passed.
    Invalid(String),
}

impl From<bool> for Verdict {
    fn from(accept: bool) -> Self {
        if accept {
            Self::Invalid("`true`".to_string())
        } else {
            Self::Reject {
                status: None,
                message: None,
            }
        }
    }
}

impl From<ConnectionHandler> for Verdict {
    fn from(handler: ConnectionHandler) -> Self {
        Self::Accept(handler)
    }
}

/// A rejection carrying `status`.
impl From<StatusCode> for Verdict {
    fn from(status: StatusCode) -> Self {
        Self::Reject {
            status: Some(status),
            message: None,
        }
    }
}

struct Slot {
    tx: Mutex<Option<oneshot::Sender<Decision>>>,
}

/// One-shot decision handle for an upgrade attempt.
///
/// Clones share the same slot: the first settlement wins and every later
/// attempt fails with [`UsageError::AlreadyHandled`]. If every clone is
/// dropped while the slot is still pending, the bridge rejects the attempt
/// with a server error.
#[derive(Clone)]
pub struct Decide {
    slot: Arc<Slot>,
}

impl Decide {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        let decide = Self {
            slot: Arc::new(Slot {
                tx: Mutex::new(Some(tx)),
            }),
        };
        (decide, rx)
    }

    /// Resolve the attempt from a dynamic verdict.
    ///
    /// An [`Verdict::Invalid`] argument rejects the attempt with 500 and then
    /// returns [`UsageError::NotAHandler`].
    pub fn decide(&self, verdict: impl Into<Verdict>) -> Result<(), UsageError> {
        match verdict.into() {
            Verdict::Accept(handler) => self.settle(Decision::Accept(handler)),
            Verdict::Reject { status, message } => self.settle(Decision::Reject {
                status: status.unwrap_or(DEFAULT_REJECT_STATUS),
                message,
            }),
            Verdict::Invalid(what) => {
                self.settle(Decision::Reject {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: None,
                })?;
                Err(UsageError::NotAHandler(what))
            }
        }
    }

    pub fn accept(&self, handler: ConnectionHandler) -> Result<(), UsageError> {
        self.settle(Decision::Accept(handler))
    }

    /// Accept with a closure receiving the socket and the original request.
    pub fn accept_with<F, Fut>(&self, f: F) -> Result<(), UsageError>
    where
        F: FnOnce(WebSocket, Request) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.accept(ConnectionHandler::new(f))
    }

    pub fn reject(&self, status: StatusCode) -> Result<(), UsageError> {
        self.settle(Decision::Reject {
            status,
            message: None,
        })
    }

    pub fn reject_with(
        &self,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Result<(), UsageError> {
        self.settle(Decision::Reject {
            status,
            message: Some(message.into()),
        })
    }

    pub fn is_handled(&self) -> bool {
        self.lock().is_none()
    }

    fn settle(&self, decision: Decision) -> Result<(), UsageError> {
        let tx = self.lock().take().ok_or(UsageError::AlreadyHandled)?;
        // The receiver only goes away once the bridge stopped waiting, in
        // which case the attempt is already gone.
        let _ = tx.send(decision);
        Ok(())
    }

    /// Settle unless already handled. Returns whether this call settled it.
    pub(crate) fn settle_if_pending(&self, decision: Decision) -> bool {
        self.settle(decision).is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<Decision>>> {
        self.slot.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Decide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decide")
            .field("handled", &self.is_handled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(decision: Decision) -> (StatusCode, Option<String>) {
        match decision {
            Decision::Reject { status, message } => (status, message),
            Decision::Accept(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn first_settlement_wins() {
        let (decide, rx) = Decide::channel();
        decide.reject(StatusCode::UNAUTHORIZED).unwrap();
        assert!(decide.is_handled());

        let err = decide
            .accept(ConnectionHandler::from_socket(|_socket| async {}))
            .unwrap_err();
        assert_eq!(err, UsageError::AlreadyHandled);

        let (status, _) = rejected(rx.await.unwrap());
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn clones_share_the_slot() {
        let (decide, rx) = Decide::channel();
        let other = decide.clone();
        other.reject_with(StatusCode::FORBIDDEN, "nope").unwrap();
        assert!(decide.is_handled());
        assert_eq!(
            decide.reject(StatusCode::NOT_FOUND),
            Err(UsageError::AlreadyHandled)
        );
        assert_eq!(
            rejected(rx.await.unwrap()),
            (StatusCode::FORBIDDEN, Some("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn false_rejects_with_default_status() {
        let (decide, rx) = Decide::channel();
        decide.decide(false).unwrap();
        assert_eq!(rejected(rx.await.unwrap()).0, DEFAULT_REJECT_STATUS);
    }

    #[tokio::test]
    async fn status_code_verdict_rejects_with_that_status() {
        let (decide, rx) = Decide::channel();
        decide.decide(StatusCode::UNAUTHORIZED).unwrap();
        assert_eq!(rejected(rx.await.unwrap()).0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_verdict_rejects_and_errors() {
        let (decide, rx) = Decide::channel();
        let err = decide.decide(true).unwrap_err();
        assert!(matches!(err, UsageError::NotAHandler(_)));
        assert_eq!(
            rejected(rx.await.unwrap()).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn invalid_verdict_after_settlement_reports_already_handled() {
        let (decide, rx) = Decide::channel();
        decide.reject(StatusCode::UNAUTHORIZED).unwrap();
        assert_eq!(decide.decide(true), Err(UsageError::AlreadyHandled));
        assert_eq!(rejected(rx.await.unwrap()).0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accept_delivers_handler() {
        let (decide, rx) = Decide::channel();
        decide.accept_with(|_socket, _req| async {}).unwrap();
        assert!(rx.await.unwrap().is_accept());
    }

    #[tokio::test]
    async fn settle_if_pending_is_silent() {
        let (decide, rx) = Decide::channel();
        decide.reject(StatusCode::UNAUTHORIZED).unwrap();
        assert!(!decide.settle_if_pending(Decision::Reject {
            status: StatusCode::NOT_FOUND,
            message: None,
        }));
        assert_eq!(rejected(rx.await.unwrap()).0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dropping_every_clone_closes_the_channel() {
        let (decide, rx) = Decide::channel();
        let clone = decide.clone();
        drop(decide);
        drop(clone);
        assert!(rx.await.is_err());
    }
}
