//! Express-style HTTP routing with WebSocket upgrades dispatched through the
//! same middleware stack.
//!
//! Routes register WebSocket handlers under a synthetic verb (`websocket` by
//! default). When an upgrade attempt arrives, the [`HandshakeBridge`] runs it
//! through the router with that verb as the request method and an upgrade
//! shim as the response, so authorization or logging middleware written for
//! plain HTTP also gates socket upgrades.
//!
//! # Architecture
//!
//! ```text
//! TCP --> hyper http1 --+-- plain request ----> Router --> Response
//!                       |
//!                       +-- upgrade attempt --> HandshakeBridge --> Router
//!                                                   |          (WEBSOCKET verb,
//!                                                   |           upgrade shim)
//!                                                   v
//!                                     101 + ConnectionHandler(socket)
//!                                     or rejection status
//! ```
//!
//! Every attempt receives exactly one decision: accepted by a route through
//! [`Decide`], rejected explicitly or by a middleware writing a response, or
//! rejected by the fallback (404, or the status of an unhandled error).

pub mod app;
pub mod bridge;
pub mod decide;
pub mod error;
pub mod handler;
pub mod options;
pub mod origin;
mod path;
pub mod request;
pub mod response;
pub mod router;
mod server;

pub use app::App;
pub use bridge::{HandshakeBridge, PendingConnection, Verification};
pub use decide::{ConnectionHandler, Decide, Decision, Verdict, WebSocket, DEFAULT_REJECT_STATUS};
pub use error::{ConfigError, RouteError, UsageError};
pub use handler::{ErrorMiddleware, Flow, Middleware, UpgradeHandler};
pub use options::{ResolvedOptions, WsOptions};
pub use origin::{OriginGuard, OriginRejection};
pub use request::{Request, UpgradeInfo};
pub use response::Response;
pub use router::{Outcome, Route, Router};
