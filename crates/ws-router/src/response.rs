use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::Full;
use serde::Serialize;

use crate::decide::{Decide, Decision};
use crate::error::{RouteError, UsageError};

enum Sink {
    Http { sent: bool },
    /// Upgrade shim: writing a response rejects the attempt instead.
    Upgrade(Decide),
}

/// Response under construction by middleware and HTTP route handlers.
///
/// During WebSocket upgrade verification the same type is handed to
/// middleware, but it is bound to the attempt's [`Decide`] handle. Any
/// write (`write_head`, `send`, `send_status`, `json`) then rejects the
/// upgrade with the written status, so ordinary HTTP middleware can gate
/// upgrades unchanged.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    sink: Sink,
}

impl Response {
    pub(crate) fn http() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            sink: Sink::Http { sent: false },
        }
    }

    pub(crate) fn upgrade(decide: Decide) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            sink: Sink::Upgrade(decide),
        }
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The decision handle when this response is an upgrade shim.
    pub fn decide(&self) -> Option<&Decide> {
        match &self.sink {
            Sink::Upgrade(decide) => Some(decide),
            Sink::Http { .. } => None,
        }
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self.sink, Sink::Upgrade(_))
    }

    /// Whether a response was written (or, for the shim, the upgrade resolved).
    pub fn is_finished(&self) -> bool {
        match &self.sink {
            Sink::Http { sent } => *sent,
            Sink::Upgrade(decide) => decide.is_handled(),
        }
    }

    /// Write the status line with an empty body.
    pub fn write_head(&mut self, status: StatusCode) -> Result<(), UsageError> {
        self.status = status;
        self.finish(Bytes::new())
    }

    /// Send `body` with the current status.
    pub fn send(&mut self, body: impl Into<Bytes>) -> Result<(), UsageError> {
        self.finish(body.into())
    }

    /// Send `status` with its canonical reason as the body.
    pub fn send_status(&mut self, status: StatusCode) -> Result<(), UsageError> {
        self.status = status;
        let reason = status.canonical_reason().unwrap_or_default();
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.finish(Bytes::from(reason))
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<(), RouteError> {
        let body = serde_json::to_vec(value).map_err(anyhow::Error::from)?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.finish(Bytes::from(body))?;
        Ok(())
    }

    fn finish(&mut self, body: Bytes) -> Result<(), UsageError> {
        match &mut self.sink {
            Sink::Http { sent } => {
                if *sent {
                    return Err(UsageError::ResponseAlreadySent);
                }
                *sent = true;
                self.body = body;
                Ok(())
            }
            Sink::Upgrade(decide) => {
                let message = if body.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&body).into_owned())
                };
                tracing::debug!(
                    status = %self.status,
                    "response written during upgrade; rejecting handshake"
                );
                let settled = decide.settle_if_pending(Decision::Reject {
                    status: self.status,
                    message,
                });
                if settled {
                    Ok(())
                } else {
                    Err(UsageError::AlreadyHandled)
                }
            }
        }
    }

    pub(crate) fn into_http(self) -> http::Response<Full<Bytes>> {
        let mut response = http::Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("upgrade", &self.is_upgrade())
            .field("finished", &self.is_finished())
            .finish()
    }
}
