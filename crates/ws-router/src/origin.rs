use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use http::StatusCode;
use thiserror::Error;

use crate::error::RouteError;
use crate::handler::{Flow, Middleware};
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Error)]
pub enum OriginRejection {
    #[error("malformed Origin header")]
    Malformed,
    #[error("origin '{origin}' is not in the allowlist")]
    NotAllowed { origin: String },
}

/// Returns `true` if the origin is a localhost variant.
fn is_localhost(origin: &str) -> bool {
    let host = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .unwrap_or(origin);

    // Bracketed IPv6, with or without a port: [::1] or [::1]:9000
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end] == "[::1]",
            None => false,
        };
    }

    if host == "::1" {
        return true;
    }

    let host_no_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };

    matches!(host_no_port, "localhost" | "127.0.0.1")
}

/// Middleware that gates WebSocket upgrades on their `Origin` header.
///
/// - No Origin header is allowed (non-browser clients do not send one).
/// - Localhost origins (`127.0.0.1`, `::1`, `localhost` on any port) are
///   always allowed.
/// - Otherwise the origin must match one of the allowlist globs.
///
/// Rejections are written as `403 Origin not allowed`, which the handshake
/// bridge turns into a rejected upgrade. Plain HTTP requests pass through.
#[derive(Debug, Clone)]
pub struct OriginGuard {
    allowlist: GlobSet,
}

impl OriginGuard {
    /// Build a guard from glob patterns. Invalid patterns are logged and
    /// skipped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => {
                    tracing::warn!(
                        pattern,
                        error = %e,
                        "failed to compile origin glob; treating as non-match"
                    );
                }
            }
        }

        let allowlist = builder.build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build origin allowlist; allowing localhost only");
            GlobSet::empty()
        });

        Self { allowlist }
    }

    /// Validate an origin header value.
    pub fn validate(&self, origin: Option<&str>) -> Result<(), OriginRejection> {
        let origin = match origin {
            None => return Ok(()),
            Some("") => return Err(OriginRejection::Malformed),
            Some(o) => o,
        };

        if is_localhost(origin) || self.allowlist.is_match(origin) {
            return Ok(());
        }

        Err(OriginRejection::NotAllowed {
            origin: origin.to_string(),
        })
    }
}

#[async_trait]
impl Middleware for OriginGuard {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<Flow, RouteError> {
        self.check(req, res)
    }
}

impl OriginGuard {
    fn check(&self, req: &Request, res: &mut Response) -> Result<Flow, RouteError> {
        let Some(upgrade) = req.upgrade() else {
            return Ok(Flow::Next);
        };

        match self.validate(upgrade.origin.as_deref()) {
            Ok(()) => Ok(Flow::Next),
            Err(rejection) => {
                tracing::warn!(
                    remote_addr = ?req.remote_addr(),
                    path = %req.uri().path(),
                    reason = %rejection,
                    "rejecting websocket upgrade"
                );
                res.status(StatusCode::FORBIDDEN).send("Origin not allowed")?;
                Ok(Flow::Stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::decide::{Decide, Decision};
    use crate::request::test_support::http_request;

    fn guard(patterns: &[&str]) -> OriginGuard {
        OriginGuard::new(patterns.iter().copied())
    }

    // ----------------------------------------------------------------
    // validate
    // ----------------------------------------------------------------

    #[test]
    fn no_origin_header_is_allowed() {
        assert!(guard(&[]).validate(None).is_ok());
    }

    #[test]
    fn empty_origin_is_malformed() {
        assert!(matches!(
            guard(&[]).validate(Some("")),
            Err(OriginRejection::Malformed)
        ));
    }

    #[test]
    fn localhost_is_always_allowed() {
        let g = guard(&[]);
        for origin in [
            "http://localhost",
            "http://localhost:3000",
            "http://127.0.0.1:8080",
            "http://[::1]",
            "http://[::1]:9000",
            "https://localhost",
        ] {
            assert!(g.validate(Some(origin)).is_ok(), "{origin}");
        }
    }

    #[test]
    fn remote_origin_needs_allowlist_entry() {
        match guard(&[]).validate(Some("https://example.com")) {
            Err(OriginRejection::NotAllowed { origin }) => {
                assert_eq!(origin, "https://example.com")
            }
            other => panic!("expected NotAllowed, got {other:?}"),
        }
        assert!(guard(&["https://example.com"])
            .validate(Some("https://example.com"))
            .is_ok());
    }

    #[test]
    fn glob_entries() {
        let g = guard(&["https://*.example.com", "https://beta.dev"]);
        assert!(g.validate(Some("https://app.example.com")).is_ok());
        assert!(g.validate(Some("https://beta.dev")).is_ok());
        assert!(g.validate(Some("https://evil.com")).is_err());
    }

    #[test]
    fn invalid_glob_is_skipped() {
        let g = guard(&["[invalid", "https://ok.dev"]);
        assert!(g.validate(Some("https://ok.dev")).is_ok());
        assert!(g.validate(Some("[invalid")).is_err());
    }

    #[test]
    fn is_localhost_variants() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("::1"));
        assert!(is_localhost("[::1]"));
        assert!(!is_localhost("http://localhost.evil.com"));
        assert!(!is_localhost("http://example.com"));
    }

    // ----------------------------------------------------------------
    // middleware
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn disallowed_upgrade_is_rejected_with_403() {
        let (parts, _) = http::Request::builder()
            .uri("/ws")
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::ORIGIN, "https://evil.com")
            .body(())
            .unwrap()
            .into_parts();
        let mut req = Request::from_parts(parts, Bytes::new());

        let (decide, rx) = Decide::channel();
        let mut res = Response::upgrade(decide);
        let flow = guard(&[]).handle(&mut req, &mut res).await.unwrap();
        assert_eq!(flow, Flow::Stop);

        match rx.await.unwrap() {
            Decision::Reject { status, message } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(message.as_deref(), Some("Origin not allowed"));
            }
            Decision::Accept(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn plain_http_passes_through() {
        let mut req = http_request(http::Method::GET, "/health");
        req.headers_mut()
            .insert(http::header::ORIGIN, "https://evil.com".parse().unwrap());
        let mut res = Response::http();
        let flow = guard(&[]).handle(&mut req, &mut res).await.unwrap();
        assert_eq!(flow, Flow::Next);
        assert!(!res.is_finished());
    }
}
