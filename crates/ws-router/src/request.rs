use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Method, Uri};

/// Origin and protocol descriptor of a WebSocket upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInfo {
    /// `Origin` (or legacy `Sec-WebSocket-Origin`) header value.
    pub origin: Option<String>,
    /// Whether the attempt arrived over an encrypted transport: an
    /// `https`/`wss` absolute URI, or a TLS terminator in front reporting
    /// `X-Forwarded-Proto: https`.
    pub secure: bool,
    /// Sub-protocols requested through `Sec-WebSocket-Protocol`, in order.
    pub protocols: Vec<String>,
    /// Raw `Sec-WebSocket-Key`.
    pub key: Option<HeaderValue>,
    /// Raw `Sec-WebSocket-Version`.
    pub version: Option<String>,
}

impl UpgradeInfo {
    /// Build the descriptor if the request head asks for a WebSocket upgrade.
    pub fn from_head(uri: &Uri, headers: &HeaderMap) -> Option<Self> {
        let wants_websocket = headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
            .unwrap_or(false);
        if !wants_websocket {
            return None;
        }

        let origin = headers
            .get(header::ORIGIN)
            .or_else(|| headers.get("sec-websocket-origin"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let protocols = headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let version = headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());

        Some(Self {
            origin,
            secure: is_secure(uri, headers),
            protocols,
            key: headers.get(header::SEC_WEBSOCKET_KEY).cloned(),
            version,
        })
    }
}

fn is_secure(uri: &Uri, headers: &HeaderMap) -> bool {
    let encrypted = |scheme: &str| {
        scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss")
    };
    if uri.scheme_str().is_some_and(encrypted) {
        return true;
    }
    // Proxies may append; the first entry is the client-facing hop.
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| encrypted(proto.trim()))
}

/// An incoming HTTP request or WebSocket upgrade attempt as seen by
/// middleware and route handlers.
#[derive(Debug)]
pub struct Request {
    method: Method,
    original_method: Method,
    uri: Uri,
    headers: HeaderMap,
    path: String,
    base_path: String,
    params: HashMap<String, String>,
    body: Bytes,
    extensions: Extensions,
    remote_addr: Option<SocketAddr>,
    upgrade: Option<UpgradeInfo>,
}

impl Request {
    /// Build a request from its HTTP head and a fully buffered body.
    ///
    /// The upgrade descriptor is derived from the headers.
    pub fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        let upgrade = UpgradeInfo::from_head(&parts.uri, &parts.headers);
        let path = match parts.uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        Self {
            original_method: parts.method.clone(),
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            path,
            base_path: String::new(),
            params: HashMap::new(),
            body,
            extensions: parts.extensions,
            remote_addr: None,
            upgrade,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Current method. During upgrade verification this is the synthetic
    /// websocket verb.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Method the client actually sent.
    pub fn original_method(&self) -> &Method {
        &self.original_method
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn restore_method(&mut self) {
        self.method = self.original_method.clone();
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Path relative to the router currently dispatching the request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accumulated prefix of the routers the request was mounted through.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// First value of query parameter `name`. No percent-decoding.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query()?
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = HeaderName::from_bytes(name.as_ref().as_bytes()).ok()?;
        self.headers.get(name)?.to_str().ok()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Upgrade descriptor, present only for WebSocket upgrade attempts.
    pub fn upgrade(&self) -> Option<&UpgradeInfo> {
        self.upgrade.as_ref()
    }

    pub fn upgrade_mut(&mut self) -> Option<&mut UpgradeInfo> {
        self.upgrade.as_mut()
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Strip `len` bytes of the current path into the base path. Returns the
    /// previous `(path, base_path)` so the caller can restore them.
    pub(crate) fn enter_mount(&mut self, len: usize) -> (String, String) {
        let rest = match &self.path[len..] {
            "" => "/".to_string(),
            r => r.to_string(),
        };
        let prefix = self.path[..len].to_string();
        let saved_path = std::mem::replace(&mut self.path, rest);
        let saved_base = self.base_path.clone();
        self.base_path.push_str(&prefix);
        (saved_path, saved_base)
    }

    pub(crate) fn leave_mount(&mut self, saved: (String, String)) {
        self.path = saved.0;
        self.base_path = saved.1;
    }
}
