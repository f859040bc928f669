use http::Method;
use serde::Deserialize;

use crate::error::ConfigError;

/// User-facing websocket options, typically deserialized from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOptions {
    /// Name of the host router the bridge is attached to. Recorded in logs.
    #[serde(default = "default_module_name")]
    pub module_name: String,
    /// Verb used to register websocket routes. Case-insensitive.
    #[serde(default = "default_method_name")]
    pub method_name: String,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            module_name: default_module_name(),
            method_name: default_method_name(),
        }
    }
}

fn default_module_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_method_name() -> String {
    "websocket".to_string()
}

/// Options after validation and normalization. Resolved once when an
/// [`App`](crate::App) is constructed and never re-read.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    module_name: String,
    verb: String,
    method: Method,
}

impl ResolvedOptions {
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Lowercase route verb, e.g. `websocket`.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Uppercase synthetic method set on requests during verification,
    /// e.g. `WEBSOCKET`.
    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        // `from_bytes` only fails on non-token bytes, and the uppercase
        // default verb is plain ASCII letters.
        let method = Method::from_bytes(default_method_name().to_ascii_uppercase().as_bytes())
            .expect("default websocket method is a valid token");
        Self {
            module_name: default_module_name(),
            verb: default_method_name(),
            method,
        }
    }
}

const STANDARD_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

impl WsOptions {
    /// Validate and normalize the options.
    ///
    /// The method name must be a valid HTTP token and must not shadow a
    /// standard verb, otherwise websocket routes would capture ordinary
    /// requests.
    pub fn resolve(&self) -> Result<ResolvedOptions, ConfigError> {
        let name = self.method_name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyMethod);
        }

        let upper = name.to_ascii_uppercase();
        if STANDARD_METHODS.contains(&upper.as_str()) {
            return Err(ConfigError::ReservedMethod(name.to_string()));
        }

        let method = Method::from_bytes(upper.as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(name.to_string()))?;

        Ok(ResolvedOptions {
            module_name: self.module_name.clone(),
            verb: name.to_ascii_lowercase(),
            method,
        })
    }
}
