use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use regex::Regex;
use thiserror::Error;

/// A compiled route path such as `/rooms/:room` or `/static/*`.
///
/// * `:name` captures one non-empty segment under `name`.
/// * `*` captures any sequence of characters (including `/`) under its
///   positional index (`"0"`, `"1"`, ...).
/// * Everything else is literal. Matching is case-insensitive.
///
/// Captured values are percent-decoded.
///
/// Exact patterns must consume the whole path (one trailing slash is
/// tolerated). Prefix patterns, used for middleware and mounts, match when
/// the path continues with `/` or ends after the prefix.
#[derive(Debug, Clone)]
pub(crate) struct PathPattern {
    source: String,
    regex: Option<Regex>,
    keys: Vec<String>,
    prefix: bool,
}

/// A captured value with a broken percent-escape or non-UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode param '{0}'")]
pub(crate) struct MalformedParam(pub String);

/// Result of a successful match.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PathMatch {
    pub params: HashMap<String, String>,
    /// Number of bytes of the path consumed by the pattern.
    pub matched_len: usize,
}

impl PathPattern {
    pub fn exact(path: &str) -> Self {
        Self::compile(path, false)
    }

    pub fn prefix(path: &str) -> Self {
        Self::compile(path, true)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn compile(path: &str, prefix: bool) -> Self {
        let normalized = normalize(path);
        let mut keys = Vec::new();
        let mut wildcards = 0usize;

        let mut regex_str = String::with_capacity(normalized.len() + 16);
        regex_str.push_str("(?i)^");

        for segment in normalized.split('/').skip(1).filter(|s| !s.is_empty()) {
            regex_str.push('/');
            if let Some(rest) = segment.strip_prefix(':') {
                let name_len = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                if name_len > 0 {
                    keys.push(rest[..name_len].to_string());
                    regex_str.push_str("([^/]+)");
                    push_literal(&mut regex_str, &rest[name_len..], &mut keys, &mut wildcards);
                    continue;
                }
            }
            push_literal(&mut regex_str, segment, &mut keys, &mut wildcards);
        }

        if !prefix {
            regex_str.push_str("/?$");
        }

        let regex = match Regex::new(&regex_str) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(
                    pattern = path,
                    error = %e,
                    "failed to compile route pattern; treating as non-match"
                );
                None
            }
        };

        Self {
            source: normalized,
            regex,
            keys,
            prefix,
        }
    }

    /// Match `path`. `Ok(None)` is a plain miss; `Err` means the path
    /// matched but one of its params cannot be decoded.
    pub fn matches(&self, path: &str) -> Result<Option<PathMatch>, MalformedParam> {
        let Some(captures) = self.regex.as_ref().and_then(|re| re.captures(path)) else {
            return Ok(None);
        };
        let Some(whole) = captures.get(0) else {
            return Ok(None);
        };

        if self.prefix {
            let rest = &path[whole.end()..];
            if !rest.is_empty() && !rest.starts_with('/') {
                return Ok(None);
            }
        }

        let mut params = HashMap::with_capacity(self.keys.len());
        for (i, key) in self.keys.iter().enumerate() {
            if let Some(m) = captures.get(i + 1) {
                params.insert(key.clone(), decode_param(m.as_str())?);
            }
        }

        Ok(Some(PathMatch {
            params,
            matched_len: whole.end(),
        }))
    }
}

fn decode_param(raw: &str) -> Result<String, MalformedParam> {
    let bytes = raw.as_bytes();
    let escapes_ok = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'%')
        .all(|(i, _)| {
            bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
        });
    if !escapes_ok {
        return Err(MalformedParam(raw.to_string()));
    }

    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| MalformedParam(raw.to_string()))
}

/// Ensure a leading slash and strip trailing ones (except for the root).
fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn push_literal(
    regex_str: &mut String,
    literal: &str,
    keys: &mut Vec<String>,
    wildcards: &mut usize,
) {
    for (i, part) in literal.split('*').enumerate() {
        if i > 0 {
            keys.push(wildcards.to_string());
            *wildcards += 1;
            regex_str.push_str("(.*)");
        }
        regex_str.push_str(&regex::escape(part));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(m: &PathMatch) -> Vec<(&str, &str)> {
        let mut out: Vec<_> = m
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn exact_literal() {
        let p = PathPattern::exact("/ok");
        assert!(p.matches("/ok").unwrap().is_some());
        assert!(p.matches("/ok/").unwrap().is_some());
        assert!(p.matches("/OK").unwrap().is_some());
        assert!(p.matches("/ok/more").unwrap().is_none());
        assert!(p.matches("/okay").unwrap().is_none());
    }

    #[test]
    fn root_exact() {
        let p = PathPattern::exact("/");
        assert!(p.matches("/").unwrap().is_some());
        assert!(p.matches("").unwrap().is_some());
        assert!(p.matches("/a").unwrap().is_none());
    }

    #[test]
    fn named_params() {
        let p = PathPattern::exact("/rooms/:room/users/:id");
        let m = p.matches("/rooms/lobby/users/42").unwrap().unwrap();
        assert_eq!(params(&m), vec![("id", "42"), ("room", "lobby")]);
        assert!(p.matches("/rooms//users/42").unwrap().is_none());
    }

    #[test]
    fn param_with_literal_suffix() {
        let p = PathPattern::exact("/files/:name.json");
        let m = p.matches("/files/report.json").unwrap().unwrap();
        assert_eq!(params(&m), vec![("name", "report")]);
        assert!(p.matches("/files/report.txt").unwrap().is_none());
    }

    #[test]
    fn wildcard_is_positional() {
        let p = PathPattern::exact("/static/*");
        let m = p.matches("/static/css/site.css").unwrap().unwrap();
        assert_eq!(params(&m), vec![("0", "css/site.css")]);
    }

    #[test]
    fn literal_regex_characters_are_escaped() {
        let p = PathPattern::exact("/v1.0/(x)");
        assert!(p.matches("/v1.0/(x)").unwrap().is_some());
        assert!(p.matches("/v1x0/(x)").unwrap().is_none());
    }

    #[test]
    fn prefix_stops_at_segment_boundary() {
        let p = PathPattern::prefix("/api");
        assert_eq!(p.matches("/api").unwrap().unwrap().matched_len, 4);
        assert_eq!(p.matches("/api/users").unwrap().unwrap().matched_len, 4);
        assert!(p.matches("/apiary").unwrap().is_none());
    }

    #[test]
    fn root_prefix_matches_everything() {
        let p = PathPattern::prefix("/");
        assert_eq!(p.matches("/anything/at/all").unwrap().unwrap().matched_len, 0);
        assert_eq!(p.source(), "/");
    }

    #[test]
    fn prefix_with_params() {
        let p = PathPattern::prefix("/tenants/:tenant/");
        let m = p.matches("/tenants/acme/ws").unwrap().unwrap();
        assert_eq!(m.matched_len, "/tenants/acme".len());
        assert_eq!(params(&m), vec![("tenant", "acme")]);
    }

    #[test]
    fn missing_leading_slash_is_normalized() {
        let p = PathPattern::exact("health");
        assert_eq!(p.source(), "/health");
        assert!(p.matches("/health").unwrap().is_some());
    }

    #[test]
    fn params_are_percent_decoded() {
        let p = PathPattern::exact("/rooms/:room");
        let m = p.matches("/rooms/my%20room").unwrap().unwrap();
        assert_eq!(params(&m), vec![("room", "my room")]);

        let m = p.matches("/rooms/caf%C3%A9").unwrap().unwrap();
        assert_eq!(params(&m), vec![("room", "café")]);

        // Escaped slashes stay inside the segment.
        let m = p.matches("/rooms/a%2Fb").unwrap().unwrap();
        assert_eq!(params(&m), vec![("room", "a/b")]);
    }

    #[test]
    fn malformed_escapes_are_errors() {
        let p = PathPattern::exact("/rooms/:room");
        for raw in ["bad%zz", "trailing%2", "%", "%FF"] {
            let path = format!("/rooms/{raw}");
            assert_eq!(p.matches(&path), Err(MalformedParam(raw.to_string())), "{raw}");
        }
        // A miss is still a miss, not an error.
        assert_eq!(p.matches("/other/%zz"), Ok(None));
    }
}
