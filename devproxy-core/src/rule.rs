//! The proxy rule set: which request paths are forwarded, where, and how.

use std::borrow::Cow;

use http::{HeaderValue, Uri, Version, header, request::Parts, uri::PathAndQuery};
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config::ProxyConfig,
    error::{ConfigError, ProxyError},
    upstream::{Scheme, Upstream},
    utils::{combine_uris, strip_hop_by_hop},
};

/// A single `pattern -> replacement` rewrite of the request path.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pattern: Regex,
    /// May reference capture groups as `$1` or `${name}`
    replacement: String,
}

impl PathRewrite {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// Replaces the first match in `path`, `None` when the pattern does not match.
    pub fn apply<'a>(&self, path: &'a str) -> Option<Cow<'a, str>> {
        if self.pattern.is_match(path) {
            Some(self.pattern.replace(path, self.replacement.as_str()))
        } else {
            None
        }
    }
}

impl PartialEq for PathRewrite {
    fn eq(&self, other: &Self) -> bool {
        self.pattern.as_str() == other.pattern.as_str() && self.replacement == other.replacement
    }
}

/// Forwarding instructions for every request under `prefix`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRule {
    prefix: String,
    upstream: Upstream,
    change_origin: bool,
    secure: bool,
    rewrites: Vec<PathRewrite>,
}

impl ProxyRule {
    pub fn new(
        prefix: impl Into<String>,
        upstream: Upstream,
        change_origin: bool,
        secure: bool,
        rewrites: Vec<PathRewrite>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            upstream,
            change_origin,
            secure,
            rewrites,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn change_origin(&self) -> bool {
        self.change_origin
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Literal prefix test against the request path.
    #[inline]
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Applies the first rewrite whose pattern matches `path`.
    ///
    /// Paths no rewrite matches are forwarded as they are. An empty result
    /// becomes `/`.
    pub fn rewrite_path(&self, path: &str) -> String {
        let rewritten = self
            .rewrites
            .iter()
            .find_map(|rewrite| rewrite.apply(path))
            .unwrap_or(Cow::Borrowed(path));

        if rewritten.is_empty() {
            "/".to_string()
        } else if rewritten.starts_with('/') {
            rewritten.into_owned()
        } else {
            format!("/{rewritten}")
        }
    }

    /// Absolute URI the request is forwarded to: target + rewritten path + original query.
    pub fn outbound_uri(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        let path = self.rewrite_path(uri.path());
        Ok(combine_uris(self.upstream.uri(), &path, uri.query())?)
    }

    /// Turns inbound request parts into the parts sent upstream.
    ///
    /// The request target is reduced to origin form, hop-by-hop headers are
    /// dropped and `Host` is set to the target when the origin is changed.
    /// Returns the absolute forwarded URI.
    pub fn prepare_request(&self, parts: &mut Parts) -> Result<Uri, ProxyError> {
        let forwarded = self.outbound_uri(&parts.uri)?;

        let inbound_authority = parts.uri.authority().cloned();
        let origin_form = match forwarded.path_and_query() {
            Some(path_and_query) => path_and_query.clone(),
            None => PathAndQuery::from_static("/"),
        };
        parts.uri = Uri::builder().path_and_query(origin_form).build()?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);

        if self.change_origin {
            let host = HeaderValue::from_str(self.upstream.authority()).map_err(http::Error::from)?;
            parts.headers.insert(header::HOST, host);
        } else if !parts.headers.contains_key(header::HOST) {
            // HTTP/2 clients carry the host in the URI instead of a header
            let host = inbound_authority
                .map(|authority| authority.as_str().to_string())
                .unwrap_or_else(|| self.upstream.authority().to_string());
            let host = HeaderValue::from_str(&host).map_err(http::Error::from)?;
            parts.headers.insert(header::HOST, host);
        }

        Ok(forwarded)
    }
}

/// Immutable, ordered set of proxy rules built once at startup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleSet {
    rules: Vec<ProxyRule>,
}

impl RuleSet {
    /// Builds rules from the rules in a config file, validating every rule.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let mut rules: Vec<ProxyRule> = Vec::with_capacity(config.proxy.len());

        for (prefix, entry) in config.proxy.iter() {
            if !prefix.starts_with('/') {
                return Err(ConfigError::InvalidPrefix(prefix.to_string()));
            }
            if rules.iter().any(|rule| rule.prefix == prefix) {
                return Err(ConfigError::DuplicatePrefix(prefix.to_string()));
            }

            let options = entry.options();
            let upstream =
                Upstream::parse(&options.target).map_err(|reason| ConfigError::InvalidTarget {
                    prefix: prefix.to_string(),
                    target: options.target.clone(),
                    reason,
                })?;

            let rewrites = options
                .path_rewrite
                .iter()
                .map(|(pattern, replacement)| {
                    PathRewrite::new(pattern, replacement.as_str()).map_err(|source| {
                        ConfigError::InvalidRewrite {
                            prefix: prefix.to_string(),
                            pattern: pattern.to_string(),
                            source,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if !options.secure && upstream.scheme() == Scheme::Http {
                warn!(
                    "Rule `{}` disables certificate checks but its target {} uses {}, `secure: false` has no effect",
                    prefix,
                    options.target,
                    upstream.scheme().as_str()
                );
            }

            debug!(
                "Loaded rule `{}` -> {} (changeOrigin: {}, secure: {}, {} rewrites)",
                prefix,
                options.target,
                options.change_origin,
                options.secure,
                rewrites.len()
            );

            rules.push(ProxyRule::new(
                prefix,
                upstream,
                options.change_origin,
                options.secure,
                rewrites,
            ));
        }

        Ok(Self { rules })
    }

    /// First rule, in declaration order, whose prefix matches `path`.
    pub fn find(&self, path: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProxyRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrderedMap, RuleEntry, RuleOptions};
    use http::{Method, Request};

    fn tianshu_config() -> ProxyConfig {
        ProxyConfig::from_yaml_str(
            r#"
proxy:
  /tianshu:
    target: http://127.0.0.1:51385
    changeOrigin: true
    secure: false
    pathRewrite:
      ^/tianshu: ""
"#,
        )
        .unwrap()
    }

    fn tianshu_rules() -> RuleSet {
        RuleSet::from_config(&tianshu_config()).unwrap()
    }

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_strips_prefix() {
        let rules = tianshu_rules();
        let rule = rules.find("/tianshu/api/users").unwrap();
        let forwarded = rule
            .outbound_uri(&"/tianshu/api/users".parse().unwrap())
            .unwrap();
        assert_eq!(forwarded.to_string(), "http://127.0.0.1:51385/api/users");
    }

    #[test]
    fn test_exact_prefix_becomes_root() {
        let rules = tianshu_rules();
        let rule = rules.find("/tianshu").unwrap();
        let forwarded = rule.outbound_uri(&"/tianshu".parse().unwrap()).unwrap();
        assert_eq!(forwarded.to_string(), "http://127.0.0.1:51385/");
    }

    #[test]
    fn test_prefix_removed_only_once() {
        let rule = tianshu_rules().find("/tianshu/tianshu/x").cloned().unwrap();
        assert_eq!(rule.rewrite_path("/tianshu/tianshu/x"), "/tianshu/x");
    }

    #[test]
    fn test_unmatched_path_is_not_proxied() {
        let rules = tianshu_rules();
        assert!(rules.find("/other/path").is_none());
        assert!(rules.find("/").is_none());
        assert!(rules.find("/api/tianshu").is_none());
    }

    #[test]
    fn test_query_string_preserved() {
        let rules = tianshu_rules();
        let rule = rules.find("/tianshu/search").unwrap();
        let forwarded = rule
            .outbound_uri(&"/tianshu/search?q=a%20b&page=2".parse().unwrap())
            .unwrap();
        assert_eq!(
            forwarded.to_string(),
            "http://127.0.0.1:51385/search?q=a%20b&page=2"
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = ProxyConfig::from_yaml_str(
            r#"
proxy:
  /api/v2: http://v2.local
  /api: http://v1.local
"#,
        )
        .unwrap();
        let rules = RuleSet::from_config(&config).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("/api/v2/items").unwrap().prefix(), "/api/v2");
        assert_eq!(rules.find("/api/items").unwrap().prefix(), "/api");
    }

    #[test]
    fn test_first_matching_rewrite_wins() {
        let rule = ProxyRule::new(
            "/svc",
            Upstream::parse("http://svc.local").unwrap(),
            false,
            true,
            vec![
                PathRewrite::new("^/svc/old", "/legacy").unwrap(),
                PathRewrite::new("^/svc", "").unwrap(),
            ],
        );
        assert_eq!(rule.rewrite_path("/svc/old/x"), "/legacy/x");
        assert_eq!(rule.rewrite_path("/svc/new/x"), "/new/x");
    }

    #[test]
    fn test_rewrite_capture_groups() {
        let rule = ProxyRule::new(
            "/users",
            Upstream::parse("http://svc.local/base").unwrap(),
            false,
            true,
            vec![PathRewrite::new(r"^/users/(\d+)", "/people/$1").unwrap()],
        );
        let forwarded = rule.outbound_uri(&"/users/42/posts".parse().unwrap()).unwrap();
        assert_eq!(forwarded.to_string(), "http://svc.local/base/people/42/posts");
    }

    #[test]
    fn test_no_rewrite_keeps_path() {
        let rule = ProxyRule::new(
            "/api",
            Upstream::parse("http://svc.local").unwrap(),
            false,
            true,
            Vec::new(),
        );
        assert_eq!(rule.rewrite_path("/api/items"), "/api/items");
    }

    #[test]
    fn test_prepare_request_changes_origin() {
        let rules = tianshu_rules();
        let rule = rules.find("/tianshu/api/users").unwrap();

        let mut parts = parts("/tianshu/api/users?id=1", Some("localhost:8080"));
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        parts
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        let forwarded = rule.prepare_request(&mut parts).unwrap();

        assert_eq!(forwarded.to_string(), "http://127.0.0.1:51385/api/users?id=1");
        assert_eq!(parts.uri, "/api/users?id=1");
        assert_eq!(parts.method, Method::POST);
        assert_eq!(parts.headers[header::HOST], "127.0.0.1:51385");
        assert_eq!(parts.headers[header::AUTHORIZATION], "Bearer t");
        assert!(!parts.headers.contains_key(header::CONNECTION));
    }

    #[test]
    fn test_prepare_request_keeps_host_without_change_origin() {
        let config = ProxyConfig::from_yaml_str("proxy:\n  /api: http://127.0.0.1:3000\n").unwrap();
        let rules = RuleSet::from_config(&config).unwrap();
        let rule = rules.find("/api").unwrap();

        let mut with_host = parts("/api/x", Some("localhost:8080"));
        rule.prepare_request(&mut with_host).unwrap();
        assert_eq!(with_host.headers[header::HOST], "localhost:8080");

        let mut absolute = parts("http://devbox:8080/api/x", None);
        rule.prepare_request(&mut absolute).unwrap();
        assert_eq!(absolute.headers[header::HOST], "devbox:8080");
        assert_eq!(absolute.uri, "/api/x");
    }

    #[test]
    fn test_rejects_duplicate_prefix() {
        let entry = RuleEntry::Target("http://127.0.0.1:1".to_string());
        let config = ProxyConfig {
            proxy: OrderedMap(vec![
                ("/tianshu".to_string(), entry.clone()),
                ("/tianshu".to_string(), entry),
            ]),
            ..Default::default()
        };
        assert!(matches!(
            RuleSet::from_config(&config),
            Err(ConfigError::DuplicatePrefix(prefix)) if prefix == "/tianshu"
        ));
    }

    #[test]
    fn test_rejects_invalid_rules() {
        let with = |prefix: &str, target: &str, pattern: &str| ProxyConfig {
            proxy: OrderedMap(vec![(
                prefix.to_string(),
                RuleEntry::Options(RuleOptions {
                    target: target.to_string(),
                    change_origin: false,
                    secure: true,
                    path_rewrite: OrderedMap(vec![(pattern.to_string(), String::new())]),
                }),
            )]),
            ..Default::default()
        };

        assert!(matches!(
            RuleSet::from_config(&with("tianshu", "http://h", "^/x")),
            Err(ConfigError::InvalidPrefix(_))
        ));
        assert!(matches!(
            RuleSet::from_config(&with("/x", "127.0.0.1:51385", "^/x")),
            Err(ConfigError::InvalidTarget { .. })
        ));
        assert!(matches!(
            RuleSet::from_config(&with("/x", "http://h", "^/x(")),
            Err(ConfigError::InvalidRewrite { .. })
        ));
    }

    #[test]
    fn test_reload_is_identical() {
        assert_eq!(tianshu_rules(), tianshu_rules());
    }

    #[test]
    fn test_rule_flags() {
        let rules = tianshu_rules();
        let rule = rules.iter().next().unwrap();
        assert!(rule.change_origin());
        assert!(!rule.secure());
        assert_eq!(rule.upstream().authority(), "127.0.0.1:51385");
    }
}
