//! Backend targets that proxy rules forward to.

use http::Uri;

/// Transport used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A parsed `target` URL.
///
/// Only `http` and `https` targets with a host are accepted. The optional path
/// of the target is kept as a base that rewritten request paths are joined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    uri: Uri,
    scheme: Scheme,
    /// Host without IPv6 brackets, suitable for connecting and SNI
    host: String,
    port: u16,
    /// Value for the `Host` header when the origin is changed
    authority: String,
}

impl Upstream {
    /// Parses a target URL such as `http://127.0.0.1:51385`.
    pub fn parse(target: &str) -> Result<Self, String> {
        let uri = target.parse::<Uri>().map_err(|e| e.to_string())?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => return Err(format!("unsupported scheme `{other}`")),
            None => return Err("missing scheme".to_string()),
        };

        let authority = uri.authority().ok_or("missing host")?;
        if authority.as_str().contains('@') {
            return Err("credentials in target are not supported".to_string());
        }
        let bracketed_host = authority.host();
        if bracketed_host.is_empty() {
            return Err("missing host".to_string());
        }

        let host = bracketed_host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(scheme.default_port());

        if uri.query().is_some() {
            return Err("query strings in target are not supported".to_string());
        }

        Ok(Self {
            authority: authority.as_str().to_string(),
            uri,
            scheme,
            host,
            port,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_target() {
        let upstream = Upstream::parse("http://127.0.0.1:51385").unwrap();
        assert_eq!(upstream.scheme(), Scheme::Http);
        assert_eq!(upstream.host(), "127.0.0.1");
        assert_eq!(upstream.port(), 51385);
        assert_eq!(upstream.authority(), "127.0.0.1:51385");
        assert_eq!(upstream.uri().path(), "/");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Upstream::parse("http://backend").unwrap().port(), 80);
        assert_eq!(Upstream::parse("https://backend").unwrap().port(), 443);
        assert_eq!(Upstream::parse("https://backend").unwrap().authority(), "backend");
    }

    #[test]
    fn test_ipv6_host() {
        let upstream = Upstream::parse("http://[::1]:8080/api").unwrap();
        assert_eq!(upstream.host(), "::1");
        assert_eq!(upstream.authority(), "[::1]:8080");
        assert_eq!(upstream.uri().path(), "/api");
    }

    #[test]
    fn test_scheme_names() {
        assert_eq!(Upstream::parse("http://h").unwrap().scheme().as_str(), "http");
        assert_eq!(Upstream::parse("https://h").unwrap().scheme().as_str(), "https");
    }

    #[test]
    fn test_rejects_invalid_targets() {
        assert!(Upstream::parse("127.0.0.1:51385").is_err());
        assert!(Upstream::parse("/relative").is_err());
        assert!(Upstream::parse("ftp://host").is_err());
        assert!(Upstream::parse("http://user:pw@host").is_err());
        assert!(Upstream::parse("http://host/?q=1").is_err());
        assert!(Upstream::parse("not a url").is_err());
    }
}
