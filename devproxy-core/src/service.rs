//! Request routing and upstream forwarding.
//!
//! Every inbound request is matched against the rule set. A matching request
//! is rewritten and forwarded to the rule's upstream over a fresh HTTP/1.1
//! connection and the upstream response is relayed back unchanged. Anything
//! else falls through to static file handling.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use http::{Request, Response, header, request::Parts};
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    body::{Bytes, Incoming},
    client::conn::http1::{Builder, SendRequest},
    service::Service as HyperService,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, error, info, warn};

use crate::{
    config::ProxyConfig,
    error::ProxyError,
    rule::{ProxyRule, RuleSet},
    static_files::StaticFiles,
    tls::TlsConnectors,
    upstream::Scheme,
};

/// Body type of every response this service produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The dev server's request handler.
///
/// Cloned once per connection; the rule set and static settings are shared.
#[derive(Clone)]
pub struct ProxyService {
    rules: Arc<RuleSet>,
    static_files: Arc<StaticFiles>,
    tls: TlsConnectors,
    connect_timeout: Duration,
    response_timeout: Option<Duration>,
    /// Peer address of the connection this clone serves
    pub from: SocketAddr,
}

impl ProxyService {
    pub fn new(
        rules: Arc<RuleSet>,
        static_files: StaticFiles,
        tls: TlsConnectors,
        connect_timeout: Duration,
    ) -> Self {
        if rules.is_empty() {
            warn!("No proxy rules configured, every request is served statically");
        } else {
            info!("Creating proxy service with {} rules", rules.len());
        }
        Self {
            rules,
            static_files: Arc::new(static_files),
            tls,
            connect_timeout,
            response_timeout: None,
            from: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    /// Validates `config` and builds everything needed to serve it.
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let rules = RuleSet::from_config(config)?;
        let tls = TlsConnectors::for_rules(&rules)?;
        let static_files = StaticFiles::new(
            config.server.static_root.clone(),
            config.server.history_fallback,
        );

        Ok(Self::new(
            Arc::new(rules),
            static_files,
            tls,
            Duration::from_secs(config.server.connect_timeout_secs),
        )
        .with_response_timeout(config.server.response_timeout_secs.map(Duration::from_secs)))
    }

    /// Bounds the wait for upstream response headers; the body is streamed without limit.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Routes one request to its proxy rule or to static handling.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (header, body) = req.into_parts();

        let Some(rule) = self.rules.find(header.uri.path()) else {
            debug!(
                "No proxy rule for {} {}, serving statically",
                header.method, header.uri
            );
            return self
                .static_files
                .serve(&header.method, header.uri.path())
                .await;
        };

        let method = header.method.clone();
        let original = header.uri.clone();
        let host = header
            .headers
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .map(str::to_string)
            .or_else(|| original.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        match self.forward(rule, header, body).await {
            Ok(response) => {
                info!(
                    "{} {} -> {} {}",
                    method,
                    original,
                    rule.upstream().authority(),
                    response.status()
                );
                response
            }
            Err(e) => {
                error!(
                    "Failed to proxy {} {} to {}: {}",
                    method,
                    original,
                    rule.upstream().authority(),
                    e
                );
                error_response(&e, &host, &original)
            }
        }
    }

    /// Forwards a request matched by `rule` and relays the upstream response.
    pub async fn forward(
        &self,
        rule: &ProxyRule,
        mut header: Parts,
        body: Incoming,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let forwarded = rule.prepare_request(&mut header)?;
        debug!("Forwarding {} {} from {}", header.method, forwarded, self.from);

        let mut sender = tokio::time::timeout(self.connect_timeout, self.connect(rule))
            .await
            .map_err(|_| ProxyError::Timeout(self.connect_timeout))??;

        let request = Request::from_parts(header, body);
        debug!("Sending request to upstream");

        let response = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, sender.send_request(request))
                .await
                .map_err(|_| ProxyError::ResponseTimeout(limit))?,
            None => sender.send_request(request).await,
        };
        let (header, body) = response.map_err(ProxyError::Upstream)?.into_parts();

        debug!("Received {} from upstream", header.status);
        Ok(Response::from_parts(header, body.boxed()))
    }

    async fn connect(&self, rule: &ProxyRule) -> Result<SendRequest<Incoming>, ProxyError> {
        let upstream = rule.upstream();

        debug!("Connecting to upstream: {}", upstream.authority());
        let stream = TcpStream::connect((upstream.host(), upstream.port()))
            .await
            .map_err(ProxyError::Connect)?;

        match upstream.scheme() {
            Scheme::Http => Self::handshake(TokioIo::new(stream)).await,
            Scheme::Https => {
                let connector = self
                    .tls
                    .connector(rule.secure())
                    .ok_or(ProxyError::TlsUnavailable)?;
                let server_name = ServerName::try_from(upstream.host().to_string())
                    .map_err(|e| ProxyError::Tls(std::io::Error::other(e)))?;

                debug!("Performing TLS handshake with {}", upstream.host());
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(ProxyError::Tls)?;
                Self::handshake(TokioIo::new(tls_stream)).await
            }
        }
    }

    async fn handshake<I>(io: I) -> Result<SendRequest<Incoming>, ProxyError>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        debug!("Performing HTTP handshake");
        let (sender, conn) = Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(ProxyError::Handshake)?;

        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                error!("Upstream connection error: {}", err);
            }
        });

        Ok(sender)
    }
}

/// Plain-text error page naming the request that could not be proxied.
fn error_response(error: &ProxyError, host: &str, original: &http::Uri) -> Response<ProxyBody> {
    let path = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let message = format!("Error occurred while trying to proxy: {host}{path}");

    let mut response = Response::new(
        Full::<Bytes>::from(message)
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = error.status();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;

    type Error = anyhow::Error;

    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[tokio::test]
    async fn test_error_response_names_request() {
        let err = ProxyError::Timeout(Duration::from_secs(1));
        let response = error_response(&err, "localhost:8080", &"/tianshu/api?x=1".parse().unwrap());

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            "Error occurred while trying to proxy: localhost:8080/tianshu/api?x=1"
        );
    }

    #[test]
    fn test_from_config() {
        let config = ProxyConfig::from_yaml_str(
            "proxy:\n  /tianshu:\n    target: http://127.0.0.1:51385\n",
        )
        .unwrap();
        let service = ProxyService::from_config(&config).unwrap();
        assert_eq!(service.rules().len(), 1);
        assert_eq!(service.connect_timeout, Duration::from_secs(10));
        assert_eq!(service.response_timeout, None);
    }

    #[test]
    fn test_from_config_without_rules() {
        let config =
            ProxyConfig::from_yaml_str("server:\n  response_timeout_secs: 5\n").unwrap();
        let service = ProxyService::from_config(&config).unwrap();
        assert!(service.rules().is_empty());
        assert_eq!(service.response_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_from_config_rejects_invalid_rules() {
        let config = ProxyConfig::from_yaml_str("proxy:\n  /x: localhost\n").unwrap();
        assert!(ProxyService::from_config(&config).is_err());
    }
}
