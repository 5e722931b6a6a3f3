//! Proxy request handler with a single upstream retry
//!
//! Handles incoming HTTP/HTTPS requests and forwards them through the endpoint
//! bound to the client connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{Result, RotatorError};
use crate::models::{ProxyEndpoint, ProxyScheme};
use crate::pool::EndpointPool;
use crate::proxy::transport::{format_authority, ProxyTransport};
use crate::proxy::tunnel::{SessionGuard, SessionTracker, TunnelHandler};

/// Response body type shared by relayed and locally generated responses
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Configuration for proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for upstream proxy connections
    pub connect_timeout: Duration,
    /// Timeout for the upstream response head
    pub request_timeout: Duration,
    /// Idle timeout for CONNECT tunnels
    pub tunnel_idle_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tunnel_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ProxyServerConfig> for ProxyHandlerConfig {
    fn from(config: &ProxyServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            tunnel_idle_timeout: config.tunnel_idle_timeout,
        }
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    pool: Arc<EndpointPool>,
    config: ProxyHandlerConfig,
    sessions: Arc<SessionTracker>,
    force_close: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        pool: Arc<EndpointPool>,
        config: ProxyHandlerConfig,
        sessions: Arc<SessionTracker>,
        force_close: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            config,
            sessions,
            force_close,
        }
    }

    /// Handle one request from a client connection bound to `bound`
    #[instrument(skip(self, req, bound), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        bound: Option<Arc<ProxyEndpoint>>,
    ) -> Response<ProxyBody> {
        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req, bound.as_ref()).await
        } else {
            self.handle_http(req, bound.as_ref()).await
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed");
                let mut response = error_response(e.status_code(), &e.to_string());
                if matches!(e, RotatorError::InvalidRequest(_)) {
                    response
                        .headers_mut()
                        .insert(CONNECTION, HeaderValue::from_static("close"));
                }
                response
            }
        }
    }

    /// Handle HTTP CONNECT request (HTTPS tunneling)
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        bound: Option<&Arc<ProxyEndpoint>>,
    ) -> Result<Response<ProxyBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| RotatorError::InvalidRequest("CONNECT target must be host:port".into()))?;
        let (target_host, target_port) = ProxyTransport::parse_authority(&authority)?;

        // Don't answer 200 until the upstream side is established
        let (endpoint, upstream) = self.dial(bound, &target_host, target_port, true).await?;
        info!(endpoint = %endpoint, target = %authority, "CONNECT tunnel established");

        let on_upgrade = hyper::upgrade::on(req);
        let guard = SessionGuard::new(self.sessions.clone());
        let idle_timeout = self.config.tunnel_idle_timeout;
        let force_close = self.force_close.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    TunnelHandler::relay(client, upstream, idle_timeout, force_close).await;
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }

    /// Handle regular HTTP request
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        bound: Option<&Arc<ProxyEndpoint>>,
    ) -> Result<Response<ProxyBody>> {
        if req.uri().scheme_str() == Some("https") {
            return Err(RotatorError::InvalidRequest(
                "https targets must be requested with CONNECT".into(),
            ));
        }
        if req.uri().authority().is_none() {
            return Err(RotatorError::InvalidRequest(
                "proxy requests need an absolute-form URI".into(),
            ));
        }

        let (target_host, target_port) = ProxyTransport::parse_target(req.uri())?;
        let (endpoint, stream) = self.dial(bound, &target_host, target_port, false).await?;

        let authority = format_authority(&target_host, target_port);
        let request = build_upstream_request(req, &endpoint, &authority)?;

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RotatorError::UpstreamConnectFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let response = tokio::time::timeout(self.config.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| RotatorError::UpstreamTimeout)?
            .map_err(|e| RotatorError::UpstreamConnectFailed(format!("Request failed: {}", e)))?;

        if endpoint.scheme == ProxyScheme::Http
            && response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        {
            self.pool.mark_invalid(&endpoint);
            return Err(RotatorError::UpstreamConnectFailed(format!(
                "{} rejected proxy authentication",
                endpoint
            )));
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        debug!(endpoint = %endpoint, status = %parts.status, "Relaying upstream response");

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Open the upstream stream, retrying once on the next valid endpoint
    ///
    /// `tunnel` asks for a byte stream to the target itself. Otherwise an HTTP
    /// endpoint yields a connection to the proxy, ready for an absolute-form
    /// request.
    async fn dial(
        &self,
        bound: Option<&Arc<ProxyEndpoint>>,
        host: &str,
        port: u16,
        tunnel: bool,
    ) -> Result<(Arc<ProxyEndpoint>, TcpStream)> {
        let first = self.first_candidate(bound)?;

        let err = match self.dial_once(&first, host, port, tunnel).await {
            Ok(stream) => return Ok((first, stream)),
            Err(e) if e.blames_upstream() => e,
            Err(e) => return Err(e),
        };

        self.pool.mark_invalid(&first);
        let Some(next) = self.pool.next_valid_after(&first) else {
            return Err(err);
        };

        warn!(failed = %first, retry = %next, error = %err, "Retrying on next endpoint");
        match self.dial_once(&next, host, port, tunnel).await {
            Ok(stream) => Ok((next, stream)),
            Err(e) => {
                if e.blames_upstream() {
                    self.pool.mark_invalid(&next);
                }
                Err(e)
            }
        }
    }

    async fn dial_once(
        &self,
        endpoint: &ProxyEndpoint,
        host: &str,
        port: u16,
        tunnel: bool,
    ) -> Result<TcpStream> {
        let connect = async {
            if tunnel || endpoint.scheme == ProxyScheme::Socks5 {
                ProxyTransport::connect(endpoint, host, port).await
            } else {
                ProxyTransport::open(endpoint).await
            }
        };

        tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| RotatorError::UpstreamTimeout)?
    }

    /// The bound endpoint while it is valid, else the next valid one
    fn first_candidate(&self, bound: Option<&Arc<ProxyEndpoint>>) -> Result<Arc<ProxyEndpoint>> {
        match bound {
            Some(endpoint) if endpoint.is_valid() => Ok(endpoint.clone()),
            Some(endpoint) => self
                .pool
                .next_valid_after(endpoint)
                .ok_or(RotatorError::PoolDegraded),
            None => self
                .pool
                .current()
                .filter(|e| e.is_valid())
                .or_else(|| {
                    let current = self.pool.current()?;
                    self.pool.next_valid_after(&current)
                })
                .ok_or(RotatorError::PoolDegraded),
        }
    }
}

/// Rewrite a client request for the chosen endpoint
///
/// HTTP endpoints get the absolute-form URI and credentials. SOCKS5 endpoints
/// already carry a connection to the origin, so they get origin-form.
fn build_upstream_request<B>(
    req: Request<B>,
    endpoint: &ProxyEndpoint,
    authority: &str,
) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(authority)
            .map_err(|e| RotatorError::InvalidRequest(format!("Invalid host: {}", e)))?;
        parts.headers.insert(HOST, host);
    }

    match endpoint.scheme {
        ProxyScheme::Http => {
            if let Some(credentials) = endpoint.basic_auth() {
                let value = HeaderValue::from_str(&credentials).map_err(|e| {
                    RotatorError::InvalidProxyAddress(format!("Unusable credentials: {}", e))
                })?;
                parts.headers.insert(PROXY_AUTHORIZATION, value);
            }
        }
        ProxyScheme::Socks5 => {
            let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            parts.uri = path
                .parse::<Uri>()
                .map_err(|e| RotatorError::InvalidRequest(format!("Invalid path: {}", e)))?;
        }
    }

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Create a plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<()> {
        Request::builder()
            .uri(uri)
            .header("Connection", "keep-alive, X-Trace")
            .header("Keep-Alive", "timeout=5")
            .header("X-Trace", "abc")
            .header("Proxy-Connection", "keep-alive")
            .header("Proxy-Authorization", "Basic client-creds")
            .header("Accept", "*/*")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_header("content-length"));
        assert!(!is_hop_by_hop_header("host"));
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_list() {
        let mut headers = request("http://example.com/").headers().clone();
        strip_hop_by_hop(&mut headers);

        assert!(headers.get("x-trace").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_upstream_request_for_http_endpoint() {
        let endpoint = ProxyEndpoint::new(ProxyScheme::Http, "10.0.0.1", 3128)
            .with_credentials("user", "pass");
        let upstream =
            build_upstream_request(request("http://example.com/a?b=c"), &endpoint, "example.com:80")
                .unwrap();

        assert_eq!(upstream.uri().to_string(), "http://example.com/a?b=c");
        assert_eq!(
            upstream.headers().get(PROXY_AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );
        assert_eq!(upstream.headers().get(HOST).unwrap(), "example.com:80");
    }

    #[test]
    fn test_upstream_request_for_socks_endpoint() {
        let endpoint = ProxyEndpoint::new(ProxyScheme::Socks5, "10.0.0.1", 1080)
            .with_credentials("user", "pass");
        let upstream =
            build_upstream_request(request("http://example.com/a?b=c"), &endpoint, "example.com:80")
                .unwrap();

        assert_eq!(upstream.uri().to_string(), "/a?b=c");
        assert!(upstream.headers().get(PROXY_AUTHORIZATION).is_none());
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::BAD_GATEWAY, "no upstream");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_first_candidate_skips_invalid_bound() {
        let pool = Arc::new(EndpointPool::new(None));
        pool.reload(vec![
            ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", 8001),
            ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", 8002),
        ])
        .unwrap();
        let (_force_tx, force_rx) = watch::channel(false);
        let handler = ProxyHandler::new(
            pool.clone(),
            ProxyHandlerConfig::default(),
            Arc::new(SessionTracker::new()),
            force_rx,
        );

        let bound = pool.current().unwrap();
        assert_eq!(handler.first_candidate(Some(&bound)).unwrap().port, 8001);

        bound.mark_invalid();
        assert_eq!(handler.first_candidate(Some(&bound)).unwrap().port, 8002);
        assert_eq!(handler.first_candidate(None).unwrap().port, 8002);

        pool.peek_next().unwrap().mark_invalid();
        assert!(matches!(
            handler.first_candidate(Some(&bound)),
            Err(RotatorError::PoolDegraded)
        ));
    }
}
