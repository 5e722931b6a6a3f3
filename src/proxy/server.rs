//! Forwarding server implementation using hyper
//!
//! Accepts local client connections and forwards them through the endpoint the
//! pool had active when each connection was accepted.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::{ProxyServerConfig, MIN_HEADER_BYTES};
use crate::error::{Result, RotatorError};
use crate::models::ProxyEndpoint;
use crate::pool::EndpointPool;
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::head::{read_request_head, reject_head, PrefixedStream, HEAD_CHUNK};
use crate::proxy::transport::{format_authority, read_response_head, status_code_of};
use crate::proxy::tunnel::{SessionGuard, SessionTracker};

/// Time force-closed sessions get to unwind after a stop
const FORCE_CLOSE_SETTLE: Duration = Duration::from_secs(1);

/// Per-connection request head limits
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    header_read_timeout: Duration,
    max_header_bytes: usize,
}

/// Forwarding server
pub struct ForwardingServer {
    config: ProxyServerConfig,
    pool: Arc<EndpointPool>,
}

impl ForwardingServer {
    /// Create a new forwarding server
    pub fn new(config: ProxyServerConfig, pool: Arc<EndpointPool>) -> Self {
        Self { config, pool }
    }

    /// Bind the listener and start accepting in the background
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    pub async fn bind(&self) -> Result<ServerHandle> {
        let addr = format_authority(&self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RotatorError::AddressInUse {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);
        let sessions = Arc::new(SessionTracker::new());
        let listening = Arc::new(AtomicBool::new(true));

        let handler = Arc::new(ProxyHandler::new(
            self.pool.clone(),
            ProxyHandlerConfig::from(&self.config),
            sessions.clone(),
            force_rx.clone(),
        ));

        let limits = ConnectionLimits {
            header_read_timeout: self.config.header_read_timeout,
            max_header_bytes: self.config.max_header_bytes,
        };

        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            self.pool.clone(),
            limits,
            sessions.clone(),
            ListeningFlag(listening.clone()),
            shutdown_rx,
            force_rx,
        ));

        info!("Forwarding server listening on {}", local_addr);

        Ok(ServerHandle {
            control: ServerControl {
                local_addr,
                listening,
                sessions,
            },
            shutdown: shutdown_tx,
            force_close: force_tx,
            task,
        })
    }
}

/// Cloneable view of a running server for liveness checks
#[derive(Debug, Clone)]
pub struct ServerControl {
    local_addr: SocketAddr,
    listening: Arc<AtomicBool>,
    sessions: Arc<SessionTracker>,
}

impl ServerControl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn active_sessions(&self) -> u64 {
        self.sessions.active()
    }
}

/// Owned handle to a bound server; stopping consumes it
pub struct ServerHandle {
    control: ServerControl,
    shutdown: watch::Sender<bool>,
    force_close: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.control.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.control.is_listening() && !self.task.is_finished()
    }

    /// Stop accepting, let sessions finish for up to `drain`, then force-close the rest
    #[instrument(skip(self), fields(addr = %self.control.local_addr))]
    pub async fn stop(self, drain: Duration) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Accept loop ended abnormally: {}", e);
        }

        let sessions = &self.control.sessions;
        let active = sessions.active();
        if active > 0 {
            info!(active, "Draining client sessions");
            if tokio::time::timeout(drain, sessions.wait_idle()).await.is_err() {
                warn!(remaining = sessions.active(), "Drain period elapsed, force closing");
            }
        }

        let _ = self.force_close.send(true);
        if tokio::time::timeout(FORCE_CLOSE_SETTLE, sessions.wait_idle())
            .await
            .is_err()
        {
            warn!(remaining = sessions.active(), "Sessions still unwinding after force close");
        }

        info!("Forwarding server stopped");
    }
}

/// Clears the listening flag when the accept loop ends, however it ends
struct ListeningFlag(Arc<AtomicBool>);

impl Drop for ListeningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    pool: Arc<EndpointPool>,
    limits: ConnectionLimits,
    sessions: Arc<SessionTracker>,
    _listening: ListeningFlag,
    mut shutdown: watch::Receiver<bool>,
    force_close: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        // The endpoint is fixed for the life of the connection
                        let bound = pool.current();
                        let guard = SessionGuard::new(sessions.clone());

                        tokio::spawn(serve_connection(
                            stream,
                            client_addr,
                            bound,
                            handler.clone(),
                            limits,
                            shutdown.clone(),
                            force_close.clone(),
                            guard,
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Forwarding server no longer accepting");
                    break;
                }
            }
        }
    }
}

/// Handle a single connection
#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    bound: Option<Arc<ProxyEndpoint>>,
    handler: Arc<ProxyHandler>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
    mut force_close: watch::Receiver<bool>,
    _guard: SessionGuard,
) {
    let _ = stream.set_nodelay(true);

    debug!(
        client = %client_addr,
        endpoint = bound.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        "Client connected"
    );

    let head = tokio::select! {
        head = read_request_head(&mut stream, limits.max_header_bytes, limits.header_read_timeout) => head,
        _ = raised(&mut shutdown) => return,
    };
    let head = match head {
        Ok(head) => head,
        Err(e) if e.needs_response() => {
            debug!(client = %client_addr, error = %e, "Rejecting request head");
            reject_head(&mut stream, &e.to_string()).await;
            return;
        }
        Err(e) => {
            debug!(client = %client_addr, error = %e, "No request received");
            return;
        }
    };
    let io = TokioIo::new(PrefixedStream::new(head, stream));

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let bound = bound.clone();
        async move { Ok::<_, Infallible>(handler.handle(req, bound).await) }
    });

    // Later keep-alive heads are bounded by hyper itself
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read_timeout)
        .max_buf_size((limits.max_header_bytes + HEAD_CHUNK).max(MIN_HEADER_BYTES))
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = raised(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                res = conn.as_mut() => res,
                _ = raised(&mut force_close) => {
                    debug!(client = %client_addr, "Force closing client connection");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(client = %client_addr, "Connection error: {}", e);
    }
}

/// Resolves once `flag` is set or its sender is gone
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// Send a GET for `target` through the proxy at `proxy_addr` and return the status
pub async fn probe_through(proxy_addr: SocketAddr, target: &Url, timeout: Duration) -> Result<StatusCode> {
    let host = target
        .host_str()
        .ok_or_else(|| RotatorError::InvalidConfig(format!("probe URL has no host: {}", target)))?;
    let authority = format_authority(host, target.port_or_known_default().unwrap_or(80));
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: rotator-health\r\nConnection: close\r\n\r\n",
        target, authority
    );

    tokio::time::timeout(timeout, exchange(proxy_addr, &request))
        .await
        .map_err(|_| RotatorError::Process(format!("no answer from {} within {:?}", proxy_addr, timeout)))?
}

async fn exchange(proxy_addr: SocketAddr, request: &str) -> Result<StatusCode> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream)
        .await
        .map_err(|e| RotatorError::Http(e.to_string()))?;

    status_code_of(&head)
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| RotatorError::Http("malformed response from local proxy".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyScheme;
    use tokio::io::AsyncReadExt;

    fn test_config(port: u16) -> ProxyServerConfig {
        ProxyServerConfig {
            port,
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            header_read_timeout: Duration::from_secs(2),
            max_header_bytes: 16384,
            tunnel_idle_timeout: Duration::from_secs(5),
        }
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_bind_conflict_is_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = ForwardingServer::new(test_config(port), Arc::new(EndpointPool::new(None)));
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, RotatorError::AddressInUse { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_stop_clears_listening() {
        let server = ForwardingServer::new(test_config(0), Arc::new(EndpointPool::new(None)));
        let handle = server.bind().await.unwrap();
        let control = handle.control();
        assert!(handle.is_listening());

        handle.stop(Duration::from_millis(100)).await;
        assert!(!control.is_listening());
        assert!(TcpStream::connect(control.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let server = ForwardingServer::new(test_config(0), Arc::new(EndpointPool::new(None)));
        let handle = server.bind().await.unwrap();

        let response = raw_exchange(handle.local_addr(), b"NOT A REQUEST\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"), "got {:?}", response);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_slow_request_head_gets_400() {
        let mut config = test_config(0);
        config.header_read_timeout = Duration::from_millis(300);
        let handle = ForwardingServer::new(config, Arc::new(EndpointPool::new(None)))
            .bind()
            .await
            .unwrap();

        let response = raw_exchange(
            handle.local_addr(),
            b"GET http://example.com/ HTTP/1.1\r\nHost: exa",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "got {:?}", response);
        assert!(response.contains("Connection: close"));

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_oversized_request_head_gets_400() {
        let handle = ForwardingServer::new(test_config(0), Arc::new(EndpointPool::new(None)))
            .bind()
            .await
            .unwrap();

        let mut request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nX-Big: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(40 * 1024));
        request.extend_from_slice(b"\r\n\r\n");

        let response = raw_exchange(handle.local_addr(), &request).await;
        assert!(response.starts_with("HTTP/1.1 400"), "got {:?}", response);
        assert!(response.contains("Connection: close"));

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_https_without_connect_gets_400() {
        let pool = Arc::new(EndpointPool::new(None));
        pool.reload(vec![ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", dead_port().await)])
            .unwrap();
        let handle = ForwardingServer::new(test_config(0), pool).bind().await.unwrap();

        let response = raw_exchange(
            handle.local_addr(),
            b"GET https://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "got {:?}", response);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_empty_pool_gets_502() {
        let server = ForwardingServer::new(test_config(0), Arc::new(EndpointPool::new(None)));
        let handle = server.bind().await.unwrap();

        let target = Url::parse("http://example.com/").unwrap();
        let status = probe_through(handle.local_addr(), &target, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_dead_upstreams_marked_invalid() {
        let pool = Arc::new(EndpointPool::new(None));
        pool.reload(vec![
            ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", dead_port().await),
            ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", dead_port().await),
        ])
        .unwrap();
        let handle = ForwardingServer::new(test_config(0), pool.clone()).bind().await.unwrap();

        let response = raw_exchange(
            handle.local_addr(),
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 502"), "got {:?}", response);
        assert_eq!(pool.snapshot().valid, 0);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_stop_force_closes_idle_keepalive() {
        let server = ForwardingServer::new(test_config(0), Arc::new(EndpointPool::new(None)));
        let handle = server.bind().await.unwrap();
        let control = handle.control();

        // Connected but never sends a request
        let _client = TcpStream::connect(handle.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(3), handle.stop(Duration::from_millis(100)))
            .await
            .expect("stop did not finish");
        assert_eq!(control.active_sessions(), 0);
    }

    mod end_to_end {
        use super::*;
        use crate::testing::{
            echo_roundtrip, open_tunnel, raw_exchange, spawn_echo, spawn_origin, MockUpstream,
        };

        async fn serve(pool: Arc<EndpointPool>) -> ServerHandle {
            ForwardingServer::new(test_config(0), pool).bind().await.unwrap()
        }

        fn get_request(origin: SocketAddr, path: &str) -> Vec<u8> {
            format!(
                "GET http://{}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                origin, path, origin
            )
            .into_bytes()
        }

        fn body_of(response: &str) -> &str {
            response.split("\r\n\r\n").nth(1).unwrap_or_default()
        }

        #[tokio::test]
        async fn test_get_matches_direct_fetch() {
            let origin = spawn_origin().await;
            let upstream = MockUpstream::spawn().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![upstream.endpoint()]).unwrap();
            let handle = serve(pool).await;

            let proxied = raw_exchange(
                handle.local_addr(),
                &get_request(origin, "/hello?x=1"),
                Duration::from_secs(3),
            )
            .await;
            let direct = raw_exchange(
                origin,
                format!("GET /hello?x=1 HTTP/1.1\r\nHost: {}\r\n\r\n", origin).as_bytes(),
                Duration::from_secs(3),
            )
            .await;

            assert!(proxied.starts_with("HTTP/1.1 200"), "got {:?}", proxied);
            assert!(proxied.to_ascii_lowercase().contains("x-origin: yes"));
            assert_eq!(body_of(&proxied), body_of(&direct));
            assert_eq!(body_of(&proxied), "origin:/hello?x=1");

            let heads = upstream.heads();
            assert_eq!(heads.len(), 1);
            assert!(
                heads[0].starts_with(&format!("GET http://{}/hello?x=1 HTTP/1.1", origin)),
                "upstream saw {:?}",
                heads[0]
            );

            handle.stop(Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_credentials_reach_http_upstream() {
            let origin = spawn_origin().await;
            let upstream = MockUpstream::spawn().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![upstream.endpoint().with_credentials("user", "pass")])
                .unwrap();
            let handle = serve(pool).await;

            let response = raw_exchange(
                handle.local_addr(),
                &get_request(origin, "/"),
                Duration::from_secs(3),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200"), "got {:?}", response);

            let head = upstream.heads()[0].to_ascii_lowercase();
            assert!(head.contains("proxy-authorization: basic dxnlcjpwyxnz"), "upstream saw {:?}", head);
            assert!(!head.contains("proxy-connection"));

            handle.stop(Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_connect_tunnel_relays_bytes_unchanged() {
            let echo = spawn_echo().await;
            let upstream = MockUpstream::spawn().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![upstream.endpoint()]).unwrap();
            let handle = serve(pool).await;

            let mut tunnel = open_tunnel(handle.local_addr(), echo).await;
            let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
            assert_eq!(echo_roundtrip(&mut tunnel, &payload).await, payload);

            let head = &upstream.heads()[0];
            assert!(head.starts_with(&format!("CONNECT {} HTTP/1.1", echo)), "upstream saw {:?}", head);

            drop(tunnel);
            handle.stop(Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_rotation_leaves_open_tunnel_on_its_endpoint() {
            let echo = spawn_echo().await;
            let origin = spawn_origin().await;
            let first = MockUpstream::spawn().await;
            let second = MockUpstream::spawn().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![first.endpoint(), second.endpoint()]).unwrap();
            let handle = serve(pool.clone()).await;

            let mut tunnel = open_tunnel(handle.local_addr(), echo).await;
            assert_eq!(echo_roundtrip(&mut tunnel, b"before").await, b"before");

            let rotated = pool.rotate().unwrap();
            assert_eq!(rotated.port, second.addr.port());
            // The first upstream stops accepting; the open tunnel must not care
            first.shutdown();

            assert_eq!(echo_roundtrip(&mut tunnel, b"after").await, b"after");
            assert_eq!(first.connections(), 1);
            assert_eq!(second.connections(), 0);

            // New connections use the newly active endpoint
            let response = raw_exchange(
                handle.local_addr(),
                &get_request(origin, "/next"),
                Duration::from_secs(3),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200"), "got {:?}", response);
            assert_eq!(second.connections(), 1);

            drop(tunnel);
            handle.stop(Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_exhausted_pool_recovers_after_reload() {
            let origin = spawn_origin().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![
                ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", dead_port().await),
                ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", dead_port().await),
            ])
            .unwrap();
            let handle = serve(pool.clone()).await;

            let response = raw_exchange(
                handle.local_addr(),
                &get_request(origin, "/"),
                Duration::from_secs(3),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 502"), "got {:?}", response);
            assert_eq!(pool.snapshot().valid, 0);

            let upstream = MockUpstream::spawn().await;
            pool.reload(vec![upstream.endpoint()]).unwrap();

            let response = raw_exchange(
                handle.local_addr(),
                &get_request(origin, "/"),
                Duration::from_secs(3),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200"), "got {:?}", response);
            assert_eq!(upstream.connections(), 1);

            handle.stop(Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_stop_waits_for_open_tunnel_then_closes_it() {
            let echo = spawn_echo().await;
            let upstream = MockUpstream::spawn().await;
            let pool = Arc::new(EndpointPool::new(None));
            pool.reload(vec![upstream.endpoint()]).unwrap();
            let handle = serve(pool).await;
            let control = handle.control();

            let mut tunnel = open_tunnel(handle.local_addr(), echo).await;
            assert_eq!(echo_roundtrip(&mut tunnel, b"ping").await, b"ping");
            assert!(control.active_sessions() > 0);

            tokio::time::timeout(Duration::from_secs(5), handle.stop(Duration::from_millis(200)))
                .await
                .expect("stop did not finish");
            assert_eq!(control.active_sessions(), 0);

            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(2), tunnel.read(&mut buf))
                .await
                .expect("tunnel left open");
            assert!(matches!(read, Ok(0) | Err(_)));
        }
    }
}
