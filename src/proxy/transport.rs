//! Proxy transport layer for HTTP and SOCKS5 upstreams
//!
//! Handles establishing connections through upstream proxy endpoints.

use hyper::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{Result, RotatorError};
use crate::models::{ProxyEndpoint, ProxyScheme};

/// Upper bound on an upstream response head we are willing to buffer
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a byte stream to `target_host:target_port` through the endpoint
    #[instrument(skip(endpoint), fields(endpoint = %endpoint, target = %target_host))]
    pub async fn connect(
        endpoint: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match endpoint.scheme {
            ProxyScheme::Http => Self::connect_http(endpoint, target_host, target_port).await,
            ProxyScheme::Socks5 => Self::connect_socks5(endpoint, target_host, target_port).await,
        }
    }

    /// Open a plain TCP connection to the endpoint itself
    pub async fn open(endpoint: &ProxyEndpoint) -> Result<TcpStream> {
        TcpStream::connect(endpoint.address())
            .await
            .map_err(|e| RotatorError::UpstreamConnectFailed(format!("TCP connect to {} failed: {}", endpoint, e)))
    }

    /// Connect through the HTTP CONNECT method
    async fn connect_http(
        endpoint: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", endpoint);

        let mut stream = Self::open(endpoint).await?;
        let request = Self::build_connect_request(endpoint, target_host, target_port);

        Self::handshake(&mut stream, &request).await.map_err(|e| {
            RotatorError::UpstreamConnectFailed(format!("CONNECT via {} failed: {}", endpoint, e))
        })?;

        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    async fn handshake(stream: &mut TcpStream, request: &str) -> anyhow::Result<()> {
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(stream).await?;
        match status_code_of(&head) {
            Some(200) => Ok(()),
            Some(407) => anyhow::bail!("proxy authentication rejected"),
            Some(code) => anyhow::bail!("upstream answered {}", code),
            None => anyhow::bail!("malformed CONNECT response"),
        }
    }

    /// Build HTTP CONNECT request
    fn build_connect_request(endpoint: &ProxyEndpoint, target_host: &str, target_port: u16) -> String {
        let authority = format_authority(target_host, target_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

        if let Some(credentials) = endpoint.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", credentials));
        }

        request.push_str("\r\n");
        request
    }

    /// Connect through a SOCKS5 proxy
    async fn connect_socks5(
        endpoint: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", endpoint);

        let proxy_addr = tokio::net::lookup_host(endpoint.address())
            .await
            .map_err(|e| RotatorError::InvalidProxyAddress(format!("{}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| RotatorError::InvalidProxyAddress(endpoint.to_string()))?;

        let target = (target_host, target_port);
        let stream = match (&endpoint.username, &endpoint.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password(proxy_addr, target, username, password).await
            }
            _ => Socks5Stream::connect(proxy_addr, target).await,
        }
        .map_err(|e| {
            RotatorError::UpstreamConnectFailed(format!("SOCKS5 via {} failed: {}", endpoint, e))
        })?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Parse host and port from an absolute-form URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| RotatorError::InvalidRequest("Missing host in URI".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Parse host and port from authority (for CONNECT requests)
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) if !host.ends_with(':') => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| RotatorError::InvalidRequest("Invalid port".to_string()))?;
                (host, port)
            }
            // Default to port 443 for CONNECT (typically HTTPS)
            _ => (authority, 443),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RotatorError::InvalidRequest("Missing host in CONNECT target".to_string()));
        }

        Ok((host.to_string(), port))
    }
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Read an HTTP response head byte by byte so nothing past the blank line is consumed
pub(crate) async fn read_response_head<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            anyhow::bail!("response head exceeds {} bytes", MAX_RESPONSE_HEAD);
        }
        if stream.read(&mut byte).await? == 0 {
            anyhow::bail!("connection closed before response head completed");
        }
        head.push(byte[0]);
    }

    Ok(head)
}

/// Status code from the first line of a response head
pub(crate) fn status_code_of(head: &[u8]) -> Option<u16> {
    let line = head.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            ProxyTransport::parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            ProxyTransport::parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            ProxyTransport::parse_authority("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(ProxyTransport::parse_authority("example.com:http").is_err());
        assert!(ProxyTransport::parse_authority(":443").is_err());
    }

    #[test]
    fn test_parse_target() {
        let uri: Uri = "http://example.com/index.html".parse().unwrap();
        assert_eq!(
            ProxyTransport::parse_target(&uri).unwrap(),
            ("example.com".to_string(), 80)
        );

        let uri: Uri = "http://example.com:8080/".parse().unwrap();
        assert_eq!(ProxyTransport::parse_target(&uri).unwrap().1, 8080);

        let uri: Uri = "/relative".parse().unwrap();
        assert!(ProxyTransport::parse_target(&uri).is_err());
    }

    #[test]
    fn test_build_connect_request_with_auth() {
        let endpoint = ProxyEndpoint::new(ProxyScheme::Http, "proxy", 3128).with_credentials("user", "pass");
        let request = ProxyTransport::build_connect_request(&endpoint, "example.com", 443);

        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_status_code_of() {
        assert_eq!(status_code_of(b"HTTP/1.1 200 Connection Established\r\n\r\n"), Some(200));
        assert_eq!(status_code_of(b"HTTP/1.0 407 Proxy Auth\r\n\r\n"), Some(407));
        assert_eq!(status_code_of(b"SSH-2.0-OpenSSH\r\n"), None);
    }

    #[tokio::test]
    async fn test_read_response_head_leaves_body_unread() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nX-A: b\r\n\r\nbanner")
            .await
            .unwrap();

        let head = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));

        let mut rest = [0u8; 6];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"banner");
    }

    #[tokio::test]
    async fn test_read_response_head_across_fragments() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 Conn")
            .read(b"ection Established\r\n")
            .read(b"\r\n")
            .build();

        let head = read_response_head(&mut stream).await.unwrap();
        assert_eq!(status_code_of(&head), Some(200));
    }

    #[tokio::test]
    async fn test_read_response_head_truncated() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 OK\r\n")
            .build();

        let err = read_response_head(&mut stream).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_connect_http_rejected_by_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_response_head(&mut socket).await;
            let _ = socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let endpoint = ProxyEndpoint::new(ProxyScheme::Http, "127.0.0.1", addr.port());
        let err = ProxyTransport::connect(&endpoint, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, RotatorError::UpstreamConnectFailed(_)));
        assert!(err.to_string().contains("authentication"));
    }
}
