//! Endpoint validation probes

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, RotatorError};
use crate::models::{ProxyEndpoint, ProxyScheme};
use crate::proxy::transport::{format_authority, read_response_head, status_code_of, ProxyTransport};

/// Check an endpoint: a TCP connect, plus an HTTP GET through it when `probe_url` is set
#[instrument(skip(endpoint, probe_url), fields(endpoint = %endpoint))]
pub async fn probe_endpoint(
    endpoint: &ProxyEndpoint,
    check_timeout: Duration,
    probe_url: Option<&Url>,
) -> Result<()> {
    let attempt = async {
        match probe_url {
            None => ProxyTransport::open(endpoint).await.map(|_| ()),
            Some(url) => http_probe(endpoint, url).await,
        }
    };

    timeout(check_timeout, attempt)
        .await
        .map_err(|_| RotatorError::UpstreamTimeout)?
}

async fn http_probe(endpoint: &ProxyEndpoint, url: &Url) -> Result<()> {
    let host = url
        .host_str()
        .ok_or_else(|| RotatorError::InvalidConfig(format!("probe URL has no host: {}", url)))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let authority = format_authority(host, port);

    let (mut stream, request) = match endpoint.scheme {
        ProxyScheme::Http => {
            let stream = ProxyTransport::open(endpoint).await?;
            let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", url, authority);
            if let Some(credentials) = endpoint.basic_auth() {
                request.push_str(&format!("Proxy-Authorization: {}\r\n", credentials));
            }
            (stream, request)
        }
        ProxyScheme::Socks5 => {
            let stream = ProxyTransport::connect(endpoint, host, port).await?;
            let path = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            (stream, format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, authority))
        }
    };
    let request = request + "User-Agent: rotator-validator\r\nConnection: close\r\n\r\n";

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| RotatorError::UpstreamConnectFailed(format!("probe write failed: {}", e)))?;

    let head = read_response_head(&mut stream)
        .await
        .map_err(|e| RotatorError::UpstreamConnectFailed(format!("probe read failed: {}", e)))?;

    match status_code_of(&head) {
        Some(200) => {
            debug!("Probe through {} succeeded", endpoint);
            Ok(())
        }
        Some(code) => Err(RotatorError::UpstreamConnectFailed(format!(
            "probe answered {}",
            code
        ))),
        None => Err(RotatorError::UpstreamConnectFailed(
            "probe got a malformed response".to_string(),
        )),
    }
}
