//! Proxy list parsing
//!
//! One endpoint per line, either `host:port[:user:pass]` or
//! `scheme://[user:pass@]host:port`. Blank lines and `#` comments are ignored.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};
use url::Url;

use super::LoadError;
use crate::models::{ProxyEndpoint, ProxyScheme};

/// Result of parsing a list, before any emptiness policy is applied
#[derive(Debug, Default)]
pub struct ParsedList {
    pub entries: Vec<ProxyEndpoint>,
    /// Non-comment lines that could not be parsed
    pub malformed: usize,
    /// Well-formed lines dropped as duplicates
    pub duplicates: usize,
}

/// Parse a single list line
pub fn parse_line(line: &str) -> std::result::Result<ProxyEndpoint, String> {
    let line = line.trim();
    if line.contains("://") {
        parse_url_line(line)
    } else {
        parse_colon_line(line)
    }
}

fn parse_colon_line(line: &str) -> std::result::Result<ProxyEndpoint, String> {
    let fields: Vec<&str> = line.split(':').collect();
    let (host, port) = match fields.as_slice() {
        [host, port] | [host, port, _, _] => (*host, *port),
        _ => return Err(format!("expected host:port[:user:pass], got {} fields", fields.len())),
    };

    validate_host(host)?;
    let port = parse_port(port)?;
    let endpoint = ProxyEndpoint::new(ProxyScheme::Http, host, port);

    match fields.as_slice() {
        [_, _, user, pass] if !user.is_empty() => Ok(endpoint.with_credentials(*user, *pass)),
        [_, _, _, _] => Err("empty username".to_string()),
        _ => Ok(endpoint),
    }
}

fn parse_url_line(line: &str) -> std::result::Result<ProxyEndpoint, String> {
    let url = Url::parse(line).map_err(|e| e.to_string())?;

    let scheme = ProxyScheme::from_str(url.scheme())
        .ok_or_else(|| format!("unsupported scheme {}", url.scheme()))?;

    if !(url.path().is_empty() || url.path() == "/") || url.query().is_some() {
        return Err("unexpected path or query".to_string());
    }

    let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().ok_or_else(|| "missing port".to_string())?;
    let endpoint = ProxyEndpoint::new(scheme, host, port);

    if url.username().is_empty() {
        Ok(endpoint)
    } else {
        Ok(endpoint.with_credentials(url.username(), url.password().unwrap_or("")))
    }
}

fn validate_host(host: &str) -> std::result::Result<(), String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("invalid host {:?}", host));
    }
    Ok(())
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port {:?}", port)),
        Ok(p) => Ok(p),
    }
}

/// Parse list content, keeping source order and the first copy of each endpoint
pub fn parse_list(content: &str) -> ParsedList {
    let mut parsed = ParsedList::default();
    let mut seen = HashSet::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Ok(endpoint) => {
                if seen.insert(endpoint.key()) {
                    parsed.entries.push(endpoint);
                } else {
                    parsed.duplicates += 1;
                }
            }
            Err(reason) => {
                warn!(line = lineno + 1, reason = %reason, "Skipping malformed proxy list entry");
                parsed.malformed += 1;
            }
        }
    }

    parsed
}

/// Read and parse a list file, applying the emptiness rules
pub async fn read_list(path: &Path) -> std::result::Result<Vec<ProxyEndpoint>, LoadError> {
    let shown = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoadError::Unreadable {
            path: shown.clone(),
            source,
        })?;

    let parsed = parse_list(&content);
    debug!(
        path = %shown,
        entries = parsed.entries.len(),
        malformed = parsed.malformed,
        duplicates = parsed.duplicates,
        "Parsed proxy list"
    );

    if parsed.entries.is_empty() {
        if parsed.malformed > 0 {
            return Err(LoadError::Malformed {
                path: shown,
                lines: parsed.malformed,
            });
        }
        return Err(LoadError::Empty { path: shown });
    }

    Ok(parsed.entries)
}
