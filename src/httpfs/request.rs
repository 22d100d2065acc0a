//! Builds the request strings the client streams to the file server:
//! an HTTP/1.0-style request line plus a few fixed headers, CRLF framing,
//! body after a blank line.

use std::str::FromStr;

use anyhow::anyhow;

const HTTP_VERSION: &str = "HTTP/1.0";
const USER_AGENT: &str = "Mozilla/5.0";
const CRLF: &str = "\r\n";

/// The pieces of a `http://host[:port]/path?query` URL the request builder
/// needs. The scheme prefix is optional.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestUrl {
    pub host: String,
    pub path_and_query: String,
}

impl FromStr for RequestUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("http://").unwrap_or(s);
        if rest.is_empty() {
            return Err(anyhow!("empty URL"));
        }

        let (authority, path_and_query) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{path}")),
            None => (rest, "/".to_string()),
        };
        let host = authority.split(':').next().unwrap_or(authority);
        if host.is_empty() {
            return Err(anyhow!("URL has no host: {}", s));
        }

        Ok(RequestUrl {
            host: host.to_string(),
            path_and_query,
        })
    }
}

pub fn build_get(url: &RequestUrl) -> String {
    format!(
        "GET {} {HTTP_VERSION}{CRLF}User-Agent: {USER_AGENT}{CRLF}Host: {}{CRLF}{CRLF}",
        url.path_and_query, url.host
    )
}

pub fn build_post(url: &RequestUrl, data: &str) -> String {
    format!(
        "POST {} {HTTP_VERSION}{CRLF}Content-Length: {}{CRLF}User-Agent: {USER_AGENT}{CRLF}Host: {}{CRLF}{CRLF}{data}",
        url.path_and_query,
        data.len(),
        url.host
    )
}
