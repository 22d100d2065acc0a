//! The file-serving application behind the transport: turns a reassembled
//! request string into a response string. GET reads a file or lists a
//! directory, POST writes a file. The transport treats all of this as
//! opaque - it only sees [`RequestHandler`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::transport::server::RequestHandler;

const CRLF: &str = "\r\n";

pub struct FileServer {
    root: PathBuf,
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>) -> FileServer {
        FileServer { root: root.into() }
    }

    fn run_get(&self, path: &str) -> anyhow::Result<String> {
        if path.contains("..") {
            return Ok(error_response("403 Forbidden"));
        }

        let target = self.resolve(path);
        if !target.exists() {
            return Ok(error_response("404 Not Found"));
        }
        if target.is_dir() {
            return directory_listing(&target);
        }
        file_response(&target)
    }

    fn run_post(&self, path: &str, body: &str) -> anyhow::Result<String> {
        if path.contains("..") {
            return Ok(error_response("403 Forbidden"));
        }

        let target = self.resolve(path);
        let existed = target.exists();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, body)?;

        info!(path, existed, "file written");
        if existed {
            Ok(success_response("200 OK", "File contents overwritten", None))
        } else {
            Ok(success_response("201 Created", "New file created", None))
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        // the query part plays no role in file lookup
        let path = path.split('?').next().unwrap_or(path);
        self.root.join(path.trim_start_matches('/'))
    }
}

impl RequestHandler for FileServer {
    fn handle(&self, request: &str) -> anyhow::Result<String> {
        debug!(len = request.len(), "handling request");

        let (head, body) = match request.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (request, ""),
        };
        let request_line = head.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();

        match (parts.next(), parts.next()) {
            (Some("GET"), Some(path)) => self.run_get(path),
            (Some("POST"), Some(path)) => self.run_post(path, body),
            _ => Ok(error_response("400 Bad Request")),
        }
    }
}

fn directory_listing(dir: &Path) -> anyhow::Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut body = String::new();
    for name in &names {
        body.push_str(name);
        body.push('\n');
    }
    Ok(success_response("200 OK", &body, Some("text/plain")))
}

fn file_response(file: &Path) -> anyhow::Result<String> {
    let contents = fs::read(file)?;
    let body = String::from_utf8_lossy(&contents).into_owned();
    Ok(success_response("200 OK", &body, Some(content_type(file))))
}

fn content_type(file: &Path) -> &'static str {
    match file.extension().and_then(|e| e.to_str()) {
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

fn success_response(status: &str, body: &str, content_type: Option<&str>) -> String {
    let mut response = format!("HTTP/1.0 {status}{CRLF}Content-Length: {}{CRLF}", body.len());
    if let Some(content_type) = content_type {
        response.push_str(&format!("Content-Type: {content_type}{CRLF}"));
    }
    response.push_str(CRLF);
    response.push_str(body);
    response
}

fn error_response(status: &str) -> String {
    format!("HTTP/1.0 {status}{CRLF}{CRLF}")
}

#[cfg(test)]
mod test {
    use super::*;

    /// fresh directory per test so parallel tests cannot interfere
    fn test_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("udpfs-fs-test-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_get_missing_file_is_404() {
        let server = FileServer::new(test_root("missing"));
        let response = server.handle("GET /nope.txt HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(response, "HTTP/1.0 404 Not Found\r\n\r\n");
    }

    #[test]
    fn test_get_traversal_is_403() {
        let server = FileServer::new(test_root("traversal"));
        let response = server.handle("GET /../etc/passwd HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(response, "HTTP/1.0 403 Forbidden\r\n\r\n");
    }

    #[test]
    fn test_get_file_returns_contents() {
        let root = test_root("contents");
        fs::write(root.join("foo.txt"), "hello\n").unwrap();

        let server = FileServer::new(root);
        let response = server
            .handle("GET /foo.txt HTTP/1.0\r\nHost: x\r\n\r\n")
            .unwrap();
        assert_eq!(
            response,
            "HTTP/1.0 200 OK\r\nContent-Length: 6\r\nContent-Type: text/plain\r\n\r\nhello\n"
        );
    }

    #[test]
    fn test_get_directory_lists_entries() {
        let root = test_root("listing");
        fs::write(root.join("b.txt"), "").unwrap();
        fs::write(root.join("a.txt"), "").unwrap();

        let server = FileServer::new(root);
        let response = server.handle("GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\na.txt\nb.txt\n"));
    }

    #[test]
    fn test_post_creates_then_overwrites() {
        let root = test_root("post");
        let server = FileServer::new(root.clone());

        let created = server
            .handle("POST /sub/new.txt HTTP/1.0\r\nContent-Length: 4\r\n\r\ndata")
            .unwrap();
        assert!(created.starts_with("HTTP/1.0 201 Created\r\n"));
        assert_eq!(fs::read_to_string(root.join("sub/new.txt")).unwrap(), "data");

        let overwritten = server
            .handle("POST /sub/new.txt HTTP/1.0\r\nContent-Length: 5\r\n\r\nother")
            .unwrap();
        assert!(overwritten.starts_with("HTTP/1.0 200 OK\r\n"));
        assert_eq!(fs::read_to_string(root.join("sub/new.txt")).unwrap(), "other");
    }

    #[test]
    fn test_malformed_request_is_400() {
        let server = FileServer::new(test_root("malformed"));
        let response = server.handle("NONSENSE\r\n\r\n").unwrap();
        assert_eq!(response, "HTTP/1.0 400 Bad Request\r\n\r\n");
    }
}
