#![forbid(unsafe_code)]
#![deny(
    clippy::dbg_macro,
    rustdoc::missing_crate_level_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications
)]
/*!
Testing utilities for trellis applications.

The core of this crate is [`TestTransport`], an in-memory duplex
connection, and [`run_service`], which drives any
[`HttpService`](trellis_http::HttpService) with a synthetic request and
hands back the parsed response for assertions:

```no_run
# fn example(service: impl trellis_http::HttpService) {
use trellis_testing::{get, run_service};

let response = run_service(&service, get("/hello"));
assert_eq!(response.status, 200);
assert_eq!(response.body_string(), "hello world");
# }
```
*/

mod test_transport;
pub use test_transport::{CloseableCursor, TestTransport};

use http_types::Method;
use trellis_http::{BoxedTransport, HttpService, Request};

pub use smol::block_on;

/// A synthetic GET request for the provided path.
pub fn get(path: &str) -> Request {
    Request::synthetic(Method::Get, path, None)
}

/// A synthetic POST request carrying the provided body.
pub fn post(path: &str, body: impl AsRef<[u8]>) -> Request {
    Request::synthetic(Method::Post, path, Some(body.as_ref().to_vec()))
}

/// A synthetic request for any method.
pub fn request(method: Method, path: &str) -> Request {
    Request::synthetic(method, path, None)
}

/**
A response as observed on the client side of a [`TestTransport`],
parsed for assertions.
*/
#[derive(Debug)]
pub struct TestResponse {
    /// the response status code
    pub status: u16,
    /// the status line's reason phrase
    pub reason: String,
    /// the response headers in wire order, names lowercased
    pub headers: Vec<(String, String)>,
    /// the response body, de-chunked when the response was chunked
    pub body: Vec<u8>,
}

impl TestResponse {
    /// The last value of the named header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All values of the named header, case-insensitive.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// The body as a lossy string.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/**
Drive `service` with `request` over an in-memory transport and parse
whatever it wrote as an http response. Panics when the service wrote
something that is not parseable as a response, since that is always a
test failure.
*/
pub fn run_service(service: &impl HttpService, request: Request) -> TestResponse {
    block_on(async {
        let (client, server) = TestTransport::new();
        let _ = service.call(BoxedTransport::new(server), request).await;
        parse_response(&client.received())
    })
}

/// Parse raw response bytes into a [`TestResponse`].
pub fn parse_response(raw: &[u8]) -> TestResponse {
    let head_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response head was not terminated");

    let head = std::str::from_utf8(&raw[..head_end]).expect("response head was not utf8");
    let mut lines = head.split("\r\n");

    let status_line = lines.next().expect("response had no status line");
    let mut status_parts = status_line.splitn(3, ' ');
    let _version = status_parts.next();
    let status = status_parts
        .next()
        .and_then(|code| code.parse().ok())
        .expect("unparseable status code");
    let reason = String::from(status_parts.next().unwrap_or_default());

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), String::from(value.trim())));
        }
    }

    let raw_body = &raw[head_end + 4..];
    let chunked = headers
        .iter()
        .any(|(name, value)| name == "transfer-encoding" && value.contains("chunked"));

    let body = if chunked {
        dechunk(raw_body)
    } else if let Some(length) = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
    {
        raw_body[..length.min(raw_body.len())].to_vec()
    } else {
        raw_body.to_vec()
    };

    TestResponse {
        status,
        reason,
        headers,
        body,
    }
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = raw.windows(2).position(|window| window == b"\r\n") else {
            return body;
        };
        let size = std::str::from_utf8(&raw[..line_end])
            .ok()
            .and_then(|line| usize::from_str_radix(line.split(';').next().unwrap_or("0"), 16).ok())
            .unwrap_or_default();

        if size == 0 {
            return body;
        }

        let start = line_end + 2;
        let end = (start + size).min(raw.len());
        body.extend_from_slice(&raw[start..end]);
        raw = raw.get(end + 2..).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_response() {
        let response = parse_response(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-One: a\r\nX-One: b\r\n\r\nhello",
        );
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.body_string(), "hello");
        assert_eq!(response.header("x-one"), Some("b"));
        assert_eq!(response.header_values("X-One"), vec!["a", "b"]);
    }

    #[test]
    fn parses_a_chunked_response() {
        let response = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(response.body_string(), "hello world");
    }

    #[test]
    fn transport_pair_is_duplex() {
        use futures_lite::{AsyncReadExt, AsyncWriteExt};

        block_on(async {
            let (mut client, mut server) = TestTransport::new();
            client.write_all(b"ping").await.unwrap();

            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            server.write_all(b"pong").await.unwrap();
            assert_eq!(client.received(), b"pong");
        });
    }
}
