use crate::{Error, Result};
use http_types::{
    headers::{HeaderName, Headers, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    Method, Url, Version,
};
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
};

/**
A received http request.

The head has been fully parsed and the body, if any, has been read off
the transport (bounded by [`HttpConfig`](crate::HttpConfig)), so the
request is a plain value that can be handed around freely while the
response writer owns the transport.
*/
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) version: Version,
    pub(crate) headers: Headers,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) secure: bool,
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("peer_addr", &self.peer_addr)
            .field("secure", &self.secure)
            .finish()
    }
}

impl Request {
    /// Build a synthetic request that did not come off a transport,
    /// for tests and for internal re-dispatch.
    pub fn synthetic(method: Method, path: impl Into<String>, body: Option<Vec<u8>>) -> Self {
        let mut headers = Headers::new();
        if let Some(body) = &body {
            headers.insert(CONTENT_LENGTH, body.len().to_string().as_str());
        }

        Self {
            method,
            path: path.into(),
            version: Version::Http1_1,
            headers,
            body,
            peer_addr: None,
            secure: false,
        }
    }

    /// the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// replace the request method, used by internal re-dispatch
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// the path part of the request target, up to and excluding any
    /// query component
    pub fn path(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    /// the full request target as received, including any query
    pub fn raw_path(&self) -> &str {
        &self.path
    }

    /// the query component of the request target, without the leading
    /// question mark
    pub fn query(&self) -> &str {
        self.path.splitn(2, '?').nth(1).unwrap_or_default()
    }

    /// replace the full request target, including any query
    pub fn set_raw_path(&mut self, raw_path: &str) {
        self.path = String::from(raw_path);
    }

    /// replace the path component, preserving the query component
    pub fn set_path(&mut self, path: &str) {
        let query = self.query().to_string();
        self.path = if query.is_empty() {
            String::from(path)
        } else {
            format!("{path}?{query}")
        };
    }

    /// the http version of this request
    pub fn version(&self) -> Version {
        self.version
    }

    /// a read-only reference to the request headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// a mutable reference to the request headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// the last value of the named header, if present
    pub fn header_str(&self, name: impl Into<HeaderName>) -> Option<&str> {
        self.headers.get(name.into()).map(|values| values.as_str())
    }

    /// The host this request was addressed to, from the Host header.
    /// Falls back to `"localhost"` for synthetic requests.
    pub fn host(&self) -> &str {
        self.header_str(HOST).unwrap_or("localhost")
    }

    /// The subdomain of the request host: the portion before the
    /// first dot, or the empty string when there is none.
    pub fn subdomain(&self) -> &str {
        let host = self.host();
        match host.find('.') {
            Some(index) if index > 0 => &host[..index],
            _ => "",
        }
    }

    /// Reconstruct a [`Url`] for this request from the host and the
    /// request target.
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{}://{}{}", scheme, self.host(), self.path))
            .map_err(|_| Error::RequestPathMissing)
    }

    /// the Content-Type header of this request
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(CONTENT_TYPE)
    }

    /// the declared Content-Length of this request, or zero when
    /// absent or unparseable
    pub fn content_length(&self) -> u64 {
        self.header_str(CONTENT_LENGTH)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// a read-only view of the buffered request body
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// remove the buffered request body from this request and return it
    pub fn take_body(&mut self) -> Option<Vec<u8>> {
        self.body.take()
    }

    /// replace the buffered request body
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = Some(body);
    }

    /// the peer address of the transport this request arrived on
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// set the peer address, used by server loops
    pub fn set_peer_addr(&mut self, peer_addr: Option<SocketAddr>) {
        self.peer_addr = peer_addr;
    }

    /// whether this request arrived over a secured transport
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// mark this request as having arrived over a secured transport
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub(crate) fn header_contains_ignore_ascii_case(
        &self,
        name: impl Into<HeaderName>,
        needle: &str,
    ) -> bool {
        self.header_str(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case(needle))
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query() {
        let request = Request::synthetic(Method::Get, "/some/path?and&a=query", None);
        assert_eq!(request.path(), "/some/path");
        assert_eq!(request.query(), "and&a=query");

        let mut request = request;
        request.set_path("/other");
        assert_eq!(request.raw_path(), "/other?and&a=query");
    }

    #[test]
    fn subdomain() {
        let mut request = Request::synthetic(Method::Get, "/", None);
        request.headers_mut().insert(HOST, "admin.example.com");
        assert_eq!(request.subdomain(), "admin");
        request.headers_mut().insert(HOST, "example.com");
        assert_eq!(request.subdomain(), "example");
        request.headers_mut().insert(HOST, "localhost");
        assert_eq!(request.subdomain(), "");
    }
}
