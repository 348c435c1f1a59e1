use std::time::Duration;

/**
Performance and security tuning parameters for the http layer.

The defaults are sane for a public-facing server. All of the setters
are chainable.
*/
#[derive(Clone, Copy, Debug)]
pub struct HttpConfig {
    pub(crate) max_head_length: usize,
    pub(crate) max_request_body: u64,
    /// maximum time to wait for a request head on an idle connection
    pub read_timeout: Option<Duration>,
    /// reserved for response write pacing
    pub write_timeout: Option<Duration>,
}

pub(crate) const MAX_HEADERS: usize = 128;

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_head_length: 8 * 1024,
            max_request_body: 500 * 1024 * 1024,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl HttpConfig {
    /// Construct a default http config
    pub fn new() -> Self {
        Self::default()
    }

    /// The maximum length of a request head, in bytes. Defaults to 8kb
    pub fn with_head_length_limit(mut self, max_head_length: usize) -> Self {
        self.max_head_length = max_head_length;
        self
    }

    /// The maximum length of a received request body, in
    /// bytes. Defaults to 500mb
    pub fn with_request_body_limit(mut self, max_request_body: u64) -> Self {
        self.max_request_body = max_request_body;
        self
    }

    /// The maximum time to wait for a request head before giving up on
    /// an idle connection. Defaults to no timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Reserved: the maximum time to spend writing a response before
    /// giving up on the connection. Defaults to no timeout
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = Some(write_timeout);
        self
    }
}
