use crate::{http_config::MAX_HEADERS, Error, HttpConfig, Request, Result, Transport};
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use http_types::{
    headers::{Headers, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING},
    Method, Version,
};
use httparse::EMPTY_HEADER;
use memchr::memmem::Finder;
use std::{iter, str::FromStr};
use stopper::Stopper;

/**
Read one request off the transport.

`buffer` carries any bytes that were read past the previous request's
end; on return it carries the bytes read past this request's body, if
the client pipelined. The first read of the head is gated on the
provided [`Stopper`] so that idle keep-alive connections wind down on
graceful shutdown.

Returns `Ok(None)` for a connection that closed cleanly between
requests.
*/
pub async fn receive_request<T: Transport>(
    transport: &mut T,
    buffer: &mut Vec<u8>,
    stopper: &Stopper,
    config: &HttpConfig,
) -> Result<Option<Request>> {
    let (head, mut leftover) = match read_head(transport, std::mem::take(buffer), stopper, config)
        .await?
    {
        Some(head_and_leftover) => head_and_leftover,
        None => return Ok(None),
    };

    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut httparse_req = httparse::Request::new(&mut headers);
    let status = httparse_req.parse(&head)?;
    if status.is_partial() {
        log::debug!("partial head content: {}", String::from_utf8_lossy(&head));
        return Err(Error::PartialHead);
    }

    let method = httparse_req.method.ok_or(Error::MissingMethod)?;
    let method = Method::from_str(method)
        .map_err(|_| Error::UnrecognizedMethod(String::from(method)))?;

    let version = match httparse_req.version {
        Some(0) => Version::Http1_0,
        Some(1) => Version::Http1_1,
        Some(version) => return Err(Error::UnsupportedVersion(version)),
        None => return Err(Error::UnsupportedVersion(0)),
    };

    let mut request_headers = Headers::new();
    for header in httparse_req.headers.iter() {
        request_headers.insert(header.name, std::str::from_utf8(header.value)?);
    }

    log::trace!("parsed headers: {:#?}", &request_headers);
    let path = httparse_req.path.ok_or(Error::RequestPathMissing)?.to_owned();

    let mut request = Request {
        method,
        path,
        version,
        headers: request_headers,
        body: None,
        peer_addr: None,
        secure: false,
    };

    let body = read_body(transport, &mut leftover, &request, config).await?;
    request.body = body;
    *buffer = leftover;

    Ok(Some(request))
}

/// Whether the connection must be closed after responding to this
/// request, per its version and Connection header.
pub fn should_close(request: &Request) -> bool {
    match request.version {
        Version::Http1_0 => !request.header_contains_ignore_ascii_case("connection", "keep-alive"),
        _ => request.header_contains_ignore_ascii_case("connection", "close"),
    }
}

async fn read_head<T: Transport>(
    transport: &mut T,
    bytes: Vec<u8>,
    stopper: &Stopper,
    config: &HttpConfig,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = bytes;
    let mut len = buf.len();
    let searcher = Finder::new(b"\r\n\r\n");

    if len > 3 {
        // a pipelined head may already be complete
        if let Some(index) = searcher.find(&buf) {
            let body = buf.split_off(index + 4);
            return Ok(Some((buf, body)));
        }
    }

    loop {
        buf.extend(iter::repeat(0).take(100));
        let bytes = if len == 0 {
            match stopper.stop_future(transport.read(&mut buf[len..])).await {
                Some(read) => read?,
                None => return Ok(None),
            }
        } else {
            transport.read(&mut buf[len..]).await?
        };

        let search_start = len.max(3) - 3;
        let search = searcher.find(&buf[search_start..len + bytes]);

        if let Some(index) = search {
            buf.truncate(len + bytes);
            let body = buf.split_off(search_start + index + 4);
            return Ok(Some((buf, body)));
        }

        len += bytes;

        if bytes == 0 {
            if len == 0 {
                return Ok(None);
            }
            log::debug!(
                "disconnect? partial head content: {:?}",
                String::from_utf8_lossy(&buf[..len])
            );
            return Err(Error::PartialHead);
        }

        if len >= config.max_head_length {
            return Err(Error::HeadersTooLong);
        }
    }
}

async fn read_body<T: Transport>(
    transport: &mut T,
    leftover: &mut Vec<u8>,
    request: &Request,
    config: &HttpConfig,
) -> Result<Option<Vec<u8>>> {
    let chunked = request.header_contains_ignore_ascii_case(TRANSFER_ENCODING, "chunked");
    let content_length = request
        .headers
        .get(CONTENT_LENGTH)
        .map(|values| {
            values
                .as_str()
                .parse::<u64>()
                .map_err(|_| Error::MalformedHeader("content-length".into()))
        })
        .transpose()?;

    if chunked && content_length.is_some() {
        return Err(Error::UnexpectedHeader("content-length"));
    }

    if request.header_contains_ignore_ascii_case(EXPECT, "100-continue")
        && (chunked || content_length.unwrap_or_default() > 0)
    {
        log::trace!("sending 100-continue");
        transport.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }

    if chunked {
        read_chunked_body(transport, leftover, config).await.map(Some)
    } else {
        match content_length {
            None | Some(0) => Ok(None),
            Some(len) if len > config.max_request_body => Err(Error::ReceivedBodyTooLong(
                config.max_request_body,
            )),
            Some(len) => read_sized(transport, leftover, len as usize).await.map(Some),
        }
    }
}

async fn read_sized<T: Transport>(
    transport: &mut T,
    leftover: &mut Vec<u8>,
    len: usize,
) -> Result<Vec<u8>> {
    let mut body;
    if leftover.len() >= len {
        body = leftover.drain(..len).collect();
    } else {
        body = std::mem::take(leftover);
        let mut remaining = len - body.len();
        body.reserve(remaining);
        let mut chunk = [0u8; 4096];
        while remaining > 0 {
            let bytes = transport.read(&mut chunk[..remaining.min(4096)]).await?;
            if bytes == 0 {
                return Err(Error::Closed);
            }
            body.extend_from_slice(&chunk[..bytes]);
            remaining -= bytes;
        }
    }
    Ok(body)
}

async fn fill_more<T: Transport>(transport: &mut T, buf: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 4096];
    let bytes = transport.read(&mut chunk).await?;
    if bytes == 0 {
        return Err(Error::Closed);
    }
    buf.extend_from_slice(&chunk[..bytes]);
    Ok(())
}

async fn read_chunked_body<T: Transport>(
    transport: &mut T,
    leftover: &mut Vec<u8>,
    config: &HttpConfig,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let crlf = Finder::new(b"\r\n");

    loop {
        let line_end = loop {
            match crlf.find(leftover) {
                Some(index) => break index,
                None => fill_more(transport, leftover).await?,
            }
        };

        let size_line = std::str::from_utf8(&leftover[..line_end])?;
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or_default(), 16)
            .map_err(|_| Error::MalformedHeader("transfer-encoding".into()))?;
        leftover.drain(..line_end + 2);

        if size == 0 {
            // trailer-less termination: consume the final crlf
            while leftover.len() < 2 {
                fill_more(transport, leftover).await?;
            }
            leftover.drain(..2);
            return Ok(body);
        }

        if (body.len() + size) as u64 > config.max_request_body {
            return Err(Error::ReceivedBodyTooLong(config.max_request_body));
        }

        while leftover.len() < size + 2 {
            fill_more(transport, leftover).await?;
        }
        body.extend_from_slice(&leftover[..size]);
        leftover.drain(..size + 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::io::Cursor;

    fn receive(input: &str) -> Result<Option<Request>> {
        smol::block_on(async {
            let mut transport = Cursor::new(input.as_bytes().to_vec());
            let mut buffer = Vec::new();
            receive_request(
                &mut transport,
                &mut buffer,
                &Stopper::new(),
                &HttpConfig::default(),
            )
            .await
        })
    }

    #[test]
    fn parses_a_simple_get() {
        let request = receive("GET /hello?a=b HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.query(), "a=b");
        assert_eq!(request.host(), "example.com");
        assert!(request.body().is_none());
    }

    #[test]
    fn parses_a_sized_body() {
        let request = receive("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap()
            .unwrap();
        assert_eq!(request.body(), Some(&b"hello"[..]));
    }

    #[test]
    fn parses_a_chunked_body() {
        let request =
            receive("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\r\n")
                .unwrap()
                .unwrap();
        assert_eq!(request.body(), Some(&b"hello world"[..]));
    }

    #[test]
    fn clean_close_is_none() {
        assert!(receive("").unwrap().is_none());
    }

    #[test]
    fn connection_close_semantics() {
        let request = receive("GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(should_close(&request));

        let request = receive("GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert!(!should_close(&request));
    }
}
