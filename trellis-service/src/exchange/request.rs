//! Read-only request view with a streamable body

use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http::{request::Parts, HeaderMap, Method, Uri, Version};
use http_body_util::{BodyExt, BodyStream};

use crate::error::{Error, Result};
use crate::exchange::cookies::parse_cookie_header;
use crate::negotiation;

enum BodyKind {
    Incoming(hyper::body::Incoming),
    Full(Bytes),
    Taken,
}

/// The request half of an [`Exchange`](crate::exchange::Exchange)
///
/// Headers and the request line are immutable. The body may be consumed
/// exactly once, either buffered ([`Request::body_bytes`]) or as a chunk
/// stream ([`Request::body_stream`]).
pub struct Request {
    head: Parts,
    body: Mutex<BodyKind>,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Wrap a hyper request as received by the server
    pub(crate) fn from_hyper(
        req: http::Request<hyper::body::Incoming>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (head, body) = req.into_parts();
        Self {
            head,
            body: Mutex::new(BodyKind::Incoming(body)),
            remote_addr,
        }
    }

    /// Build a request from an in-memory body
    ///
    /// Intended for handler tests and synthetic exchanges.
    pub fn from_http(req: http::Request<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        let (head, body) = req.into_parts();
        Self {
            head,
            body: Mutex::new(BodyKind::Full(body)),
            remote_addr,
        }
    }

    /// Request method
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Full request URI
    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    /// Request path
    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    /// Raw query string, without the leading `?`
    pub fn query(&self) -> Option<&str> {
        self.head.uri.query()
    }

    /// HTTP version
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// All request headers, ordered and multi-value preserving
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// First value of a header, when it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values of a header, skipping non-UTF-8 entries
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.head
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// `Content-Type` header value
    pub fn content_type(&self) -> Option<&str> {
        self.header(http::header::CONTENT_TYPE.as_str())
    }

    /// Cookies parsed from the `Cookie` header
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.header(http::header::COOKIE.as_str())
            .map(parse_cookie_header)
            .unwrap_or_default()
    }

    /// Value of a single cookie
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Pick the best media type among `offered` for this request's `Accept`
    ///
    /// Absent `Accept` means the first offer wins.
    pub fn negotiate<'a>(&self, offered: &[&'a str]) -> Option<&'a str> {
        match self.header(http::header::ACCEPT.as_str()) {
            Some(accept) => negotiation::negotiate(accept, offered),
            None => offered.first().copied(),
        }
    }

    /// Peer address of the underlying connection
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Client IP as a string, for forwarding headers
    pub fn client_ip(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }

    /// Buffer the entire body
    ///
    /// Fails if the body was already consumed.
    pub async fn body_bytes(&self) -> Result<Bytes> {
        match self.take_body()? {
            BodyKind::Full(bytes) => Ok(bytes),
            BodyKind::Incoming(body) => body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| Error::BadRequest(format!("failed to read request body: {e}"))),
            BodyKind::Taken => unreachable!("take_body rejects consumed bodies"),
        }
    }

    /// Consume the body as a stream of chunks
    ///
    /// Fails if the body was already consumed.
    pub fn body_stream(&self) -> Result<BoxStream<'static, std::io::Result<Bytes>>> {
        match self.take_body()? {
            BodyKind::Full(bytes) => {
                if bytes.is_empty() {
                    Ok(stream::empty().boxed())
                } else {
                    Ok(stream::once(async move { Ok(bytes) }).boxed())
                }
            }
            BodyKind::Incoming(body) => Ok(BodyStream::new(body)
                .filter_map(|frame| async move {
                    match frame {
                        Ok(frame) => frame.into_data().ok().map(Ok),
                        Err(e) => Some(Err(std::io::Error::other(e))),
                    }
                })
                .boxed()),
            BodyKind::Taken => unreachable!("take_body rejects consumed bodies"),
        }
    }

    /// Declared body size from `Content-Length`, when present
    pub fn content_length(&self) -> Option<u64> {
        self.header(http::header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
    }

    fn take_body(&self) -> Result<BodyKind> {
        let mut guard = self.body.lock().expect("request body lock poisoned");
        match std::mem::replace(&mut *guard, BodyKind::Taken) {
            BodyKind::Taken => Err(Error::bad_request("request body already consumed")),
            other => Ok(other),
        }
    }
}
