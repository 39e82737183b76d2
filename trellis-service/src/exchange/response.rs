//! Streaming response writer
//!
//! The response head (status, headers, cookies) stays mutable until the
//! first body chunk is written. The first write commits the head to the
//! transport; from then on only body chunks flow, until [`Response::end`]
//! closes the stream.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::exchange::cookies::Cookie;

/// Committed response head handed to the transport
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: mpsc::Receiver<std::io::Result<Bytes>>,
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    capacity: usize,
    committed: bool,
    ended: bool,
}

/// The write half of an [`Exchange`](crate::exchange::Exchange)
pub struct Response {
    state: Mutex<ResponseState>,
}

/// Receiving side of a response, held by the transport
pub(crate) struct ResponseSink {
    pub(crate) head_rx: oneshot::Receiver<ResponseHead>,
}

impl Response {
    /// Create a response wired to a transport sink
    pub(crate) fn channel(capacity: usize) -> (Self, ResponseSink) {
        let (head_tx, head_rx) = oneshot::channel();
        let response = Self {
            state: Mutex::new(ResponseState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                cookies: Vec::new(),
                head_tx: Some(head_tx),
                body_tx: None,
                capacity,
                committed: false,
                ended: false,
            }),
        };
        (response, ResponseSink { head_rx })
    }

    /// Current status code
    pub fn status(&self) -> StatusCode {
        self.state.lock().expect("response lock poisoned").status
    }

    /// Set the status code; fails after the head is committed
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        let mut st = self.state.lock().expect("response lock poisoned");
        if st.committed {
            return Err(Error::ResponseCommitted);
        }
        st.status = status;
        Ok(())
    }

    /// Set a header, replacing previous values; fails after commit
    pub fn insert_header(&self, name: &str, value: &str) -> Result<()> {
        let mut st = self.state.lock().expect("response lock poisoned");
        if st.committed {
            return Err(Error::ResponseCommitted);
        }
        let name: HeaderName = name.parse().map_err(|_| {
            Error::bad_request(format!("invalid header name: {name}"))
        })?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::bad_request("invalid header value"))?;
        st.headers.insert(name, value);
        Ok(())
    }

    /// Append a header, preserving previous values; fails after commit
    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        let mut st = self.state.lock().expect("response lock poisoned");
        if st.committed {
            return Err(Error::ResponseCommitted);
        }
        let name: HeaderName = name.parse().map_err(|_| {
            Error::bad_request(format!("invalid header name: {name}"))
        })?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::bad_request("invalid header value"))?;
        st.headers.append(name, value);
        Ok(())
    }

    /// Queue a cookie, emitted as `Set-Cookie` at commit; fails after commit
    pub fn add_cookie(&self, cookie: Cookie) -> Result<()> {
        let mut st = self.state.lock().expect("response lock poisoned");
        if st.committed {
            return Err(Error::ResponseCommitted);
        }
        st.cookies.push(cookie);
        Ok(())
    }

    /// True once the head has been sent to the transport
    pub fn committed(&self) -> bool {
        self.state.lock().expect("response lock poisoned").committed
    }

    /// True once the body stream has been closed
    pub fn ended(&self) -> bool {
        self.state.lock().expect("response lock poisoned").ended
    }

    /// Write a body chunk, committing the head first if needed
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        let tx = {
            let mut st = self.state.lock().expect("response lock poisoned");
            if st.ended {
                return Err(Error::internal("write after response end"));
            }
            if !st.committed {
                commit(&mut st);
            }
            st.body_tx.clone().ok_or(Error::ClientDisconnected)?
        };
        tx.send(Ok(chunk.into()))
            .await
            .map_err(|_| Error::ClientDisconnected)
    }

    /// Commit the head (if needed) and close the body stream
    ///
    /// Idempotent; a handler returning without calling `end` is completed by
    /// the server.
    pub fn end(&self) {
        let mut st = self.state.lock().expect("response lock poisoned");
        if !st.committed {
            commit(&mut st);
        }
        st.body_tx = None;
        st.ended = true;
    }

    /// Write a complete plain-text response
    pub async fn send_text(&self, status: StatusCode, body: impl Into<String>) -> Result<()> {
        self.send_with_content_type(status, "text/plain; charset=utf-8", body.into().into())
            .await
    }

    /// Write a complete HTML response
    pub async fn send_html(&self, status: StatusCode, body: impl Into<String>) -> Result<()> {
        self.send_with_content_type(status, "text/html; charset=utf-8", body.into().into())
            .await
    }

    /// Serialize and write a complete JSON response
    pub async fn send_json<T: serde::Serialize>(&self, status: StatusCode, body: &T) -> Result<()> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::internal(format!("JSON serialization failed: {e}")))?;
        self.send_with_content_type(status, "application/json", bytes.into())
            .await
    }

    async fn send_with_content_type(
        &self,
        status: StatusCode,
        content_type: &str,
        body: Bytes,
    ) -> Result<()> {
        {
            let mut st = self.state.lock().expect("response lock poisoned");
            if st.committed {
                return Err(Error::ResponseCommitted);
            }
            st.status = status;
            if !st.headers.contains_key(http::header::CONTENT_TYPE) {
                st.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_str(content_type)
                        .expect("static content type is valid"),
                );
            }
        }
        if !body.is_empty() {
            self.write(body).await?;
        }
        self.end();
        Ok(())
    }

    /// Abort without closing the body cleanly; the transport observes a
    /// truncated stream
    pub(crate) fn abort(&self) {
        let mut st = self.state.lock().expect("response lock poisoned");
        if let Some(tx) = st.body_tx.take() {
            let _ = tx.try_send(Err(std::io::Error::other("response aborted")));
        }
        st.ended = true;
    }
}

fn commit(st: &mut ResponseState) {
    let (body_tx, body_rx) = mpsc::channel(st.capacity.max(1));
    let mut headers = st.headers.clone();
    for cookie in &st.cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie.to_header_value()) {
            headers.append(http::header::SET_COOKIE, value);
        }
    }

    let head = ResponseHead {
        status: st.status,
        headers,
        body: body_rx,
    };

    st.committed = true;
    if let Some(tx) = st.head_tx.take() {
        if tx.send(head).is_err() {
            // Transport already gone; writes will surface ClientDisconnected.
            st.body_tx = None;
            return;
        }
    }
    st.body_tx = Some(body_tx);
}

impl ResponseSink {
    /// Await the committed head
    pub(crate) async fn head(self) -> Option<ResponseHead> {
        self.head_rx.await.ok()
    }

    /// Collect status, headers, and the full body; test helper
    #[cfg(test)]
    pub(crate) async fn collect(self) -> Option<(StatusCode, HeaderMap, Bytes)> {
        use bytes::BytesMut;

        let mut head = self.head().await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = head.body.recv().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(_) => break,
            }
        }
        Some((head.status, head.headers, buf.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_text_commits_and_ends() {
        let (response, sink) = Response::channel(8);
        response
            .send_text(StatusCode::OK, "hello")
            .await
            .unwrap();
        assert!(response.committed());
        assert!(response.ended());

        let (status, headers, body) = sink.collect().await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(http::header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_status_frozen_after_commit() {
        let (response, _sink) = Response::channel(8);
        response.write("first").await.unwrap();
        let err = response.set_status(StatusCode::NOT_FOUND).unwrap_err();
        assert!(matches!(err, Error::ResponseCommitted));
    }

    #[tokio::test]
    async fn test_streaming_chunks_arrive_in_order() {
        let (response, sink) = Response::channel(8);
        let writer = tokio::spawn(async move {
            response.write("one,").await.unwrap();
            response.write("two,").await.unwrap();
            response.write("three").await.unwrap();
            response.end();
        });

        let (_, _, body) = sink.collect().await.unwrap();
        writer.await.unwrap();
        assert_eq!(body, Bytes::from("one,two,three"));
    }

    #[tokio::test]
    async fn test_cookies_emitted_at_commit() {
        let (response, sink) = Response::channel(8);
        response
            .add_cookie(Cookie::new("a", "1").with_path("/"))
            .unwrap();
        response.add_cookie(Cookie::new("b", "2")).unwrap();
        response.send_text(StatusCode::OK, "ok").await.unwrap();

        let (_, headers, _) = sink.collect().await.unwrap();
        let cookies: Vec<_> = headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1; Path=/", "b=2"]);
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let (response, _sink) = Response::channel(8);
        response.end();
        assert!(response.write("late").await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_client_gone() {
        let (response, sink) = Response::channel(8);
        drop(sink);
        let err = response.write("data").await.unwrap_err();
        assert!(matches!(err, Error::ClientDisconnected));
    }
}
