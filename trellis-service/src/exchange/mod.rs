//! Exchange: one request, its in-progress response, and per-request state

mod attributes;
mod cookies;
mod request;
mod response;

pub use attributes::{AttrKey, Attributes};
pub use cookies::{parse_cookie_header, Cookie, SameSite};
pub use request::Request;
pub use response::Response;

pub(crate) use response::{ResponseHead, ResponseSink};

use tokio_util::sync::CancellationToken;

/// Bundle of a single HTTP request, its streaming response, typed
/// per-request attributes, and a cancellation signal
///
/// Created by the server per request and dropped after the response ends.
/// Handlers receive it as `Arc<Exchange>`; the attribute bag and response
/// writer take `&self` throughout.
pub struct Exchange {
    request: Request,
    response: Response,
    attributes: Attributes,
    cancellation: CancellationToken,
}

impl Exchange {
    pub(crate) fn new(
        request: Request,
        response: Response,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            request,
            response,
            attributes: Attributes::new(),
            cancellation,
        }
    }

    /// The read-only request view
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The streaming response writer
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The typed attribute bag
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Per-request cancellation signal; fires when the client goes away
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// True once the request has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
