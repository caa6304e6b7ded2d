//! Request handler boundary
//!
//! The server never looks inside a handler. It gets one request and must
//! produce one response, whichever protocol the request arrived on. Both
//! connection drivers go through [`call`], so an `Err` or a panic becomes
//! the same generic 500 in HTTP/1.1 and HTTP/2.

use super::{Error, HttpRequest, HttpResponse, Result, Status};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Application logic invoked once per request
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Adapter turning a closure into a [`Handler`]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
{
    fn handle(&self, request: HttpRequest) -> Result<HttpResponse> {
        (self.f)(request)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
{
    Arc::new(HandlerFn { f })
}

/// Response sent when the handler fails
pub fn internal_error() -> HttpResponse {
    HttpResponse::text(Status::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
}

/// Run the handler, mapping failure to a 500 response
pub fn call(handler: &dyn Handler, request: HttpRequest) -> HttpResponse {
    let path = request.path().to_string();
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::warn!(%path, error = %err, "handler failed");
            internal_error()
        }
        Err(_) => {
            tracing::error!(%path, "handler panicked");
            internal_error()
        }
    }
}

/// Run the handler on its own thread, giving up after `timeout`
///
/// On expiry the caller gets a 500 and the handler thread is left to finish
/// on its own; its result is discarded.
pub fn call_with_deadline(
    handler: &Arc<dyn Handler>,
    request: HttpRequest,
    timeout: Duration,
) -> Result<HttpResponse> {
    let (tx, rx) = mpsc::channel();
    let handler = Arc::clone(handler);

    thread::Builder::new()
        .name("http-handler".to_string())
        .spawn(move || {
            let _ = tx.send(call(&*handler, request));
        })
        .map_err(Error::Io)?;

    match rx.recv_timeout(timeout) {
        Ok(response) => Ok(response),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(?timeout, "handler timed out");
            Ok(internal_error())
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Ok(internal_error()),
    }
}
