//! User callbacks and middleware
//!
//! Every user-supplied function runs behind [`guarded`], which catches panics
//! so a faulty handler never tears down the control connection.

use crate::TunnelError;
use outray_proto::{IncomingRequest, OutgoingResponse};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Called with the public URL once the relay has opened the tunnel
pub type OpenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Produces a response for a forwarded HTTP request
pub type RequestHandler = Arc<dyn Fn(IncomingRequest) -> OutgoingResponse + Send + Sync>;

/// Receives every non-fatal error and every reconnect-triggering failure
pub type ErrorCallback = Arc<dyn Fn(&TunnelError) + Send + Sync>;

/// Runs before the handler or local proxy; returning a response short-circuits
pub type RequestMiddleware =
    Arc<dyn Fn(&mut IncomingRequest) -> Option<OutgoingResponse> + Send + Sync>;

/// Runs after a response is produced and may rewrite it in place
pub type ResponseMiddleware = Arc<dyn Fn(&IncomingRequest, &mut OutgoingResponse) + Send + Sync>;

/// Registered callbacks and middleware
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_open: Option<OpenCallback>,
    pub(crate) on_request: Option<RequestHandler>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) request_middleware: Vec<RequestMiddleware>,
    pub(crate) response_middleware: Vec<ResponseMiddleware>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_request", &self.on_request.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("request_middleware", &self.request_middleware.len())
            .field("response_middleware", &self.response_middleware.len())
            .finish()
    }
}

impl Callbacks {
    pub fn has_request_handler(&self) -> bool {
        self.on_request.is_some()
    }

    pub fn notify_open(&self, url: &str) {
        if let Some(on_open) = &self.on_open {
            let _ = guarded("on_open", || on_open(url));
        }
    }

    pub fn notify_error(&self, err: &TunnelError) {
        if let Some(on_error) = &self.on_error {
            let _ = guarded("on_error", || on_error(err));
        }
    }

    /// Invoke the user request handler, if one is registered
    pub fn handle_request(
        &self,
        request: IncomingRequest,
    ) -> Option<Result<OutgoingResponse, TunnelError>> {
        self.on_request
            .as_ref()
            .map(|handler| guarded("on_request", || handler(request)))
    }

    /// Run request middleware in registration order.
    ///
    /// The first middleware to return a response wins and the rest are skipped.
    /// A panicking middleware is logged and treated as if it passed the request on.
    pub fn apply_request_middleware(
        &self,
        request: &mut IncomingRequest,
    ) -> Option<OutgoingResponse> {
        for middleware in &self.request_middleware {
            if let Ok(Some(response)) = guarded("request_middleware", || middleware(request)) {
                return Some(response);
            }
        }
        None
    }

    pub fn apply_response_middleware(
        &self,
        request: &IncomingRequest,
        response: &mut OutgoingResponse,
    ) {
        for middleware in &self.response_middleware {
            let _ = guarded("response_middleware", || middleware(request, response));
        }
    }
}

/// Run a user callback, converting a panic into a logged error
pub fn guarded<T>(name: &str, f: impl FnOnce() -> T) -> Result<T, TunnelError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let message = panic_message(panic.as_ref());
        error!(callback = name, "Panic in callback: {}", message);
        TunnelError::HandlerPanic(message)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn request(path: &str) -> IncomingRequest {
        IncomingRequest {
            request_id: "1".to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_guarded_catches_panic() {
        let result: Result<(), _> = guarded("test", || panic!("boom"));
        match result {
            Err(TunnelError::HandlerPanic(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Expected HandlerPanic, got {:?}", other),
        }

        let formatted: Result<(), _> = guarded("test", || panic!("code {}", 7));
        assert!(matches!(formatted, Err(TunnelError::HandlerPanic(m)) if m == "code 7"));
    }

    #[test]
    fn test_guarded_passes_value_through() {
        assert_eq!(guarded("test", || 41 + 1).unwrap(), 42);
    }

    #[test]
    fn test_panicking_open_callback_is_contained() {
        let callbacks = Callbacks {
            on_open: Some(Arc::new(|_url: &str| panic!("user bug"))),
            ..Default::default()
        };
        callbacks.notify_open("https://abc.outray.app");
    }

    #[test]
    fn test_error_callback_receives_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = Callbacks {
            on_error: Some(Arc::new(move |err: &TunnelError| {
                sink.lock().unwrap().push(err.to_string());
            })),
            ..Default::default()
        };

        callbacks.notify_error(&TunnelError::Relay("quota exceeded".to_string()));
        assert_eq!(*seen.lock().unwrap(), vec!["Relay error: quota exceeded"]);
    }

    #[test]
    fn test_request_middleware_short_circuits() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();
        let callbacks = Callbacks {
            request_middleware: vec![
                Arc::new(|req: &mut IncomingRequest| -> Option<OutgoingResponse> {
                    req.headers.insert("X-Seen".to_string(), "1".to_string());
                    None
                }) as RequestMiddleware,
                Arc::new(|req: &mut IncomingRequest| {
                    (req.path == "/blocked").then(|| OutgoingResponse::text(403, "forbidden"))
                }),
                Arc::new(move |_req: &mut IncomingRequest| -> Option<OutgoingResponse> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }),
            ],
            ..Default::default()
        };

        let mut blocked = request("/blocked");
        let early = callbacks.apply_request_middleware(&mut blocked).unwrap();
        assert_eq!(early.status_code, 403);
        assert_eq!(blocked.header("x-seen"), Some("1"));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        let mut allowed = request("/ok");
        assert!(callbacks.apply_request_middleware(&mut allowed).is_none());
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_middleware_is_skipped() {
        let callbacks = Callbacks {
            request_middleware: vec![Arc::new(|_req: &mut IncomingRequest| -> Option<OutgoingResponse> {
                panic!("bad mw")
            })],
            response_middleware: vec![
                Arc::new(|_req: &IncomingRequest, _resp: &mut OutgoingResponse| panic!("bad"))
                    as ResponseMiddleware,
                Arc::new(|_req: &IncomingRequest, resp: &mut OutgoingResponse| {
                    resp.headers.insert("X-Powered-By".to_string(), "outray".to_string());
                }),
            ],
            ..Default::default()
        };

        let mut req = request("/");
        assert!(callbacks.apply_request_middleware(&mut req).is_none());

        let mut response = OutgoingResponse::new(200);
        callbacks.apply_response_middleware(&req, &mut response);
        assert_eq!(response.headers.get("X-Powered-By").map(String::as_str), Some("outray"));
    }

    #[test]
    fn test_request_handler_panic_is_reported() {
        let callbacks = Callbacks {
            on_request: Some(Arc::new(|_req: IncomingRequest| -> OutgoingResponse {
                panic!("handler exploded")
            })),
            ..Default::default()
        };

        let result = callbacks.handle_request(request("/")).unwrap();
        assert!(matches!(result, Err(TunnelError::HandlerPanic(_))));
    }
}
