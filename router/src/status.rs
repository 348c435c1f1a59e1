use http_types::StatusCode;
use std::sync::Arc;
use trellis::{handler, status_code_not_successful, BoxFuture, Context, Handler, Handlers};

/**
The handler chain registered for one error status code.

`fire` resets whatever the response writer buffered so far (recording
and gzip layers can roll back; the base writer cannot once body bytes
left), then runs the chain from the top of a fresh cursor.
*/
pub struct ErrorCodeHandler {
    /// the status code this chain answers for
    pub status_code: StatusCode,
    handlers: Handlers,
}

impl std::fmt::Debug for ErrorCodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCodeHandler")
            .field("status_code", &self.status_code)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ErrorCodeHandler {
    /// Execute this error handler chain against the context, resetting
    /// any resettable response state first.
    pub async fn fire(&self, ctx: &mut Context) {
        if ctx.is_recording() {
            if let Some(recorder) = ctx.writer_mut().recorder_mut() {
                if !status_code_not_successful(recorder.status()) {
                    // not an error status yet, force ours
                    recorder.set_status(self.status_code);
                }
                recorder.clear_headers();
                recorder.reset_body();
            }
        } else if let Some(gzip) = ctx.writer_mut().gzip_mut() {
            // roll the compression back so the error renders in the
            // expected plain form
            gzip.reset_body();
            gzip.disable();
        } else if ctx.writer().written() > 0 {
            // body bytes are on the wire, nothing to recover
            return;
        }

        // reset the cursor so earlier Next/StopExecution calls do not
        // leak in, and override the chain; the route's done handlers
        // are intentionally not re-run
        ctx.handler_index(0);
        ctx.do_handlers(self.handlers.clone()).await;
    }

    fn update_handlers(&mut self, handlers: Handlers) {
        self.handlers = handlers;
    }
}

fn status_text(status: StatusCode) -> Arc<dyn Handler> {
    handler(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = ctx.write_string(status.canonical_reason()).await;
        })
    })
}

/**
The registry mapping error status codes to handler chains. Seeded with
the canonical-text chains for 404, 405 and 500; anything else is
registered on the fly when it first fires.
*/
#[derive(Debug)]
pub struct ErrorCodeHandlers {
    handlers: Vec<ErrorCodeHandler>,
}

impl Default for ErrorCodeHandlers {
    fn default() -> Self {
        let mut registry = Self {
            handlers: Vec::new(),
        };
        for status in [
            StatusCode::NotFound,
            StatusCode::MethodNotAllowed,
            StatusCode::InternalServerError,
        ] {
            registry.register(status, vec![status_text(status)]);
        }
        registry
    }
}

impl ErrorCodeHandlers {
    /// Construct the registry with its default chains.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handler registered for `status`, if any.
    pub fn get(&self, status: StatusCode) -> Option<&ErrorCodeHandler> {
        self.handlers
            .iter()
            .find(|entry| entry.status_code == status)
    }

    /**
    Register a handler chain for an error status code. Successful
    codes are rejected. Registering again replaces the chain.
    */
    pub fn register(&mut self, status: StatusCode, handlers: Handlers) -> bool {
        if !status_code_not_successful(status) {
            return false;
        }

        match self
            .handlers
            .iter_mut()
            .find(|entry| entry.status_code == status)
        {
            Some(existing) => existing.update_handlers(handlers),
            None => self.handlers.push(ErrorCodeHandler {
                status_code: status,
                handlers,
            }),
        }
        true
    }

    /// The chain to fire for `status`, registering the canonical-text
    /// default on the fly when none exists yet.
    pub fn chain_for(&mut self, status: StatusCode) -> Option<(StatusCode, Handlers)> {
        if !status_code_not_successful(status) {
            return None;
        }

        if self.get(status).is_none() {
            self.register(status, vec![status_text(status)]);
        }

        self.get(status)
            .map(|entry| (entry.status_code, entry.handlers.clone()))
    }
}

/// Fire the chain for an error status against the context, with the
/// same reset semantics as [`ErrorCodeHandler::fire`].
pub async fn fire_status_handler(ctx: &mut Context, status: StatusCode, handlers: Handlers) {
    let entry = ErrorCodeHandler {
        status_code: status,
        handlers,
    };
    entry.fire(ctx).await;
}
