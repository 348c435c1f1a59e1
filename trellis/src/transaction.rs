use crate::{handler::BoxFuture, Context, FrameworkError, ResponseWriter, StatusCode};
use futures_lite::FutureExt;
use std::panic::AssertUnwindSafe;

impl Context {
    /**
    Run `pipe` as a scoped response transaction.

    For the duration of the pipe the context's writer is a recorder,
    so everything the pipe produces is buffered. The pipe's result
    decides what happens to that buffer:

    * `Ok(())` commits: the recorded status, headers and body are
      written back into the writer that was active before the
      transaction began;
    * `Err(..)` rolls back: the recorded response is discarded and
      replaced by a 500 carrying the error's message;
    * a panic inside the pipe is recovered and logged, and completes
      the transaction as failed; the outer request continues.

    A context that called [`Context::skip_transactions`] short-circuits
    immediately, without running the pipe.

    ```no_run
    # async fn example(ctx: &mut trellis::Context) {
    use trellis::{BoxFuture, Context, FrameworkError};

    ctx.begin_transaction(|ctx: &mut Context| -> BoxFuture<'_, Result<(), FrameworkError>> {
        Box::pin(async move {
            let _ = ctx.write_string("all or nothing").await;
            Ok(())
        })
    })
    .await;
    # }
    ```
    */
    pub async fn begin_transaction<F>(&mut self, pipe: F)
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<(), FrameworkError>>,
    {
        if self.transactions_skipped() {
            return;
        }

        let was_recording = self.is_recording();
        self.record();

        let outcome = AssertUnwindSafe(pipe(self)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                log::warn!("transaction failed: {}", error);
                self.fail_transaction(Some(&error));
            }
            Err(_panic) => {
                log::warn!("transaction interrupted, recovered from panic");
                self.fail_transaction(None);
            }
        }

        // fold our recorder back into the writer that was active
        // before the transaction began; a caller that was already
        // recording keeps the content in its own recorder instead
        if !was_recording {
            if let Some(ResponseWriter::Recorder(recorder)) = self.take_writer() {
                let (inner, status, headers, body) = recorder.into_parts();
                if let Some(mut outer) = inner {
                    outer.write_header(status);
                    *outer.headers_mut() = headers;
                    if !body.is_empty() {
                        if let Err(error) = outer.write(&body).await {
                            log::debug!("transaction replay: {:?}", error);
                        }
                    }
                    self.reset_response_writer(outer);
                }
            }
        }
    }

    fn fail_transaction(&mut self, error: Option<&FrameworkError>) {
        if let Some(recorder) = self.writer_mut().recorder_mut() {
            recorder.reset_body();
            recorder.clear_headers();
            recorder.set_status(StatusCode::InternalServerError);
            if let Some(error) = error {
                recorder.write(error.to_string().as_bytes());
            }
        }
    }
}
