use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use trellis::{
    async_trait, handler, Application, BaseWriter, BoxFuture, Configuration, Context, Handler,
    Method, RouteInfo, StatusCode,
};
use trellis_http::{BoxedTransport, Request, Version};
use trellis_testing::{block_on, parse_response, TestTransport};

struct TestApp(Configuration);

#[async_trait]
impl Application for TestApp {
    fn configuration(&self) -> &Configuration {
        &self.0
    }

    async fn fire_error_code(&self, ctx: &mut Context) {
        let _ = ctx.write_string("fired").await;
    }

    async fn serve_http_c(&self, _ctx: &mut Context) {}

    fn route_exists(&self, _ctx: &mut Context, _method: Method, _path: &str) -> bool {
        false
    }

    fn route_info(&self, _name: &str) -> Option<RouteInfo> {
        None
    }
}

fn test_context_with(config: Configuration, request: Request) -> (Context, TestTransport) {
    let app = Arc::new(TestApp(config));
    let mut ctx = Context::new(app);
    let (client, server) = TestTransport::new();

    let mut writer = BaseWriter::new();
    writer.begin_response(
        BoxedTransport::new(server),
        request.version(),
        request.method() == Method::Head,
    );
    ctx.begin_request(writer, request);
    (ctx, client)
}

fn test_context() -> (Context, TestTransport) {
    test_context_with(
        Configuration::default(),
        Request::synthetic(Method::Get, "/", None),
    )
}

fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn Handler> {
    handler(move |_ctx: &mut Context| -> BoxFuture<'_, ()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    })
}

#[test]
fn next_walks_the_chain_in_order() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut chain = Vec::new();
        for index in 0..3 {
            let order = order.clone();
            chain.push(handler(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(index);
                    ctx.next().await;
                })
            }));
        }

        ctx.do_handlers(chain).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(ctx.handler_index(-1), 2);
    });
}

#[test]
fn stop_execution_halts_the_chain() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        let count = Arc::new(AtomicUsize::new(0));

        let chain = vec![
            handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
                Box::pin(async move {
                    ctx.stop_execution();
                    ctx.next().await; // ignored
                })
            }),
            counting(count.clone()),
        ];

        ctx.do_handlers(chain).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(ctx.is_stopped());
        assert_eq!(ctx.handler_index(-1), -1);
    });
}

#[test]
fn skip_advances_without_invoking() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        let skipped = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let chain = vec![
            {
                let ran = ran.clone();
                handler(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
                    let ran = ran.clone();
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        ctx.skip();
                        ctx.next().await;
                    })
                })
            },
            counting(skipped.clone()),
            counting(ran.clone()),
        ];

        ctx.do_handlers(chain).await;
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    });
}

#[test]
fn proceed_detects_next_calls() {
    block_on(async {
        let (mut ctx, _client) = test_context();

        let advancing = handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move { ctx.next().await })
        });
        let passive = handler(|_ctx: &mut Context| -> BoxFuture<'_, ()> { Box::pin(async {}) });

        // a chain long enough that next() can actually advance
        ctx.set_handlers(vec![passive.clone(), passive.clone(), passive.clone()]);

        assert!(ctx.proceed(&advancing).await);
        assert!(!ctx.proceed(&passive).await);
    });
}

#[test]
fn next_or_prefers_the_existing_chain() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        let alt = Arc::new(AtomicUsize::new(0));
        let next = Arc::new(AtomicUsize::new(0));

        ctx.set_handlers(vec![counting(Arc::new(AtomicUsize::new(0))), counting(next.clone())]);
        assert!(ctx.next_or(vec![counting(alt.clone())]).await);
        assert_eq!(next.load(Ordering::SeqCst), 1);
        assert_eq!(alt.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn next_or_runs_the_alternative_from_its_start() {
    block_on(async {
        // mid-chain, with the cursor past the end: the alternative
        // replaces the chain and runs from its own first handler,
        // the outer chain is abandoned
        let (mut ctx, _client) = test_context();
        let alt_first = Arc::new(AtomicUsize::new(0));

        ctx.set_handlers(vec![counting(Arc::new(AtomicUsize::new(0)))]);
        assert!(!ctx.next_or(vec![counting(alt_first.clone())]).await);
        assert_eq!(alt_first.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn next_or_with_no_alternative_is_not_found() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        ctx.set_handlers(vec![counting(Arc::new(AtomicUsize::new(0)))]);

        assert!(!ctx.next_or_not_found().await);
        assert_eq!(ctx.get_status_code(), StatusCode::NotFound);
        assert!(ctx.is_stopped());
    });
}

#[test]
fn begin_request_resets_recycled_state() {
    block_on(async {
        let (mut ctx, _client) = test_context();

        ctx.params_mut().set("id", "42");
        ctx.values_mut().set("key", String::from("value"));
        ctx.stop_execution();
        let _ = ctx.end_request().await;

        // recycle the same context for a second request
        let (client2, server2) = TestTransport::new();
        let mut writer = BaseWriter::new();
        writer.begin_response(BoxedTransport::new(server2), Version::Http1_1, false);
        ctx.begin_request(writer, Request::synthetic(Method::Get, "/second", None));
        drop(client2);

        assert!(ctx.params().is_empty());
        assert!(ctx.values().is_empty());
        assert!(!ctx.is_stopped());
        assert_eq!(ctx.handler_index(-1), 0);
        assert_eq!(ctx.path(), "/second");
    });
}

#[test]
fn end_request_fires_status_handler_only_when_nothing_written() {
    block_on(async {
        let (mut ctx, client) = test_context();
        ctx.status_code(StatusCode::InternalServerError);
        let _ = ctx.end_request().await;

        let response = parse_response(&client.received());
        assert_eq!(response.status, 500);
        assert_eq!(response.body_string(), "fired");
    });

    block_on(async {
        let (mut ctx, client) = test_context();
        let _ = ctx.write_string("already written").await;
        ctx.status_code(StatusCode::InternalServerError);
        let _ = ctx.end_request().await;

        let response = parse_response(&client.received());
        // the head was committed by the write, the late 500 never
        // reaches the wire and the handler does not fire
        assert_eq!(response.status, 200);
        assert_eq!(response.body_string(), "already written");
    });
}

#[test]
fn status_is_sent_exactly_once() {
    block_on(async {
        let (mut ctx, client) = test_context();
        ctx.status_code(StatusCode::Accepted);
        let _ = ctx.write_string("one").await;
        ctx.status_code(StatusCode::ImATeapot); // too late, recorded only
        let _ = ctx.write_string("two").await;
        let _ = ctx.end_request().await;

        let raw = client.received();
        assert!(raw.starts_with(b"HTTP/1.1 202 Accepted\r\n"));
        let later = &raw[1..];
        assert_eq!(
            later.windows(9).filter(|w| w == b"HTTP/1.1 ").count(),
            0,
            "a second status line reached the wire"
        );
    });
}

#[test]
fn redirect_status_selection() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        ctx.redirect("/elsewhere", None);
        assert_eq!(ctx.get_status_code(), StatusCode::Found);
        assert!(ctx.is_stopped());
    });

    block_on(async {
        let (mut ctx, _client) = test_context();
        ctx.status_code(StatusCode::MovedPermanently);
        ctx.redirect("/elsewhere", None);
        assert_eq!(ctx.get_status_code(), StatusCode::MovedPermanently);
    });

    block_on(async {
        let (mut ctx, _client) = test_context();
        ctx.redirect("/elsewhere", Some(StatusCode::TemporaryRedirect));
        assert_eq!(ctx.get_status_code(), StatusCode::TemporaryRedirect);
    });
}

#[test]
fn if_modified_since_policy() {
    use std::time::{Duration, SystemTime};

    let modtime = SystemTime::now();
    let header = httpdate_header(modtime);

    // same second: not modified
    let mut request = Request::synthetic(Method::Get, "/", None);
    request.headers_mut().insert("if-modified-since", header.as_str());
    let (ctx, _client) = test_context_with(Configuration::default(), request);
    assert_eq!(ctx.check_if_modified_since(modtime).unwrap(), false);

    // two seconds newer: modified
    let newer = modtime + Duration::from_secs(2);
    let mut request = Request::synthetic(Method::Get, "/", None);
    request.headers_mut().insert("if-modified-since", header.as_str());
    let (ctx, _client) = test_context_with(Configuration::default(), request);
    assert_eq!(ctx.check_if_modified_since(newer).unwrap(), true);

    // POST: the check does not apply
    let mut request = Request::synthetic(Method::Post, "/", None);
    request.headers_mut().insert("if-modified-since", header.as_str());
    let (ctx, _client) = test_context_with(Configuration::default(), request);
    assert!(ctx.check_if_modified_since(modtime).is_err());

    // no header: the check does not apply
    let (ctx, _client) = test_context();
    assert!(ctx.check_if_modified_since(modtime).is_err());
}

fn httpdate_header(time: std::time::SystemTime) -> String {
    // round-trip through the wire format to drop sub-second precision
    httpdate::fmt_http_date(time)
}

#[test]
fn write_not_modified_strips_entity_headers() {
    block_on(async {
        let (mut ctx, client) = test_context();
        ctx.content_type("text/html");
        ctx.header("content-length", "100");
        ctx.header("etag", "\"abc\"");
        ctx.set_last_modified(std::time::SystemTime::now());

        ctx.write_not_modified();
        let _ = ctx.end_request().await;

        let response = parse_response(&client.received());
        assert_eq!(response.status, 304);
        assert!(response.header("content-type").is_none());
        assert!(response.header("content-length").is_none());
        assert!(response.header("last-modified").is_none());
        assert!(response.header("etag").is_some());
        assert!(response.body.is_empty());
    });
}

#[test]
fn content_type_resolution() {
    block_on(async {
        let (mut ctx, _client) = test_context();

        ctx.content_type("style.css");
        assert_eq!(ctx.get_content_type(), Some("text/css; charset=utf-8"));

        ctx.content_type("application/json");
        assert_eq!(
            ctx.get_content_type(),
            Some("application/json; charset=utf-8")
        );

        ctx.content_type(trellis::CONTENT_BINARY);
        assert_eq!(ctx.get_content_type(), Some(trellis::CONTENT_BINARY));
    });
}

#[test]
fn user_values_do_not_leak_across_requests() {
    block_on(async {
        let (mut ctx, _client) = test_context();
        ctx.values_mut().set("shared", String::from("first request"));
        assert_eq!(ctx.values().get_string("shared"), Some("first request"));
        let _ = ctx.end_request().await;

        let (client2, server2) = TestTransport::new();
        let mut writer = BaseWriter::new();
        writer.begin_response(BoxedTransport::new(server2), Version::Http1_1, false);
        ctx.begin_request(writer, Request::synthetic(Method::Get, "/", None));
        drop(client2);

        assert_eq!(ctx.values().get_string("shared"), None);
    });
}

#[test]
fn body_reading_and_limits() {
    block_on(async {
        let request = Request::synthetic(Method::Post, "/", Some(b"0123456789".to_vec()));
        let (mut ctx, _client) = test_context_with(Configuration::default(), request);

        ctx.set_max_request_body_size(4);
        assert!(ctx.read_body().is_err());
    });

    block_on(async {
        let request = Request::synthetic(Method::Post, "/", Some(b"hello".to_vec()));
        let (mut ctx, _client) = test_context_with(Configuration::default(), request);

        assert_eq!(ctx.read_string().unwrap(), "hello");
        // consumed by default
        assert_eq!(ctx.read_string().unwrap(), "");
    });

    block_on(async {
        let request = Request::synthetic(Method::Post, "/", Some(b"hello".to_vec()));
        let config = Configuration::new().with_body_preserved_on_unmarshal();
        let (mut ctx, _client) = test_context_with(config, request);

        assert_eq!(ctx.read_string().unwrap(), "hello");
        assert_eq!(ctx.read_string().unwrap(), "hello");
    });
}

#[test]
fn unmarshal_body_prefers_the_decoder_capability() {
    struct Upper(String);
    impl trellis::BodyDecoder for Upper {
        fn decode(&mut self, body: &[u8]) -> Result<(), trellis::BoxedDecodeError> {
            self.0 = String::from_utf8_lossy(body).to_uppercase();
            Ok(())
        }
    }

    block_on(async {
        let request = Request::synthetic(Method::Post, "/", Some(b"hello".to_vec()));
        let (mut ctx, _client) = test_context_with(Configuration::default(), request);

        let mut out = Upper(String::new());
        ctx.unmarshal_body(&mut out).unwrap();
        assert_eq!(out.0, "HELLO");
    });

    block_on(async {
        let request = Request::synthetic(Method::Post, "/", Some(b"21".to_vec()));
        let (mut ctx, _client) = test_context_with(Configuration::default(), request);

        let doubled = ctx
            .unmarshal_body_with(|body| {
                std::str::from_utf8(body)
                    .map_err(|e| Box::new(e) as trellis::BoxedDecodeError)
                    .and_then(|s| {
                        s.parse::<i64>()
                            .map(|n| n * 2)
                            .map_err(|e| Box::new(e) as trellis::BoxedDecodeError)
                    })
            })
            .unwrap();
        assert_eq!(doubled, 42);
    });
}

#[test]
fn transactions_fold_back_into_the_response() {
    block_on(async {
        let (mut ctx, client) = test_context();

        ctx.begin_transaction(
            |ctx: &mut Context| -> BoxFuture<'_, Result<(), trellis::FrameworkError>> {
                Box::pin(async move {
                    let _ = ctx.write_string("committed").await;
                    Ok(())
                })
            },
        )
        .await;

        assert!(!ctx.is_recording());
        let _ = ctx.end_request().await;
        let response = parse_response(&client.received());
        assert_eq!(response.body_string(), "committed");
    });
}

#[test]
fn failed_transactions_roll_back() {
    block_on(async {
        let (mut ctx, client) = test_context();

        ctx.begin_transaction(
            |ctx: &mut Context| -> BoxFuture<'_, Result<(), trellis::FrameworkError>> {
                Box::pin(async move {
                    let _ = ctx.write_string("should never be seen").await;
                    Err(trellis::FrameworkError::new("out of stock"))
                })
            },
        )
        .await;

        let _ = ctx.end_request().await;
        let response = parse_response(&client.received());
        assert_eq!(response.status, 500);
        assert_eq!(response.body_string(), "out of stock");
    });
}

#[test]
fn transaction_panic_is_recovered() {
    block_on(async {
        let (mut ctx, client) = test_context();

        ctx.begin_transaction(
            |_ctx: &mut Context| -> BoxFuture<'_, Result<(), trellis::FrameworkError>> {
                Box::pin(async move {
                    panic!("boom");
                })
            },
        )
        .await;

        // the outer request continues
        let _ = ctx.write_string(" and on").await;
        let _ = ctx.end_request().await;

        let response = parse_response(&client.received());
        assert_eq!(response.status, 500);
    });
}

#[test]
fn skip_transactions_short_circuits() {
    block_on(async {
        let (mut ctx, client) = test_context();
        ctx.skip_transactions();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            ctx.begin_transaction(
                move |_ctx: &mut Context| -> BoxFuture<'_, Result<(), trellis::FrameworkError>> {
                    let ran = ran.clone();
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                },
            )
            .await;
        }

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let _ = ctx.end_request().await;
        drop(client);
    });
}

#[test]
fn on_close_fires_exactly_once_per_request() {
    block_on(async {
        let (mut ctx, client) = test_context();
        let fired = Arc::new(AtomicUsize::new(0));
        let replaced = Arc::new(AtomicUsize::new(0));

        {
            let replaced = replaced.clone();
            ctx.on_close(move || {
                replaced.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let fired = fired.clone();
            // last writer wins the pre-flush slot
            ctx.on_close(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let _ = ctx.end_request().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(replaced.load(Ordering::SeqCst), 0);
        drop(client);
    });
}

#[test]
fn stream_writer_flushes_each_chunk() {
    block_on(async {
        let (mut ctx, client) = test_context();
        let mut remaining = 3;

        ctx.stream_writer(|buf| {
            buf.extend_from_slice(b"chunk;");
            remaining -= 1;
            remaining > 0
        })
        .await
        .unwrap();

        let _ = ctx.end_request().await;
        let response = parse_response(&client.received());
        assert_eq!(response.body_string(), "chunk;chunk;chunk;");
    });
}

#[test]
fn recorder_resets_are_invisible_until_flush() {
    block_on(async {
        let (mut ctx, client) = test_context();

        ctx.record();
        let _ = ctx.write_string("draft one").await;
        if let Some(recorder) = ctx.recorder() {
            recorder.reset_body();
        }
        let _ = ctx.write_string("final").await;
        let _ = ctx.end_request().await;

        let response = parse_response(&client.received());
        assert_eq!(response.body_string(), "final");
    });
}

#[test]
fn exec_restores_request_state() {
    block_on(async {
        // the stub application's serve_http_c is a no-op, so this
        // exercises only the snapshot/restore mechanics
        let (mut ctx, _client) = test_context();
        ctx.set_handlers(vec![counting(Arc::new(AtomicUsize::new(0)))]);
        let _ = ctx.handler_index(0);

        ctx.exec(Method::Post, "/inner?x=1").await;

        assert_eq!(ctx.method(), Method::Get);
        assert_eq!(ctx.path(), "/");
        assert_eq!(ctx.handlers().len(), 1);
        assert_eq!(ctx.handler_index(-1), 0);
    });
}
