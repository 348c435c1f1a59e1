use async_compression::futures::bufread::GzipDecoder;
use futures_lite::{io::Cursor, AsyncReadExt};
use std::sync::Arc;
use trellis::{handler, BoxFuture, Context, Handler, StatusCode};
use trellis_http::{BoxedTransport, HttpService};
use trellis_router::App;
use trellis_testing::{block_on, get, parse_response, run_service, TestTransport};

fn failing_with(status: StatusCode) -> Arc<dyn Handler> {
    handler(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        Box::pin(async move {
            ctx.status_code(status);
        })
    })
}

#[test]
fn status_code_recovery_when_nothing_was_written() {
    let app = App::new();
    app.get("/fail", vec![failing_with(StatusCode::InternalServerError)])
        .unwrap();
    app.on_error_code(
        StatusCode::InternalServerError,
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let _ = ctx.write_string("Internal Server Error").await;
            })
        })],
    );
    app.build().unwrap();

    let response = run_service(&app, get("/fail"));
    assert_eq!(response.status, 500);
    assert_eq!(response.body_string(), "Internal Server Error");
}

#[test]
fn status_handler_skipped_after_body_bytes() {
    let app = App::new();
    app.get(
        "/fail-late",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let _ = ctx.write_string("partial output").await;
                ctx.status_code(StatusCode::InternalServerError);
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    let response = run_service(&app, get("/fail-late"));
    // the head was already committed with 200, the handler stays out
    assert_eq!(response.status, 200);
    assert_eq!(response.body_string(), "partial output");
}

#[test]
fn status_handler_resets_a_recording_response() {
    let app = App::new();
    app.get(
        "/recorded",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                ctx.record();
                let _ = ctx.write_string("half-finished page").await;
                ctx.header("x-page", "yes");
                ctx.status_code(StatusCode::NotFound);
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    let response = run_service(&app, get("/recorded"));
    assert_eq!(response.status, 404);
    // the recorded body and headers were rolled back before the
    // not-found chain ran
    assert_eq!(response.body_string(), "Not Found");
    assert!(response.header("x-page").is_none());
}

#[test]
fn default_registry_answers_404_and_405_and_500() {
    let app = App::new();
    app.get("/boom", vec![failing_with(StatusCode::InternalServerError)])
        .unwrap();
    app.build().unwrap();

    let response = run_service(&app, get("/nowhere"));
    assert_eq!(response.status, 404);
    assert_eq!(response.body_string(), "Not Found");

    let response = run_service(&app, get("/boom"));
    assert_eq!(response.status, 500);
    assert_eq!(response.body_string(), "Internal Server Error");
}

#[test]
fn gzip_round_trip() {
    let app = App::new();
    app.get(
        "/compressed",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                ctx.gzip(true);
                let payload = vec![b'x'; 1000];
                let _ = ctx.write(&payload).await;
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    let mut request = get("/compressed");
    request.headers_mut().insert("accept-encoding", "gzip");

    let response = run_service(&app, request);
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-encoding"), Some("gzip"));
    assert_eq!(response.header("vary"), Some("accept-encoding"));
    assert!(response.header("content-length").is_none());

    let decompressed = block_on(async {
        let mut decoder = GzipDecoder::new(Cursor::new(response.body.clone()));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        out
    });
    assert_eq!(decompressed, vec![b'x'; 1000]);
}

#[test]
fn gzip_is_not_applied_without_client_support() {
    let app = App::new();
    app.get(
        "/maybe-compressed",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                ctx.gzip(true);
                let _ = ctx.write_string("plain text").await;
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    let response = run_service(&app, get("/maybe-compressed"));
    assert!(response.header("content-encoding").is_none());
    assert_eq!(response.body_string(), "plain text");
}

#[test]
fn gzip_error_recovery_disables_compression() {
    let app = App::new();
    app.get(
        "/compressed-error",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                ctx.gzip(true);
                let _ = ctx.write_string("buffered but doomed").await;
                ctx.status_code(StatusCode::InternalServerError);
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    let mut request = get("/compressed-error");
    request.headers_mut().insert("accept-encoding", "gzip");

    let response = run_service(&app, request);
    assert_eq!(response.status, 500);
    // the error body arrives in plain form
    assert!(response.header("content-encoding").is_none());
    assert_eq!(response.body_string(), "Internal Server Error");
}

#[test]
fn status_line_reaches_the_wire_exactly_once() {
    let app = App::new();
    app.get(
        "/twice",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                ctx.status_code(StatusCode::Accepted);
                let _ = ctx.write_string("first write ").await;
                ctx.status_code(StatusCode::ImATeapot);
                let _ = ctx.write_string("second write").await;
            })
        })],
    )
    .unwrap();
    app.build().unwrap();

    block_on(async {
        let (client, server) = TestTransport::new();
        let _ = app
            .call(BoxedTransport::new(server), get("/twice"))
            .await;

        let raw = client.received();
        assert!(raw.starts_with(b"HTTP/1.1 202 Accepted\r\n"));
        assert_eq!(
            raw[1..].windows(9).filter(|w| w == b"HTTP/1.1 ").count(),
            0
        );

        let response = parse_response(&raw);
        assert_eq!(response.body_string(), "first write second write");
    });
}
