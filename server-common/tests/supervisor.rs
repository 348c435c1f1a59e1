use async_net::TcpStream;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use trellis::{handler, BoxFuture, Context};
use trellis_http::Error;
use trellis_router::App;
use trellis_server_common::{Supervisor, SERVER_CLOSED};

fn test_app() -> App {
    let app = App::new();
    app.get(
        "/ping",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let _ = ctx.write_string("pong").await;
            })
        })],
    )
    .unwrap();
    app.build().unwrap();
    app
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn graceful_shutdown_fires_hooks_once_and_filters_server_closed() {
    smol::block_on(async {
        let app = test_app();
        let supervisor = Arc::new(Supervisor::new("127.0.0.1:0", Arc::new(app)));
        supervisor.ignore_error(SERVER_CLOSED);

        let served = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        {
            let served = served.clone();
            supervisor.register_on_serve(move |_host| {
                served.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..3 {
            let shutdowns = shutdowns.clone();
            supervisor.register_on_shutdown(move || {
                shutdowns.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let errors = errors.clone();
            supervisor.register_on_error(move |_error| {
                errors.fetch_add(1, Ordering::SeqCst);
            });
        }

        let listener = supervisor.server().bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serve_task = {
            let supervisor = supervisor.clone();
            smol::spawn(async move { supervisor.serve(listener).await })
        };

        // the server answers while running
        let response = http_get(addr, "/ping").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("pong"));

        supervisor.shutdown(Some(Duration::from_secs(5))).await;
        assert!(supervisor.closed_manually());

        // serve returns success because "server closed" is ignored
        assert!(serve_task.await.is_ok());

        // the hooks had their own tasks, give them a beat
        smol::Timer::after(Duration::from_millis(100)).await;
        assert_eq!(served.load(Ordering::SeqCst), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn unfiltered_errors_reach_on_error_hooks() {
    smol::block_on(async {
        let app = test_app();
        let supervisor = Arc::new(Supervisor::new("127.0.0.1:0", Arc::new(app)));
        // note: SERVER_CLOSED is not ignored here

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            supervisor.register_on_error(move |error| {
                assert_eq!(error.to_string(), SERVER_CLOSED);
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let listener = supervisor.server().bind().await.unwrap();
        let serve_task = {
            let supervisor = supervisor.clone();
            smol::spawn(async move { supervisor.serve(listener).await })
        };

        supervisor.shutdown(None).await;
        assert!(serve_task.await.is_err());

        smol::Timer::after(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn defer_flow_blocks_until_restore() {
    smol::block_on(async {
        let supervisor = Arc::new(Supervisor::new(
            "127.0.0.1:0",
            Arc::new(test_app()),
        ));
        supervisor.defer_flow();

        let supervise_task = {
            let supervisor = supervisor.clone();
            smol::spawn(async move {
                supervisor
                    .supervise(async {
                        Err::<(), Error>(Error::Closed)
                    })
                    .await
            })
        };

        // the inner serve has returned, but the supervised serve is
        // gated on restore_flow
        smol::Timer::after(Duration::from_millis(100)).await;
        assert!(!supervise_task.is_finished());

        supervisor.restore_flow();
        let result = supervise_task.await;
        assert_eq!(result.unwrap_err().to_string(), Error::Closed.to_string());
    });
}

#[test]
fn restore_flow_without_defer_is_a_no_op() {
    smol::block_on(async {
        let supervisor = Supervisor::new("127.0.0.1:0", Arc::new(test_app()));
        supervisor.restore_flow();

        // an undeferred supervise returns immediately
        let result = supervisor.supervise(async { Ok(()) }).await;
        assert!(result.is_ok());
    });
}

#[test]
fn keep_alive_serves_multiple_requests_per_connection() {
    smol::block_on(async {
        let app = test_app();
        let supervisor = Arc::new(Supervisor::new("127.0.0.1:0", Arc::new(app)));
        supervisor.ignore_error(SERVER_CLOSED);

        let listener = supervisor.server().bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_task = {
            let supervisor = supervisor.clone();
            smol::spawn(async move { supervisor.serve(listener).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..3 {
            stream
                .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();

            let mut buf = vec![0u8; 1024];
            let mut collected = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed a keep-alive connection");
                collected.extend_from_slice(&buf[..n]);
                if collected.ends_with(b"pong") || collected.ends_with(b"0\r\n\r\n") {
                    break;
                }
            }
            let response = String::from_utf8_lossy(&collected);
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("pong"));
        }

        drop(stream);
        supervisor.shutdown(Some(Duration::from_secs(5))).await;
        assert!(serve_task.await.is_ok());
    });
}
