use trellis::{handler, BoxFuture, Context};
use trellis_router::App;

fn main() {
    env_logger::init();

    let app = App::new();

    app.get(
        "/",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let _ = ctx.write_string("welcome\n").await;
            })
        })],
    )
    .unwrap();

    app.get(
        "/greet/:name",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let name = ctx.params().get_default("name", "stranger").to_string();
                let _ = ctx.writef(format_args!("hello, {name}\n")).await;
            })
        })],
    )
    .unwrap();

    app.get(
        "/files/*path",
        vec![handler(|ctx: &mut Context| -> BoxFuture<'_, ()> {
            Box::pin(async move {
                let path = ctx.params().get_default("path", "").to_string();
                let _ = ctx.writef(format_args!("you asked for {path}\n")).await;
            })
        })],
    )
    .unwrap();

    if let Err(error) = app.listen(":8080") {
        eprintln!("{error}");
    }
}
