//! Minimal mixer example: an app context, an auth hook and a request log.
//!
//! Run with:
//!   cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/
//!   curl -i -H 'x-user: alice' http://localhost:3000/

use std::time::Instant;

use http::StatusCode;
use mixer::{AsContext, Context, Pipeline, Server};
use tracing::info;

struct AppContext {
    base: Context,
    started: Instant,
    user: Option<String>,
}

impl AsContext for AppContext {
    fn as_context(&self) -> &Context {
        &self.base
    }
    fn as_context_mut(&mut self) -> &mut Context {
        &mut self.base
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut app = Pipeline::new(|base| AppContext { base, started: Instant::now(), user: None });

    // Reject anonymous callers before the handler runs.
    app.before(|c| {
        c.user = c.base.request().headers()
            .get("x-user")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if c.user.is_none() {
            c.base.response_mut().write_status(StatusCode::UNAUTHORIZED);
        }
    });

    // Runs for every request, rejected or not.
    app.after(|c| {
        let res = c.base.response();
        info!(
            path = %c.base.request().uri().path(),
            status = res.status().map(|s| s.as_u16()).unwrap_or(200),
            bytes = res.size(),
            elapsed = ?c.started.elapsed(),
            "request",
        );
    });

    let hello = app.handler(|c| {
        let body = format!("hello, {}\n", c.user.as_deref().unwrap_or_default());
        if let Err(e) = c.base.response_mut().write(body.as_bytes()) {
            tracing::warn!("write failed: {e}");
        }
    });

    Server::bind("0.0.0.0:3000")
        .expect("valid address")
        .serve(hello)
        .await
        .expect("server error");
}
