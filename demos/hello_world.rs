//! Sharded "Hello, world!" server.
//!
//! ```text
//! cargo run --example hello_world
//! curl -i http://127.0.0.1:8080/
//! ```
//!
//! Stops after 60 seconds, or when a request to `/shutdown` arrives.

use shard_web::{
    limits::ServerLimits, Application, HandlerError, HttpContext, ListenAddress, ListenOptions,
    Server, StatusCode,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Notify;

struct HelloWorld {
    shutdown: Arc<Notify>,
}

impl Application for HelloWorld {
    type Context = ();

    fn create_context(&self, _: &HttpContext) {}

    async fn process(&self, _: &mut (), http: &mut HttpContext) -> Result<(), HandlerError> {
        match http.path() {
            "/" => {
                let body = format!("Hello, world! ({})\n", http.connection_id());
                let headers = http.response_headers_mut()?;
                headers.insert("Content-Type", "text/plain");
                headers.insert("Content-Length", body.len().to_string());
                http.write(body.as_bytes()).await?;
            }
            "/shutdown" => self.shutdown.notify_one(),
            _ => http.set_status(StatusCode::NotFound)?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let shutdown = Arc::new(Notify::new());
    let address = ListenAddress::from_systemd()
        .unwrap_or_else(|| ListenAddress::Tcp(([127, 0, 0, 1], 8080).into()));

    let server = Server::builder()
        .listen(ListenOptions::new(address))
        .application(HelloWorld {
            shutdown: shutdown.clone(),
        })
        .server_limits(ServerLimits {
            worker_count: 4,
            ..ServerLimits::default()
        })
        .build()
        .start()
        .await?;

    tracing::info!(addresses = ?server.local_addrs(), "serving");

    tokio::select! {
        _ = shutdown.notified() => {}
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
    }

    server.shutdown().await?;
    Ok(())
}
