//! In-process HTTP server exercising every redirect mechanism the tracker
//! understands: 3xx Location, `<meta http-equiv=refresh>`, JS `location`
//! reassignment, plus a cycle pair and an error endpoint.

use anyhow::{Context, Result};
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;

pub struct RedirectServer {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl RedirectServer {
    /// Bind an ephemeral localhost port and serve the fixture routes until
    /// dropped.
    pub async fn spawn() -> Result<Self> {
        let router = Router::new()
            .route("/hop/:n", get(hop))
            .route("/meta", get(meta_refresh))
            .route("/js", get(js_location))
            .route("/landing", get(landing))
            .route("/plain", get(landing))
            .route("/loop/a", get(loop_a))
            .route("/loop/b", get(loop_b))
            .route("/gone", get(gone));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind redirect test server")?;
        let addr = listener.local_addr().context("test server local_addr")?;

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// The query string /landing is reached with in the standard chain.
    pub const LANDING_SUFFIX: &'static str = "tag=aff-20&gclid=abc";
}

impl Drop for RedirectServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// /hop/N 302-redirects to /hop/N-1; /hop/0 redirects into the meta page.
async fn hop(Path(n): Path<u32>) -> Response {
    let next = if n == 0 {
        "/meta".to_string()
    } else {
        format!("/hop/{}", n - 1)
    };
    (StatusCode::FOUND, [(header::LOCATION, next)]).into_response()
}

async fn meta_refresh() -> Html<&'static str> {
    Html(r#"<html><head><meta http-equiv="refresh" content="0; url=/js"></head><body>hold on</body></html>"#)
}

async fn js_location() -> Html<String> {
    Html(format!(
        r#"<html><body><script>window.location.href = "/landing?{}";</script></body></html>"#,
        RedirectServer::LANDING_SUFFIX
    ))
}

async fn landing() -> Html<&'static str> {
    Html("<html><body>landed</body></html>")
}

async fn loop_a() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/loop/b")]).into_response()
}

async fn loop_b() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/loop/a")]).into_response()
}

async fn gone() -> Response {
    (StatusCode::GONE, "gone").into_response()
}
