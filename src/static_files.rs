//! Static file serving for the catch-all backend
//!
//! When `STATIC_WWW_DIR` is configured, this serves that directory on the
//! loopback interface and the synthesized proxy config routes otherwise
//! unmatched traffic here. Deliberately small: GET/HEAD, directory index
//! files and mime-typed responses, nothing more.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct StaticFileServer {
    root: PathBuf,
    port: u16,
}

impl StaticFileServer {
    pub fn new(root: PathBuf, port: u16) -> Self {
        Self { root, port }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await.map_err(|e| {
            anyhow::anyhow!("Could not bind static file server on port {}: {}", self.port, e)
        })?;
        info!(root = %self.root.display(), port = self.port, "Static file server listening");

        let root = Arc::new(self.root);
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, _peer) = match accept {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Static file server accept failed");
                            continue;
                        }
                    };

                    let root = Arc::clone(&root);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let root = Arc::clone(&root);
                            async move {
                                Ok::<_, std::convert::Infallible>(
                                    serve_path(&root, req.method(), req.uri().path()).await,
                                )
                            }
                        });

                        if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            debug!(error = %e, "Static file connection error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_path(root: &Path, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET && method != Method::HEAD {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Some(mut file_path) = resolve_path(root, path) else {
        return status_response(StatusCode::NOT_FOUND);
    };

    if let Ok(metadata) = tokio::fs::metadata(&file_path).await {
        if metadata.is_dir() {
            file_path.push("index.html");
        }
    }

    match tokio::fs::read(&file_path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
            let body = if method == Method::HEAD {
                Bytes::new()
            } else {
                Bytes::from(contents)
            };
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", mime.essence_str())
                .body(Full::new(body))
                .expect("valid response with StatusCode enum and static header")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            status_response(StatusCode::NOT_FOUND)
        }
        Err(e) => {
            warn!(path = %file_path.display(), error = %e, "Could not read static file");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Resolve a request path under the root, refusing anything that could
/// escape it.
fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    Some(resolved)
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}
