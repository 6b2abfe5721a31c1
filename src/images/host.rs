//! Ephemeral HTTP host for transformed images
//!
//! The remote catalog pulls media by URL instead of accepting uploads, so a
//! run binds a throwaway server on an OS-assigned port, publishes staged
//! images under it, and hands the resulting URLs to the product upsert. Each
//! download is tracked so the run can wait until the remote has pulled
//! everything before tearing the host down.

use crate::models::StagedImage;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long shutdown waits for in-flight downloads before forcing the issue
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct HostedImage {
    bytes: Arc<Vec<u8>>,
    content_type: &'static str,
    fetched: bool,
}

#[derive(Clone)]
struct HostState {
    images: Arc<Mutex<HashMap<String, HostedImage>>>,
}

/// A running ephemeral image server.
pub struct ImageHost {
    base_url: String,
    state: HostState,
    shutdown: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
}

async fn image_handler(
    State(state): State<HostState>,
    Path(filename): Path<String>,
) -> Result<Response, StatusCode> {
    let (bytes, content_type) = {
        let mut images = state.images.lock().unwrap();
        let image = images.get_mut(&filename).ok_or(StatusCode::NOT_FOUND)?;
        image.fetched = true;
        (image.bytes.clone(), image.content_type)
    };

    log::debug!("Remote pulled image {}", filename);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes.as_ref().clone()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

impl ImageHost {
    /// Bind an OS-assigned port and start serving. `advertise_host` is the
    /// address the remote will use to reach us; it defaults to the loopback
    /// address, which only works when remote and sync run share a machine.
    pub async fn start(advertise_host: Option<&str>) -> std::io::Result<Self> {
        let state = HostState {
            images: Arc::new(Mutex::new(HashMap::new())),
        };

        let app = Router::new()
            .route("/images/{filename}", get(image_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
        let local: SocketAddr = listener.local_addr()?;
        let base_url = format!(
            "http://{}:{}",
            advertise_host.unwrap_or("127.0.0.1"),
            local.port()
        );
        log::info!("Image host listening on {} (serving as {})", local, base_url);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                log::error!("Image host terminated abnormally: {}", e);
            }
        });

        Ok(Self {
            base_url,
            state,
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    /// Publish one staged image, returning the URL the remote should pull.
    pub fn publish(&self, image: &StagedImage) -> String {
        let content_type = match image.format {
            "png" => "image/png",
            _ => "image/jpeg",
        };
        self.state.images.lock().unwrap().insert(
            image.filename.clone(),
            HostedImage {
                bytes: Arc::new(image.bytes.clone()),
                content_type,
                fetched: false,
            },
        );
        format!("{}/images/{}", self.base_url, image.filename)
    }

    /// Remove one image from the host once its product is done.
    pub fn unpublish(&self, filename: &str) -> bool {
        self.state.images.lock().unwrap().remove(filename).is_some()
    }

    /// True when every currently published image has been pulled at least
    /// once.
    pub fn all_fetched(&self) -> bool {
        self.state
            .images
            .lock()
            .unwrap()
            .values()
            .all(|image| image.fetched)
    }

    /// Wait until all published images were pulled, up to `timeout`.
    /// Returns false if the remote never came for some of them.
    pub async fn wait_until_fetched(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.all_fetched() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                let unfetched = self
                    .state
                    .images
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, image)| !image.fetched)
                    .count();
                log::warn!("{} published images were never pulled", unfetched);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop serving. Bounded: in-flight downloads get a grace period, then
    /// the task is aborted.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let Some(mut server) = self.server.lock().unwrap().take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            log::warn!("Image host did not stop within grace period, aborting");
            server.abort();
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
