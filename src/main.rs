use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    response::{
        sse::{Event, Sse},
        Html, Json,
    },
    routing::{get, post},
    Form, Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

mod broadcast;
mod model;
mod page;
mod store;
mod utils;
mod vocab;

use broadcast::{Broadcaster, StreamOptions};
use model::Captioner;
use store::ImageStore;
use utils::Config;
use vocab::Vocabulary;

struct AppState {
    captioner: Mutex<Captioner>,
    store: ImageStore,
    broadcaster: Broadcaster,
    max_images: usize,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::from_env()?;
    utils::ensure_artifacts(&config).await?;

    let vocab = Vocabulary::load(
        Path::new(&config.vocab_path),
        Path::new(&config.annotations_path),
        config.word_threshold,
    )?;
    tracing::info!("vocabulary loaded with {} tokens", vocab.len());

    let captioner = Captioner::new(
        Path::new(&config.encoder_path),
        Path::new(&config.decoder_path),
        vocab,
    )?;
    let store = ImageStore::new(&config.data_dir)?;

    let state = Arc::new(AppState {
        captioner: Mutex::new(captioner),
        store,
        broadcaster: Broadcaster::new(),
        max_images: config.max_images,
    });

    let app = Router::new()
        .route("/", get(home))
        .route("/post", post(post_image))
        .route("/stream", get(stream))
        .route("/predict", post(predict))
        .route("/health", get(health_check))
        .nest_service("/static", ServeDir::new(&config.data_dir))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Handle image uploads: raw body bytes in, `success` out. Errors are
/// returned to the client as plain text.
async fn post_image(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> String {
    match handle_upload(&state, addr, &body).await {
        Ok(()) => "success".to_string(),
        Err(err) => format!("{err}"),
    }
}

async fn handle_upload(state: &AppState, addr: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
    // Bytes that fail to decode are dropped without failing the upload.
    let Some(saved) = state.store.save_normalized(data)? else {
        return Ok(());
    };

    let message = json!({
        "src": format!("static/{}.jpg", saved.hash),
        "ip_addr": safe_addr(addr),
    })
    .to_string();
    let delivered = state.broadcaster.broadcast(&message).await;
    tracing::info!("stored {} and notified {delivered} subscribers", saved.hash);
    Ok(())
}

/// Handle long-lived SSE streams.
async fn stream(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client = safe_addr(addr);
    tracing::info!("{client} connected to stream");
    Sse::new(broadcast::event_stream(
        state.broadcaster.clone(),
        client,
        StreamOptions::default(),
    ))
}

#[derive(Deserialize)]
struct PredictRequest {
    src: String,
}

async fn predict(
    State(state): State<SharedState>,
    Form(request): Form<PredictRequest>,
) -> Json<serde_json::Value> {
    let path = match state.store.resolve(&request.src) {
        Ok(path) => path,
        Err(err) => return Json(json!({ "error": err.to_string() })),
    };

    let captioner = state.captioner.lock().await;
    match captioner.caption(&path) {
        Ok(solution) => Json(json!({ "solution": solution })),
        Err(err) => {
            tracing::error!("caption failed for {}: {err:#}", path.display());
            Json(json!({ "error": err.to_string() }))
        }
    }
}

/// Provide the primary view along with its javascript, pruning the
/// store down to the retention limit as a side effect.
async fn home(State(state): State<SharedState>) -> Html<String> {
    let images = state.store.prune(state.max_images).unwrap_or_else(|err| {
        tracing::warn!("failed to list images: {err}");
        Vec::new()
    });

    let srcs: Vec<String> = images
        .iter()
        .filter_map(|path| path.file_name())
        .filter_map(|name| name.to_str())
        .map(|name| format!("static/{name}"))
        .collect();
    Html(page::render_home(&srcs))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

/// Strip off the trailing two octets of the client address before it
/// is shown to other subscribers.
fn safe_addr(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            format!("{}.{}.xxx.xxx", octets[0], octets[1])
        }
        IpAddr::V6(_) => "xxxx:xxxx".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_addr_masks_the_host_part() {
        let addr: SocketAddr = "203.0.113.9:4242".parse().unwrap();
        assert_eq!(safe_addr(addr), "203.0.xxx.xxx");

        let v6: SocketAddr = "[2001:db8::1]:4242".parse().unwrap();
        assert_eq!(safe_addr(v6), "xxxx:xxxx");
    }
}
