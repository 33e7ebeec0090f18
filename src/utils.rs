use std::{env, fs, path::Path};

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Runtime configuration, read from the environment with defaults that
/// match a local checkout.
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub data_dir: String,
    pub encoder_path: String,
    pub decoder_path: String,
    pub vocab_path: String,
    pub annotations_path: String,
    pub max_images: usize,
    pub word_threshold: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let body_limit_bytes = {
            let mb = env::var("BODY_LIMIT_MB")
                .unwrap_or_else(|_| "5".into())
                .parse::<usize>()
                .context("BODY_LIMIT_MB must be a valid integer")?;
            mb * 1024 * 1024
        };

        let port = env::var("PORT")
            .unwrap_or_else(|_| "5020".into())
            .parse::<u16>()
            .context("PORT must be a valid number between 0 and 65535")?;

        let max_images = env::var("MAX_IMAGES")
            .unwrap_or_else(|_| "10".into())
            .parse::<usize>()
            .context("MAX_IMAGES must be a valid integer")?;

        let word_threshold = env::var("WORD_THRESHOLD")
            .unwrap_or_else(|_| "6".into())
            .parse::<usize>()
            .context("WORD_THRESHOLD must be a valid integer")?;

        Ok(Self {
            port,
            body_limit_bytes,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "static".into()),
            encoder_path: env::var("ENCODER_PATH")
                .unwrap_or_else(|_| "./model/encoder_frozen.pb".into()),
            decoder_path: env::var("DECODER_PATH")
                .unwrap_or_else(|_| "./model/decoder_frozen.pb".into()),
            vocab_path: env::var("VOCAB_PATH").unwrap_or_else(|_| "./model/vocab.json".into()),
            annotations_path: env::var("ANNOTATIONS_PATH")
                .unwrap_or_else(|_| "./model/captions_train2017.json".into()),
            max_images,
            word_threshold,
        })
    }
}

async fn download_file(url: &str, path: &str) -> Result<()> {
    tracing::info!("downloading {path} from {url}");

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid GITHUB_TOKEN format")?;
        header_map.insert(HeaderName::from_static("authorization"), auth_value);
    }
    header_map.insert(
        HeaderName::from_static("accept"),
        HeaderValue::from_static("application/octet-stream"),
    );

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .with_context(|| format!("failed to request {url}"))?;

    if !response.status().is_success() {
        bail!("failed to download {url}: {}", response.status());
    }

    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = response.bytes().await.context("failed to read bytes")?;
    fs::write(path, bytes).with_context(|| format!("failed to write {path}"))?;
    Ok(())
}

async fn ensure_file(path: &str, url_env: &str) -> Result<()> {
    if Path::new(path).exists() {
        return Ok(());
    }
    let url =
        env::var(url_env).with_context(|| format!("{url_env} environment variable not set"))?;
    download_file(&url, path).await
}

/// Fetch any missing model artifacts. The annotations corpus is only
/// needed when the vocabulary cache has to be rebuilt.
pub async fn ensure_artifacts(config: &Config) -> Result<()> {
    tracing::info!("checking model artifacts");
    ensure_file(&config.encoder_path, "ENCODER_URL").await?;
    ensure_file(&config.decoder_path, "DECODER_URL").await?;

    if !Path::new(&config.vocab_path).exists() && !Path::new(&config.annotations_path).exists() {
        ensure_file(&config.annotations_path, "ANNOTATIONS_URL").await?;
    }
    Ok(())
}
