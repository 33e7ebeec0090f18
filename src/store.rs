use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use sha2::{Digest, Sha256};

const MAX_IMAGE_WIDTH: u32 = 800;
const MAX_IMAGE_HEIGHT: u32 = 600;
const JPEG_QUALITY: u8 = 85;

pub struct SavedImage {
    pub path: PathBuf,
    pub hash: String,
}

/// Flat on-disk store of normalized upload thumbnails, keyed by the
/// SHA-256 of the raw upload bytes.
pub struct ImageStore {
    data_dir: PathBuf,
}

impl ImageStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    /// Write an RGB thumbnail of the uploaded bytes, at most 800x600.
    /// Bytes that do not decode as an image are not an error: the upload
    /// is silently discarded and `None` comes back.
    pub fn save_normalized(&self, data: &[u8]) -> Result<Option<SavedImage>> {
        let img = match image::load_from_memory(data) {
            Ok(img) => img,
            Err(err) => {
                tracing::warn!("discarding upload that failed to decode: {err}");
                return Ok(None);
            }
        };

        let hash = hex::encode(Sha256::digest(data));
        let path = self.data_dir.join(format!("{hash}.jpg"));

        // Shrink to fit, never upscale.
        let img = if img.width() > MAX_IMAGE_WIDTH || img.height() > MAX_IMAGE_HEIGHT {
            img.resize(MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT, FilterType::Lanczos3)
        } else {
            img
        };

        let mut jpeg_bytes = Vec::new();
        img.to_rgb8()
            .write_to(
                &mut std::io::Cursor::new(&mut jpeg_bytes),
                image::ImageOutputFormat::Jpeg(JPEG_QUALITY),
            )
            .context("failed to encode thumbnail")?;
        fs::write(&path, &jpeg_bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(Some(SavedImage { path, hash }))
    }

    /// Regular files under the data dir, newest first.
    pub fn recent(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.data_dir)
            .with_context(|| format!("failed to list {}", self.data_dir.display()))?
        {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            // Not every filesystem reports a birth time.
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((created, entry.path()));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete everything past the most-recent `keep` files and return
    /// the survivors, newest first.
    pub fn prune(&self, keep: usize) -> Result<Vec<PathBuf>> {
        let mut files = self.recent()?;
        for path in files.split_off(keep.min(files.len())) {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!("failed to prune {}: {err}", path.display());
            }
        }
        Ok(files)
    }

    /// Map a client-supplied image reference back to a file inside the
    /// data dir. Only the file name is honored, so lookups cannot
    /// escape the store.
    pub fn resolve(&self, src: &str) -> Result<PathBuf> {
        let name = match Path::new(src).file_name() {
            Some(name) => name,
            None => bail!("invalid image reference: {src}"),
        };
        let path = self.data_dir.join(name);
        if !path.is_file() {
            bail!("no such image: {src}");
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgba::<u8>([200, 40, 40, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageOutputFormat::Png,
            )
            .unwrap();
        bytes
    }

    #[test]
    fn saves_upload_keyed_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let data = png_bytes(32, 24);

        let saved = store.save_normalized(&data).unwrap().unwrap();
        assert_eq!(saved.hash, hex::encode(Sha256::digest(&data)));
        assert!(saved.path.is_file());
        assert_eq!(saved.path, dir.path().join(format!("{}.jpg", saved.hash)));
    }

    #[test]
    fn oversized_uploads_are_shrunk_to_fit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        let saved = store.save_normalized(&png_bytes(1600, 1200)).unwrap().unwrap();
        let thumb = image::open(&saved.path).unwrap();
        assert!(thumb.width() <= 800);
        assert!(thumb.height() <= 600);
    }

    #[test]
    fn undecodable_bytes_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        assert!(store.save_normalized(b"definitely not an image").unwrap().is_none());
        assert!(store.recent().unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_only_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(30));
        }

        let kept = store.prune(2).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].file_name().unwrap(), "c.jpg");
        assert_eq!(kept[1].file_name().unwrap(), "b.jpg");
        assert!(!dir.path().join("a.jpg").exists());
    }

    #[test]
    fn resolve_only_honors_the_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("abc.jpg"), b"x").unwrap();

        let path = store.resolve("static/abc.jpg").unwrap();
        assert_eq!(path, dir.path().join("abc.jpg"));
        assert_eq!(store.resolve("../../etc/abc.jpg").unwrap(), path);
        assert!(store.resolve("missing.jpg").is_err());
    }
}
