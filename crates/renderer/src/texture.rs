//! Asynchronous image loading into textures.
//!
//! A load creates its texture and uploads the placeholder pixel right away,
//! so the handle is usable from the first frame. A worker thread fetches and
//! decodes the image; the decoded pixels only reach the GPU when the owner
//! polls the returned [`TextureFuture`] on the render thread.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use reqwest::blocking::Client;
use reqwest::Url;
use tracing::{debug, warn};

use crate::context::GraphicsContext;
use crate::error::{LoadCause, TextureLoadError};
use crate::types::{Sampling, TexelImage};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns an image location into raw encoded bytes. Called on a worker
/// thread.
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Resolves `http://` and `https://` locations over HTTP and everything
/// else (`file://` URLs and plain paths) through the file system.
#[derive(Debug, Clone)]
pub struct LocationFetcher {
    timeout: Duration,
}

impl LocationFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocationFetcher {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }
}

impl ImageFetcher for LocationFetcher {
    fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        match ImageLocation::parse(location)? {
            ImageLocation::Http(url) => {
                let http = Client::builder().timeout(self.timeout).build()?;
                let response = http
                    .get(url)
                    .send()
                    .with_context(|| format!("requesting {location}"))?
                    .error_for_status()
                    .context("image request returned an error status")?;
                Ok(response.bytes()?.to_vec())
            }
            ImageLocation::File(path) => {
                fs::read(&path).with_context(|| format!("reading {}", path.display()))
            }
        }
    }
}

/// Where an image location string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocation {
    Http(Url),
    File(PathBuf),
}

impl ImageLocation {
    /// `http(s)://` URLs stay URLs, `file://` URLs become decoded local paths,
    /// and anything that does not parse as a URL is taken as a plain path.
    pub fn parse(location: &str) -> Result<Self> {
        let Ok(url) = Url::parse(location) else {
            return Ok(Self::File(PathBuf::from(location)));
        };
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|()| anyhow!("`{location}` does not name a local file")),
            // Windows drive letters parse as one-letter schemes.
            scheme if scheme.len() == 1 => Ok(Self::File(PathBuf::from(location))),
            other => bail!("unsupported image location scheme `{other}`"),
        }
    }
}

/// Decoded RGBA8 pixels, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl DecodedImage {
    pub fn as_texels(&self) -> TexelImage<'_> {
        TexelImage {
            width: self.width,
            height: self.height,
            rgba: &self.rgba,
        }
    }
}

/// Decodes PNG, JPEG, BMP or GIF (first frame) bytes. Rows are kept in file
/// order.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, image::ImageError> {
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(DecodedImage {
        width,
        height,
        rgba: rgba.into_raw(),
    })
}

fn fetch_and_decode(fetcher: &dyn ImageFetcher, location: &str) -> Result<DecodedImage, LoadCause> {
    let bytes = fetcher
        .fetch(location)
        .map_err(|err| LoadCause::Fetch(format!("{err:#}")))?;
    let image = decode_image(&bytes).map_err(|err| LoadCause::Decode(err.to_string()))?;
    if image.width == 0 || image.height == 0 {
        return Err(LoadCause::Decode("image has no pixels".to_string()));
    }
    Ok(image)
}

/// Starts texture loads; cheap to clone.
#[derive(Clone)]
pub struct TextureLoader {
    fetcher: Arc<dyn ImageFetcher>,
}

impl fmt::Debug for TextureLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureLoader").finish_non_exhaustive()
    }
}

impl Default for TextureLoader {
    fn default() -> Self {
        Self::new(LocationFetcher::default())
    }
}

impl TextureLoader {
    pub fn new(fetcher: impl ImageFetcher) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
        }
    }

    /// Creates a texture holding the placeholder pixel and starts fetching
    /// `url` in the background. Never blocks on the fetch.
    pub fn load<C: GraphicsContext>(&self, ctx: &mut C, url: &str) -> TextureFuture<C::Texture> {
        let texture = ctx.create_texture();
        ctx.upload_texture(&texture, TexelImage::placeholder(), Sampling::PLACEHOLDER);

        let (sender, receiver) = bounded(1);
        if url.trim().is_empty() {
            let _ = sender.send(Err(LoadCause::EmptyLocation));
        } else {
            let fetcher = Arc::clone(&self.fetcher);
            let location = url.to_string();
            let spawned = thread::Builder::new()
                .name("texture-loader".to_string())
                .spawn(move || {
                    let outcome = fetch_and_decode(fetcher.as_ref(), &location);
                    let _ = sender.send(outcome);
                });
            if let Err(error) = spawned {
                warn!(url, %error, "failed to spawn texture loader thread");
            }
        }
        debug!(url, "texture load started");

        TextureFuture {
            url: url.to_string(),
            texture: Some(texture),
            receiver,
        }
    }
}

/// A decoded image now living in `texture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTexture<T> {
    pub texture: T,
    pub width: u32,
    pub height: u32,
}

/// A failed load. `texture` still holds the placeholder pixel and is owned
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLoad<T> {
    pub texture: T,
    pub error: TextureLoadError,
}

pub type LoadOutcome<T> = Result<LoadedTexture<T>, FailedLoad<T>>;

/// Single-outcome handle to an in-flight load.
///
/// Texture handles are not reference counted: whoever takes the outcome owns
/// the texture and must eventually delete it.
#[derive(Debug)]
pub struct TextureFuture<T> {
    url: String,
    texture: Option<T>,
    receiver: Receiver<Result<DecodedImage, LoadCause>>,
}

impl<T> TextureFuture<T> {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The texture being filled; `None` once the outcome has been taken.
    pub fn texture(&self) -> Option<&T> {
        self.texture.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.texture.is_none()
    }

    /// Takes the outcome if the worker has finished, uploading decoded pixels
    /// into the same texture handle first. Returns `None` while pending and
    /// after the outcome was taken.
    pub fn poll<C>(&mut self, ctx: &mut C) -> Option<LoadOutcome<T>>
    where
        C: GraphicsContext<Texture = T>,
    {
        self.texture.as_ref()?;
        let outcome = match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(LoadCause::WorkerLost),
        };
        self.finish(ctx, outcome)
    }

    /// Blocks until the worker reports, then behaves like [`poll`](Self::poll).
    pub fn wait<C>(&mut self, ctx: &mut C) -> Option<LoadOutcome<T>>
    where
        C: GraphicsContext<Texture = T>,
    {
        self.texture.as_ref()?;
        let outcome = self
            .receiver
            .recv()
            .unwrap_or(Err(LoadCause::WorkerLost));
        self.finish(ctx, outcome)
    }

    fn finish<C>(
        &mut self,
        ctx: &mut C,
        outcome: Result<DecodedImage, LoadCause>,
    ) -> Option<LoadOutcome<T>>
    where
        C: GraphicsContext<Texture = T>,
    {
        let texture = self.texture.take()?;
        let image = outcome.and_then(|image| {
            let max = ctx.max_texture_size();
            if image.width > max || image.height > max {
                Err(LoadCause::TooLarge {
                    width: image.width,
                    height: image.height,
                    max,
                })
            } else {
                Ok(image)
            }
        });

        match image {
            Ok(image) => {
                ctx.upload_texture(&texture, image.as_texels(), Sampling::CLAMP_LINEAR);
                debug!(
                    url = %self.url,
                    width = image.width,
                    height = image.height,
                    "texture load resolved"
                );
                Some(Ok(LoadedTexture {
                    texture,
                    width: image.width,
                    height: image.height,
                }))
            }
            Err(cause) => {
                let error = TextureLoadError::new(self.url.clone(), cause);
                warn!(%error, "texture load failed");
                Some(Err(FailedLoad { texture, error }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::headless::HeadlessContext;

    struct MemoryFetcher(Vec<u8>);

    impl ImageFetcher for MemoryFetcher {
        fn fetch(&self, _location: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    struct Unreachable;

    impl ImageFetcher for Unreachable {
        fn fetch(&self, location: &str) -> Result<Vec<u8>> {
            Err(anyhow!("no route to {location}"))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([x as u8 * 10, y as u8 * 10, 7, 255])
        });
        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, ImageFormat::Png)
            .expect("encode png");
        bytes.into_inner()
    }

    #[test]
    fn placeholder_is_uploaded_synchronously() {
        let mut ctx = HeadlessContext::new();
        let loader = TextureLoader::new(Unreachable);
        let future = loader.load(&mut ctx, "https://example.invalid/a.png");
        let texture = *future.texture().unwrap();
        let snapshot = ctx.texture(texture).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (1, 1));
        assert_eq!(snapshot.rgba, [0, 0, 255, 255]);
        assert_eq!(snapshot.sampling, Some(Sampling::PLACEHOLDER));
    }

    #[test]
    fn decoded_pixels_replace_the_placeholder_in_place() {
        let mut ctx = HeadlessContext::new();
        let loader = TextureLoader::new(MemoryFetcher(png(3, 2)));
        let mut future = loader.load(&mut ctx, "memory");
        let placeholder = *future.texture().unwrap();

        let loaded = future.wait(&mut ctx).unwrap().expect("png decodes");
        assert_eq!(loaded.texture, placeholder);
        assert_eq!((loaded.width, loaded.height), (3, 2));

        let snapshot = ctx.texture(placeholder).unwrap();
        assert_eq!(snapshot.pixel(2, 1), Some([20, 10, 7, 255]));
        assert_eq!(snapshot.sampling, Some(Sampling::CLAMP_LINEAR));
        assert!(future.is_resolved());
        assert!(future.poll(&mut ctx).is_none());
    }

    #[test]
    fn fetch_failures_hand_back_the_placeholder() {
        let mut ctx = HeadlessContext::new();
        let loader = TextureLoader::new(Unreachable);
        let mut future = loader.load(&mut ctx, "https://example.invalid/a.png");
        let failed = future.wait(&mut ctx).unwrap().unwrap_err();
        assert_eq!(failed.error.url, "https://example.invalid/a.png");
        assert!(matches!(failed.error.cause, LoadCause::Fetch(ref msg) if msg.contains("no route")));
        assert_eq!(ctx.texture(failed.texture).unwrap().width, 1);
    }

    #[test]
    fn undecodable_bytes_fail_with_decode_cause() {
        let mut ctx = HeadlessContext::new();
        let loader = TextureLoader::new(MemoryFetcher(b"definitely not an image".to_vec()));
        let mut future = loader.load(&mut ctx, "memory");
        let failed = future.wait(&mut ctx).unwrap().unwrap_err();
        assert!(matches!(failed.error.cause, LoadCause::Decode(_)));
    }

    #[test]
    fn oversized_images_are_rejected() {
        let mut ctx = HeadlessContext::new().with_max_texture_size(2);
        let loader = TextureLoader::new(MemoryFetcher(png(3, 2)));
        let mut future = loader.load(&mut ctx, "memory");
        let failed = future.wait(&mut ctx).unwrap().unwrap_err();
        assert_eq!(
            failed.error.cause,
            LoadCause::TooLarge {
                width: 3,
                height: 2,
                max: 2
            }
        );
    }

    #[test]
    fn empty_location_fails_without_a_worker() {
        let mut ctx = HeadlessContext::new();
        let loader = TextureLoader::default();
        let mut future = loader.load(&mut ctx, "");
        let failed = future.poll(&mut ctx).unwrap().unwrap_err();
        assert_eq!(failed.error.cause, LoadCause::EmptyLocation);
    }

    #[test]
    fn location_fetcher_reads_plain_and_file_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        std::fs::write(&path, png(1, 1)).unwrap();

        let fetcher = LocationFetcher::new();
        let plain = fetcher.fetch(path.to_str().unwrap()).unwrap();
        let url = Url::from_file_path(&path).unwrap();
        assert_eq!(fetcher.fetch(url.as_str()).unwrap(), plain);
        assert!(fetcher.fetch(dir.path().join("missing.png").to_str().unwrap()).is_err());
    }

    #[test]
    fn file_urls_are_percent_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my photo.png");
        std::fs::write(&path, png(2, 1)).unwrap();

        let url = Url::from_file_path(&path).unwrap();
        assert!(url.as_str().contains("my%20photo.png"));
        let bytes = LocationFetcher::new().fetch(url.as_str()).unwrap();
        assert_eq!(decode_image(&bytes).unwrap().width, 2);
    }

    #[cfg(unix)]
    #[test]
    fn file_urls_accept_the_localhost_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my photo.png");
        std::fs::write(&path, png(1, 1)).unwrap();

        let location = format!("file://localhost{}", path.display());
        assert_eq!(
            ImageLocation::parse(&location).unwrap(),
            ImageLocation::File(path.clone())
        );
        assert!(LocationFetcher::new().fetch(&location).is_ok());
    }

    #[test]
    fn location_kinds() {
        assert!(matches!(
            ImageLocation::parse("https://example.com/a.png").unwrap(),
            ImageLocation::Http(_)
        ));
        assert_eq!(
            ImageLocation::parse("photos/a.png").unwrap(),
            ImageLocation::File(PathBuf::from("photos/a.png"))
        );
        assert!(ImageLocation::parse("ftp://example.com/a.png").is_err());
    }
}
