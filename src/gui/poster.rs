use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use lru::LruCache;

// Posters are shown small behind the start button and while loading
const POSTER_MAX_WIDTH: u32 = 540;
const POSTER_MAX_HEIGHT: u32 = 960;

/// Result from the background download
#[derive(Debug)]
struct PosterResult {
    url: String,
    image: Result<DecodedPoster, String>,
}

#[derive(Debug)]
struct DecodedPoster {
    rgba: Vec<u8>,
    width: u32,
    height: u32,
}

/// Thumbnail textures for feed items, downloaded in the background and kept
/// in an LRU cache.
pub struct PosterCache {
    textures: LruCache<String, egui::TextureHandle>,
    /// Requested but not yet finished
    pending: HashSet<String>,
    /// Recently failed urls; not requested again while they are remembered
    failed: LruCache<String, ()>,
    job_sender: tokio::sync::mpsc::UnboundedSender<String>,
    result_receiver: mpsc::Receiver<PosterResult>,
}

impl PosterCache {
    pub fn new(capacity: usize, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create poster HTTP client: {}", e))?;

        let (job_sender, mut job_receiver) = tokio::sync::mpsc::unbounded_channel::<String>();
        let (result_sender, result_receiver) = mpsc::channel::<PosterResult>();

        thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to create poster runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                while let Some(url) = job_receiver.recv().await {
                    let image = download_poster(&client, &url).await;
                    if let Err(ref e) = image {
                        log::warn!("Failed to load poster {}: {}", url, e);
                    }
                    if result_sender.send(PosterResult { url, image }).is_err() {
                        break;
                    }
                }
            });
            log::debug!("Poster worker exited");
        });

        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            textures: LruCache::new(capacity),
            pending: HashSet::new(),
            failed: LruCache::new(capacity),
            job_sender,
            result_receiver,
        })
    }

    /// Poster texture for `url`, starting a download on first use.
    pub fn get(&mut self, ctx: &egui::Context, url: &str) -> Option<egui::TextureHandle> {
        if url.is_empty() {
            return None;
        }

        self.process_results(ctx);

        if let Some(texture) = self.textures.get(url) {
            return Some(texture.clone());
        }
        if self.failed.contains(url) {
            return None;
        }

        if self.pending.insert(url.to_string()) {
            log::debug!("Requesting poster {}", url);
            if self.job_sender.send(url.to_string()).is_err() {
                log::error!("Poster worker is gone");
            }
        }
        None
    }

    fn process_results(&mut self, ctx: &egui::Context) {
        while let Ok(result) = self.result_receiver.try_recv() {
            let poster = match result.image {
                Ok(poster) => poster,
                Err(_) => {
                    self.record_failure(result.url);
                    continue;
                }
            };

            let color_image = egui::ColorImage::from_rgba_unmultiplied(
                [poster.width as usize, poster.height as usize],
                &poster.rgba,
            );
            let texture = ctx.load_texture(
                format!("poster_{}", result.url),
                color_image,
                egui::TextureOptions::LINEAR,
            );
            self.pending.remove(&result.url);
            self.textures.put(result.url, texture);
        }
    }

    fn record_failure(&mut self, url: String) {
        self.pending.remove(&url);
        self.failed.put(url, ());
    }
}

async fn download_poster(client: &reqwest::Client, url: &str) -> Result<DecodedPoster, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    decode_poster(&bytes)
}

fn decode_poster(bytes: &[u8]) -> Result<DecodedPoster, String> {
    let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let img = if img.width() > POSTER_MAX_WIDTH || img.height() > POSTER_MAX_HEIGHT {
        img.thumbnail(POSTER_MAX_WIDTH, POSTER_MAX_HEIGHT)
    } else {
        img
    };
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    Ok(DecodedPoster {
        rgba: rgba.into_raw(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 10, 10, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_decode_small_poster_keeps_size() {
        let poster = decode_poster(&png_bytes(64, 32)).unwrap();
        assert_eq!((poster.width, poster.height), (64, 32));
        assert_eq!(poster.rgba.len(), 64 * 32 * 4);
        assert_eq!(&poster.rgba[..4], &[200, 10, 10, 255]);
    }

    #[test]
    fn test_decode_large_poster_is_downscaled() {
        let poster = decode_poster(&png_bytes(1080, 1920)).unwrap();
        assert!(poster.width <= POSTER_MAX_WIDTH);
        assert!(poster.height <= POSTER_MAX_HEIGHT);
        assert_eq!(poster.rgba.len(), (poster.width * poster.height * 4) as usize);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_poster(b"not an image").is_err());
    }

    #[test]
    fn test_failed_urls_leave_pending_and_are_bounded() {
        let ctx = egui::Context::default();
        let mut cache = PosterCache::new(2, Duration::from_secs(1)).unwrap();

        for n in 1..=3 {
            let url = format!("https://cdn.example.com/poster{}.jpg", n);
            cache.pending.insert(url.clone());
            cache.record_failure(url);
        }

        assert!(cache.pending.is_empty());
        assert_eq!(cache.failed.len(), 2);
        assert!(!cache.failed.contains("https://cdn.example.com/poster1.jpg"));

        // A remembered failure is not requested again
        assert!(cache.get(&ctx, "https://cdn.example.com/poster3.jpg").is_none());
        assert!(cache.pending.is_empty());
    }

    #[test]
    fn test_unreachable_poster_is_marked_failed() {
        let ctx = egui::Context::default();
        let mut cache = PosterCache::new(4, Duration::from_secs(1)).unwrap();
        let url = "http://127.0.0.1:1/poster.jpg";

        assert!(cache.get(&ctx, url).is_none());
        assert!(cache.pending.contains(url));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cache.failed.contains(url) && std::time::Instant::now() < deadline {
            cache.process_results(&ctx);
            thread::sleep(Duration::from_millis(10));
        }

        assert!(cache.failed.contains(url));
        assert!(cache.pending.is_empty());
    }
}
