//! Image embedding encoders
//!
//! The visual brand detector only needs `encode(image) -> vector`. Concrete
//! encoders live behind [`ImageEncoder`]; [`TimedEncoder`] bounds every call.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::imageops::FilterType;
use image::DynamicImage;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{EncodeError, VisualError};

/// Maps an image to a fixed-length embedding vector
pub trait ImageEncoder: Send + Sync {
    /// Encode an image. Implementations return L2-normalized vectors.
    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncodeError>;

    /// Identifier of the model producing the vectors; part of every cache key
    fn model_version(&self) -> &str;

    /// Length of every vector returned by [`ImageEncoder::encode`]
    fn dimensions(&self) -> usize;
}

/// Deterministic encoder built from a small mean-centered RGB thumbnail
///
/// Needs no model file. Identical images encode identically and a uniform
/// image encodes to the zero vector, so it never matches anything.
pub struct ThumbnailEncoder {
    side: u32,
    version: String,
}

impl ThumbnailEncoder {
    pub fn new(side: u32) -> Self {
        let side = side.max(2);
        Self {
            side,
            version: format!("thumbnail-{}x{}-v1", side, side),
        }
    }
}

impl Default for ThumbnailEncoder {
    fn default() -> Self {
        Self::new(12)
    }
}

impl ImageEncoder for ThumbnailEncoder {
    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EncodeError::Failed("empty image".to_string()));
        }

        let thumb = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_rgb8();

        let mut vector: Vec<f32> = thumb.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        let mean = vector.iter().sum::<f32>() / vector.len() as f32;
        for value in &mut vector {
            *value -= mean;
        }
        l2_normalize(&mut vector);

        Ok(vector)
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        (self.side * self.side * 3) as usize
    }
}

/// Jobs waiting for the encoder worker
const QUEUE_CAPACITY: usize = 8;

/// One queued encode request
struct EncodeJob {
    image: Arc<DynamicImage>,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    reply: Sender<Result<Vec<f32>, EncodeError>>,
}

impl EncodeJob {
    fn abandoned(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || Instant::now() >= self.deadline
    }
}

/// Wraps an encoder so every call finishes within `timeout`
///
/// Encodes run one at a time on a long-lived worker thread fed by a bounded
/// queue. A caller that times out marks its job cancelled; the worker skips
/// cancelled or expired jobs, so an abandoned request costs at most the
/// encode already in flight.
pub struct TimedEncoder {
    inner: Arc<dyn ImageEncoder>,
    timeout: Duration,
    worker: Mutex<Option<Sender<EncodeJob>>>,
}

impl TimedEncoder {
    pub fn new(inner: Arc<dyn ImageEncoder>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn model_version(&self) -> &str {
        self.inner.model_version()
    }

    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn encode(&self, image: Arc<DynamicImage>) -> Result<Vec<f32>, VisualError> {
        self.encode_with_timeout(image, self.timeout)
    }

    /// Encode with a bound other than the configured one
    pub fn encode_with_timeout(&self, image: Arc<DynamicImage>, timeout: Duration) -> Result<Vec<f32>, VisualError> {
        let deadline = Instant::now() + timeout;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, rx) = crossbeam_channel::bounded(1);

        let mut job = EncodeJob {
            image,
            deadline,
            cancelled: cancelled.clone(),
            reply,
        };

        // A worker that died is replaced once
        for attempt in 0..2 {
            let sender = self.worker_sender()?;
            match sender.send_timeout(job, deadline.saturating_duration_since(Instant::now())) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(_)) => {
                    debug!("Encoder {} queue full for {:?}", self.model_version(), timeout);
                    return Err(VisualError::Timeout(timeout));
                }
                Err(SendTimeoutError::Disconnected(returned)) => {
                    warn!("Encoder worker for {} exited, restarting", self.model_version());
                    self.worker.lock().take();
                    if attempt == 1 {
                        return Err(VisualError::ModelUnavailable("encoder worker unavailable".to_string()));
                    }
                    job = returned;
                }
            }
        }

        let vector = match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::Release);
                debug!("Encoder {} exceeded {:?}", self.model_version(), timeout);
                return Err(VisualError::Timeout(timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                if cancelled.load(Ordering::Acquire) || Instant::now() >= deadline {
                    return Err(VisualError::Timeout(timeout));
                }
                return Err(VisualError::ModelUnavailable("encoder worker exited".to_string()));
            }
        };

        if vector.len() != self.dimensions() {
            return Err(VisualError::ModelUnavailable(format!(
                "encoder returned {} dimensions, expected {}",
                vector.len(),
                self.dimensions()
            )));
        }

        Ok(vector)
    }

    fn worker_sender(&self) -> Result<Sender<EncodeJob>, VisualError> {
        let mut worker = self.worker.lock();
        if let Some(sender) = worker.as_ref() {
            return Ok(sender.clone());
        }

        let (tx, rx) = crossbeam_channel::bounded::<EncodeJob>(QUEUE_CAPACITY);
        let encoder = self.inner.clone();
        std::thread::Builder::new()
            .name("image-encoder".to_string())
            .spawn(move || run_worker(encoder, rx))
            .map_err(|e| VisualError::ModelUnavailable(format!("failed to spawn encoder: {}", e)))?;

        *worker = Some(tx.clone());
        Ok(tx)
    }
}

/// Worker loop; exits when every sender is dropped
fn run_worker(encoder: Arc<dyn ImageEncoder>, jobs: Receiver<EncodeJob>) {
    for job in jobs {
        if job.abandoned() {
            debug!("Skipping abandoned encode for {}", encoder.model_version());
            continue;
        }

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| encoder.encode(&job.image)))
            .unwrap_or_else(|_| Err(EncodeError::Failed("encoder panicked".to_string())));
        let _ = job.reply.send(result);
    }
}

/// Scale a vector to unit length in place; zero vectors are left as is
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
