use crate::notifier::NotificationSender;
use crate::settings::{RuntimeSettings, SettingsHandle};
use image::RgbImage;
use lookout_core::analysis::{AnalysisError, FaceAnalyzer, SharedAnalyzer};
use lookout_core::{
    CaptureDebouncer, EuclideanMatcher, GalleryStore, Greetings, Identity, KnownThrottle, Matcher,
    Observation, SnapshotCell, TrackingKey,
};
use lookout_hw::{Frame, FrameSource, SourceError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ACQUIRE_ATTEMPTS: u32 = 3;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(50);

/// What happened to the faces of one frame.
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    pub faces: usize,
    pub recognized: Vec<String>,
    pub greeted: Vec<String>,
    pub captured: Vec<String>,
    /// Faces skipped because classification or capture failed.
    pub skipped: usize,
}

/// Per-frame reaction logic: classify, then throttle or debounce.
pub struct Pipeline {
    matcher: EuclideanMatcher,
    gallery: Arc<SnapshotCell>,
    tolerance: f32,
    throttle: KnownThrottle,
    greetings: Greetings,
    debouncer: CaptureDebouncer,
    capture_margin: u32,
    capture_message: String,
    store: Arc<GalleryStore>,
    notifications: NotificationSender,
}

pub struct PipelineParts {
    pub gallery: Arc<SnapshotCell>,
    pub tolerance: f32,
    pub cooldown: Duration,
    pub greetings: Greetings,
    pub capture_threshold: u32,
    pub capture_margin: u32,
    /// Queued after a capture is saved; empty to stay silent.
    pub capture_message: String,
    pub store: Arc<GalleryStore>,
    pub notifications: NotificationSender,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            matcher: EuclideanMatcher,
            gallery: parts.gallery,
            tolerance: parts.tolerance,
            throttle: KnownThrottle::new(parts.cooldown),
            greetings: parts.greetings,
            debouncer: CaptureDebouncer::new(parts.capture_threshold),
            capture_margin: parts.capture_margin,
            capture_message: parts.capture_message,
            store: parts.store,
            notifications: parts.notifications,
        }
    }

    /// Detect, encode and react to every face in `image`.
    ///
    /// Only detection/encoding failures abort the frame; a face that cannot
    /// be classified or saved is logged and skipped.
    pub fn process_frame(
        &mut self,
        analyzer: &mut dyn FaceAnalyzer,
        image: &RgbImage,
        now: Instant,
        settings: RuntimeSettings,
    ) -> Result<FrameOutcome, AnalysisError> {
        let regions = analyzer.detect(image)?;
        let mut outcome = FrameOutcome {
            faces: regions.len(),
            ..Default::default()
        };
        if regions.is_empty() {
            return Ok(outcome);
        }

        let templates = analyzer.encode(image, &regions)?;
        if templates.len() != regions.len() {
            tracing::warn!(
                regions = regions.len(),
                templates = templates.len(),
                "encoder returned a different number of templates; extra faces skipped"
            );
            outcome.skipped += regions.len().saturating_sub(templates.len());
        }
        let snapshot = self.gallery.current();

        for (region, template) in regions.iter().zip(&templates) {
            let identity = match self.matcher.classify(template, &snapshot, self.tolerance) {
                Ok(identity) => identity,
                Err(err) => {
                    tracing::warn!(error = %err, "face not classified; skipped");
                    outcome.skipped += 1;
                    continue;
                }
            };

            match identity {
                Identity::Known { name, distance } => {
                    tracing::debug!(name = %name, distance, "recognized");
                    if settings.notifications_enabled && self.throttle.should_notify(&name, now) {
                        let text = self.greetings.resolve(&name);
                        if self.notifications.send(text) {
                            tracing::info!(name = %name, distance, "greeting queued");
                            outcome.greeted.push(name.clone());
                        }
                    }
                    outcome.recognized.push(name);
                }
                Identity::Unknown { nearest } => {
                    tracing::debug!(?nearest, "unknown face");
                    if !settings.capture_unknown {
                        continue;
                    }
                    match self.debouncer.observe(TrackingKey::from(region)) {
                        Observation::Capture => {}
                        Observation::Accumulating(_) | Observation::AlreadyCaptured => continue,
                    }
                    let padded = region.expand(self.capture_margin, image.width(), image.height());
                    let Some(crop) = padded.crop(image) else {
                        tracing::warn!(?region, "capture region outside frame; skipped");
                        outcome.skipped += 1;
                        continue;
                    };
                    match self.store.save_pending(&crop, template) {
                        Ok(capture_id) => {
                            if settings.notifications_enabled && !self.capture_message.is_empty() {
                                self.notifications.send(self.capture_message.clone());
                            }
                            outcome.captured.push(capture_id);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "failed to save unknown face");
                            outcome.skipped += 1;
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }
}

/// Handle to the frame-loop thread.
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Ask the loop to stop after the current frame and wait for it.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
    }
}

/// Spawn the frame loop on a dedicated OS thread.
///
/// The loop owns the frame source and the pipeline; dropping the pipeline
/// on exit drops its notification sender.
pub fn spawn_engine(
    mut source: Box<dyn FrameSource>,
    analyzer: SharedAnalyzer,
    mut pipeline: Pipeline,
    settings: SettingsHandle,
    frames: Arc<AtomicU64>,
) -> EngineHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let thread = std::thread::Builder::new()
        .name("lookout-engine".into())
        .spawn(move || {
            tracing::info!(source = %source.describe(), "engine thread started");
            while flag.load(Ordering::SeqCst) {
                let frame = match acquire(source.as_mut(), &flag) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "no frame after retries; releasing source");
                        source.release();
                        continue;
                    }
                };

                let current = settings.snapshot();
                let result = {
                    let mut analyzer = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
                    pipeline.process_frame(&mut **analyzer, &frame.image, Instant::now(), current)
                };
                match result {
                    Ok(outcome) if outcome.faces > 0 => {
                        tracing::debug!(seq = frame.sequence, ?outcome, "frame processed");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(seq = frame.sequence, error = %err, "frame skipped"),
                }
                frames.fetch_add(1, Ordering::Relaxed);
            }
            source.release();
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        running,
        thread: Some(thread),
    }
}

fn acquire(source: &mut dyn FrameSource, running: &AtomicBool) -> Result<Frame, SourceError> {
    let mut attempt = 1;
    loop {
        match source.acquire_frame() {
            Ok(frame) => return Ok(frame),
            Err(err) if attempt < ACQUIRE_ATTEMPTS && running.load(Ordering::SeqCst) => {
                tracing::debug!(attempt, error = %err, "frame acquisition failed; retrying");
                std::thread::sleep(ACQUIRE_BACKOFF * attempt);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
