//! Capture/process pipeline.
//!
//! The capture loop pulls frames continuously and hands at most one at a time
//! to a processing task running on its own thread. The task owns the analyzer
//! while it runs and hands it back when it finishes, so a second task can
//! never start before the first is done. Frames arriving while a task is in
//! flight are dropped.

use doorman_core::{CosineMatcher, EmbeddingStore, FaceAnalyzer, MatchResult, Matcher};
use doorman_hw::{Frame, VideoSource};
use image::{imageops, GrayImage};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("video source exhausted")]
    SourceExhausted,
    #[error("{0} consecutive capture failures")]
    TooManyCaptureFailures(u32),
    #[error("processing thread lost the analyzer")]
    AnalyzerLost,
    #[error("spawning processing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What the live display shows.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    AwaitingDetection,
    NoFaceDetected,
    Matched(MatchResult),
    Error(String),
}

impl Status {
    pub fn text(&self) -> String {
        match self {
            Status::AwaitingDetection => "awaiting detection".to_string(),
            Status::NoFaceDetected => "no face detected".to_string(),
            Status::Matched(result) => result.display_text(),
            Status::Error(_) => "error in processing".to_string(),
        }
    }
}

/// Invoked from the processing task for every authorized face.
///
/// Implementations must not block for long: the next frame is not processed
/// until the task returns.
pub trait AccessHandler: Send + Sync {
    fn granted(&self, identity: &str, confidence: f32, face: &GrayImage);
}

/// State shared between the capture loop and its processing task. Only the
/// pipeline mutates it; everyone else reads.
pub struct PipelineContext {
    store: Arc<EmbeddingStore>,
    threshold: f32,
    processing: AtomicBool,
    display: watch::Sender<Status>,
    handler: Box<dyn AccessHandler>,
}

impl PipelineContext {
    pub fn new(store: Arc<EmbeddingStore>, threshold: f32, handler: Box<dyn AccessHandler>) -> Self {
        let (display, _) = watch::channel(Status::AwaitingDetection);
        Self {
            store,
            threshold,
            processing: AtomicBool::new(false),
            display,
            handler,
        }
    }

    /// Whether a processing task is in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Subscribe to display updates.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.display.subscribe()
    }

    pub fn status(&self) -> Status {
        self.display.borrow().clone()
    }
}

/// Clears the processing flag when the task ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Slot<A> {
    Idle(A),
    Busy(JoinHandle<A>),
    Lost,
}

/// Counters for one [`Pipeline::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub dark: u64,
    pub dropped: u64,
    pub processed: u64,
}

pub struct Pipeline<A: FaceAnalyzer + 'static> {
    ctx: Arc<PipelineContext>,
    slot: Slot<A>,
    mirror: bool,
    max_capture_failures: u32,
    display: watch::Receiver<Status>,
    stats: RunStats,
}

impl<A: FaceAnalyzer + 'static> Pipeline<A> {
    pub fn new(ctx: Arc<PipelineContext>, analyzer: A) -> Self {
        let display = ctx.subscribe();
        Self {
            ctx,
            slot: Slot::Idle(analyzer),
            mirror: false,
            max_capture_failures: 100,
            display,
            stats: RunStats::default(),
        }
    }

    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_max_capture_failures(mut self, max: u32) -> Self {
        self.max_capture_failures = max.max(1);
        self
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Pull frames from `source` until `stop` is set or the source fails for
    /// good. The in-flight task, if any, always runs to completion before
    /// this returns.
    pub fn run<S: VideoSource>(
        &mut self,
        source: &mut S,
        stop: &AtomicBool,
    ) -> Result<RunStats, PipelineError> {
        let result = self.capture_loop(source, stop);
        let drained = self.drain();
        result.and(drained).map(|()| self.stats)
    }

    fn capture_loop<S: VideoSource>(
        &mut self,
        source: &mut S,
        stop: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let mut failures = 0u32;

        while !stop.load(Ordering::Relaxed) {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    failures = 0;
                    self.tick(frame)?;
                }
                Ok(None) => return Err(PipelineError::SourceExhausted),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "frame capture failed");
                    if failures >= self.max_capture_failures {
                        return Err(PipelineError::TooManyCaptureFailures(failures));
                    }
                }
            }
            self.render();
        }
        Ok(())
    }

    /// One capture tick: start a processing task for `frame` if none is in
    /// flight, otherwise drop the frame. Never waits for a task.
    pub fn tick(&mut self, mut frame: Frame) -> Result<(), PipelineError> {
        self.stats.frames += 1;
        self.poll()?;

        if frame.is_dark {
            self.stats.dark += 1;
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
            return Ok(());
        }
        if !matches!(self.slot, Slot::Idle(_)) {
            self.stats.dropped += 1;
            return Ok(());
        }

        if self.mirror {
            frame.mirror();
        }
        let sequence = frame.sequence;
        let Some(image) = frame.into_gray_image() else {
            tracing::warn!(sequence, "frame buffer does not match its dimensions");
            return Ok(());
        };

        let Slot::Idle(mut analyzer) = std::mem::replace(&mut self.slot, Slot::Lost) else {
            return Err(PipelineError::AnalyzerLost);
        };
        let ctx = Arc::clone(&self.ctx);
        ctx.processing.store(true, Ordering::Release);

        let handle = std::thread::Builder::new()
            .name("doorman-process".into())
            .spawn(move || {
                let _guard = ProcessingGuard(&ctx.processing);
                let status = panic::catch_unwind(AssertUnwindSafe(|| process(&mut analyzer, &image, &ctx)))
                    .unwrap_or_else(|_| Status::Error("processing task panicked".to_string()));
                if let Status::Error(reason) = &status {
                    tracing::warn!(sequence, reason = %reason, "frame processing failed");
                }
                ctx.display.send_replace(status);
                analyzer
            });

        match handle {
            Ok(handle) => {
                self.slot = Slot::Busy(handle);
                self.stats.processed += 1;
                Ok(())
            }
            Err(e) => {
                self.ctx.processing.store(false, Ordering::Release);
                Err(PipelineError::Spawn(e))
            }
        }
    }

    /// Reclaim the analyzer if the in-flight task has finished. Non-blocking.
    fn poll(&mut self) -> Result<(), PipelineError> {
        if let Slot::Busy(handle) = &self.slot {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        self.reclaim()
    }

    /// Wait for the in-flight task, if any.
    pub fn drain(&mut self) -> Result<(), PipelineError> {
        self.reclaim()
    }

    fn reclaim(&mut self) -> Result<(), PipelineError> {
        match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Busy(handle) => match handle.join() {
                Ok(analyzer) => self.slot = Slot::Idle(analyzer),
                Err(_) => return Err(PipelineError::AnalyzerLost),
            },
            Slot::Idle(analyzer) => self.slot = Slot::Idle(analyzer),
            Slot::Lost => return Err(PipelineError::AnalyzerLost),
        }
        Ok(())
    }

    /// Show the latest status. Headless, so a changed status is logged.
    fn render(&mut self) {
        if self.display.has_changed().unwrap_or(false) {
            let status = self.display.borrow_and_update().text();
            tracing::info!(status = %status, "display");
        }
    }
}

/// Detect, embed and match every face in `image`.
///
/// Per-face failures are logged and skipped. The returned status is that of
/// the last face processed, except that an authorized result is kept once
/// seen.
fn process<A: FaceAnalyzer + ?Sized>(analyzer: &mut A, image: &GrayImage, ctx: &PipelineContext) -> Status {
    let faces = match analyzer.detect(image) {
        Ok(faces) => faces,
        Err(e) => return Status::Error(e.to_string()),
    };
    if faces.is_empty() {
        return Status::NoFaceDetected;
    }

    let snapshot = ctx.store.read();
    let matcher = CosineMatcher;
    let mut shown: Option<MatchResult> = None;

    for face in &faces {
        let probe = match analyzer.embed(image, face) {
            Ok(embedding) => embedding.normalized(),
            Err(e) => {
                tracing::warn!(error = %e, confidence = face.confidence, "face skipped");
                continue;
            }
        };
        let Some(probe) = probe else {
            tracing::warn!("face skipped: zero-norm embedding");
            continue;
        };

        let result = matcher.compare(&probe, &snapshot, ctx.threshold);
        tracing::debug!(
            authorized = result.authorized,
            identity = result.identity.as_deref().unwrap_or("-"),
            distance = result.distance.unwrap_or(f32::NAN),
            confidence = result.confidence,
            "face matched"
        );

        if let (true, Some(identity)) = (result.authorized, result.identity.as_deref()) {
            let crop = face_crop(image, face);
            ctx.handler.granted(identity, result.confidence, &crop);
        }

        if !shown.as_ref().is_some_and(|s| s.authorized) {
            shown = Some(result);
        }
    }

    match shown {
        Some(result) => Status::Matched(result),
        None => Status::Error("no face could be embedded".to_string()),
    }
}

/// The face region clamped to the frame; the whole frame if the box is
/// entirely outside it.
fn face_crop(image: &GrayImage, face: &doorman_core::BoundingBox) -> GrayImage {
    match face.clamped_rect(image.width(), image.height()) {
        Some((x, y, w, h)) => imageops::crop_imm(image, x, y, w, h).to_image(),
        None => image.clone(),
    }
}
