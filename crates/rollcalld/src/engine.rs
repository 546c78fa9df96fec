//! Capture thread for one kiosk session.
//!
//! The thread owns the camera and the face encoder. It classifies every frame
//! against the gallery loaded at session start and publishes the result as a
//! [`Snapshot`] on a watch channel, so readers always see the newest frame and
//! never queue stale ones. Enrollment runs on the same thread, between frames,
//! because it needs the encoder.

use image::GrayImage;
use rollcall_core::{
    classify_frame, register_face, BoundingBox, DirGallery, DistanceMatcher, EncoderError,
    EnrollError, Enrollment, FaceEncoder, FaceGallery, GalleryError, Identity,
};
use rollcall_hw::{Camera, CameraError, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("enrollment error: {0}")]
    Enroll(#[from] EnrollError),
    #[error("no camera frame captured yet")]
    NoFrame,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The most recent classified frame.
#[derive(Debug)]
pub struct Snapshot {
    pub image: Arc<GrayImage>,
    pub identity: Identity,
    pub distance: Option<f32>,
    /// Face boxes in frame coordinates.
    pub boxes: Vec<BoundingBox>,
    /// Frames classified so far this session, starting at 1.
    pub sequence: u64,
}

/// Blocking supplier of grayscale frames.
pub trait FrameSource {
    fn next_image(&mut self) -> Result<GrayImage, CameraError>;
}

impl FrameSource for FrameStream<'_> {
    fn next_image(&mut self) -> Result<GrayImage, CameraError> {
        self.next_frame()?
            .into_image()
            .ok_or_else(|| CameraError::CaptureFailed("frame buffer shorter than its dimensions".into()))
    }
}

/// A camera that can be opened on the engine thread.
///
/// `capture` opens the device, hands a live source to `session` for as long as
/// it runs, then releases the device before returning.
pub trait CaptureDevice: Send + 'static {
    fn capture(self: Box<Self>, session: &mut dyn FnMut(&mut dyn FrameSource)) -> Result<(), CameraError>;
}

/// A V4L2 device node.
pub struct V4lDevice {
    pub path: String,
    pub warmup_frames: usize,
}

impl CaptureDevice for V4lDevice {
    fn capture(self: Box<Self>, session: &mut dyn FnMut(&mut dyn FrameSource)) -> Result<(), CameraError> {
        let camera = Camera::open(&self.path)?;
        let mut stream = camera.stream()?;

        // Discard warmup frames for camera AGC/AE stabilization
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                let _ = stream.next_frame();
            }
        }

        session(&mut stream);
        drop(stream);
        drop(camera);
        tracing::info!(device = %self.path, "camera released");
        Ok(())
    }
}

/// What the engine thread needs for a session.
pub struct EngineContext {
    pub encoder: Box<dyn FaceEncoder + Send>,
    pub matcher: DistanceMatcher,
    pub gallery: DirGallery,
    pub classify_scale: f32,
}

/// Returned by the engine thread on join.
pub struct EngineExit {
    /// Handed back so the next session can reuse the loaded models.
    pub encoder: Box<dyn FaceEncoder + Send>,
    /// Why the thread stopped on its own, if it did.
    pub failure: Option<EngineError>,
}

enum EngineRequest {
    Enroll {
        label: String,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
}

/// Session-side handle. Dropping it asks the thread to stop.
pub struct EngineHandle {
    requests: mpsc::Sender<EngineRequest>,
    snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<EngineExit>>,
}

impl EngineHandle {
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every new snapshot and errors once the thread exits.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshots.clone()
    }

    /// Wait for the first classified frame.
    pub async fn first_frame(&self) -> Result<Arc<Snapshot>, EngineError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::ChannelClosed)?
            .clone();
        snapshot.ok_or(EngineError::NoFrame)
    }

    /// Enroll the face in the latest frame under `label`.
    pub async fn enroll(&self, label: String) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(EngineRequest::Enroll {
                label,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the capture loop and join the thread. The camera is released
    /// before this returns. `None` if the thread panicked.
    pub async fn shutdown(mut self) -> Option<EngineExit> {
        self.running.store(false, Ordering::Release);
        let thread = self.thread.take()?;

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(_)) => {
                tracing::error!("engine thread panicked");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to join engine thread");
                None
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The device is opened on that thread. Open failures end the thread and show
/// up as a closed snapshot channel plus [`EngineExit::failure`].
pub fn spawn_engine(context: EngineContext, device: Box<dyn CaptureDevice>) -> Result<EngineHandle, EngineError> {
    let (requests_tx, mut requests_rx) = mpsc::channel::<EngineRequest>(4);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);

    let thread = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut context = context;
            let mut failure = None;

            let opened = device.capture(&mut |source: &mut dyn FrameSource| {
                if let Err(e) = capture_loop(source, &mut context, &mut requests_rx, &snapshot_tx, &thread_running) {
                    failure = Some(e);
                }
            });
            if let Err(e) = opened {
                failure = Some(e.into());
            }

            thread_running.store(false, Ordering::Release);
            match &failure {
                Some(e) => tracing::error!(error = %e, "engine stopped"),
                None => tracing::info!("engine thread exiting"),
            }
            EngineExit {
                encoder: context.encoder,
                failure,
            }
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        requests: requests_tx,
        snapshots: snapshot_rx,
        running,
        thread: Some(thread),
    })
}

fn capture_loop(
    source: &mut dyn FrameSource,
    context: &mut EngineContext,
    requests: &mut mpsc::Receiver<EngineRequest>,
    snapshots: &watch::Sender<Option<Arc<Snapshot>>>,
    running: &AtomicBool,
) -> Result<(), EngineError> {
    let gallery = context.gallery.load_all(&mut *context.encoder)?;
    tracing::info!(enrolled = gallery.len(), "gallery loaded");

    let mut latest: Option<Arc<GrayImage>> = None;
    let mut sequence = 0u64;

    while running.load(Ordering::Acquire) {
        while let Ok(request) = requests.try_recv() {
            handle_request(request, latest.as_deref(), context);
        }

        let image = Arc::new(source.next_image()?);
        let classification = classify_frame(
            &mut context.encoder,
            &context.matcher,
            &image,
            &gallery,
            context.classify_scale,
        )?;
        sequence += 1;

        tracing::trace!(
            sequence,
            identity = %classification.identity,
            faces = classification.boxes.len(),
            distance = ?classification.distance,
            "frame classified"
        );

        snapshots.send_replace(Some(Arc::new(Snapshot {
            image: Arc::clone(&image),
            identity: classification.identity,
            distance: classification.distance,
            boxes: classification.boxes,
            sequence,
        })));
        latest = Some(image);
    }

    Ok(())
}

fn handle_request(request: EngineRequest, latest: Option<&GrayImage>, context: &mut EngineContext) {
    match request {
        EngineRequest::Enroll { label, reply } => {
            let result = match latest {
                Some(frame) => register_face(
                    &label,
                    frame,
                    &mut *context.encoder,
                    &context.matcher,
                    &context.gallery,
                )
                .map_err(EngineError::from),
                None => Err(EngineError::NoFrame),
            };
            let _ = reply.send(result);
        }
    }
}
