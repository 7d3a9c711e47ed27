use rollcall_hw::frame::FrameError;
use rollcall_hw::{CameraError, CaptureError, CapturePlan, EncodedFrame, FrameSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] FrameError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Frames of one capture, JPEG-encoded and ready to upload.
#[derive(Debug, Clone)]
pub struct CapturedBatch {
    pub frames: Vec<EncodedFrame>,
    pub width: u32,
    pub height: u32,
}

/// Opens the frame source for one capture. Called on the engine thread.
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn FrameSource>, CameraError> + Send>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Capture {
        plan: CapturePlan,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<CapturedBatch, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture and encode `plan.frame_count` frames. Cancelling `cancel`
    /// stops the sequence and discards the frames.
    pub async fn capture(&self, plan: CapturePlan, cancel: CancellationToken) -> Result<CapturedBatch, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture {
                plan,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the capture engine on a dedicated OS thread.
///
/// The camera is opened per request through `open_source` and released
/// when the capture ends, so a device that disappears between captures
/// surfaces as an error on the next request instead of at startup.
pub fn spawn_engine(mut open_source: SourceOpener, jpeg_quality: u8) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { plan, cancel, reply } => {
                        let result = run_capture(&mut open_source, &plan, &cancel, jpeg_quality);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_capture(
    open_source: &mut SourceOpener,
    plan: &CapturePlan,
    cancel: &CancellationToken,
    jpeg_quality: u8,
) -> Result<CapturedBatch, EngineError> {
    if cancel.is_cancelled() {
        return Err(CaptureError::Aborted.into());
    }

    let mut source = open_source().map_err(CaptureError::Camera)?;
    let frames = source.capture_sequence(plan, cancel)?;
    drop(source);

    let (width, height) = frames.first().map(|f| (f.width, f.height)).unwrap_or((0, 0));
    let encoded = frames
        .iter()
        .enumerate()
        .map(|(index, frame)| {
            Ok(EncodedFrame {
                index,
                jpeg: frame.to_jpeg(jpeg_quality)?,
            })
        })
        .collect::<Result<Vec<_>, FrameError>>()?;

    if cancel.is_cancelled() {
        tracing::info!(frames = encoded.len(), "capture aborted after encoding; discarding frames");
        return Err(CaptureError::Aborted.into());
    }

    tracing::debug!(
        frames = encoded.len(),
        bytes = encoded.iter().map(|f| f.jpeg.len()).sum::<usize>(),
        "capture encoded"
    );

    Ok(CapturedBatch {
        frames: encoded,
        width,
        height,
    })
}
