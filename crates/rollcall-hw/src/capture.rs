//! Bounded frame capture sequencing.
//!
//! A capture acquires exactly `frame_count` usable frames at a fixed
//! interval. A sequence that cannot be completed is an error; callers never
//! receive fewer frames than they asked for.

use crate::camera::CameraError;
use crate::frame::{self, Frame};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Fraction of near-black pixels above which a frame is discarded.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
/// Granularity at which an inter-frame wait polls for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capture incomplete: wanted {wanted} frames, got {got}")]
    Incomplete { wanted: usize, got: usize },
    #[error("stream interrupted after {got} of {wanted} frames: {source}")]
    Interrupted {
        wanted: usize,
        got: usize,
        source: CameraError,
    },
    #[error("capture aborted")]
    Aborted,
    #[error("invalid capture plan: {0}")]
    InvalidPlan(String),
}

/// How many frames to take and how far apart.
#[derive(Debug, Clone)]
pub struct CapturePlan {
    pub frame_count: usize,
    pub interval: Duration,
    /// Raw reads allowed per requested frame before giving up on dark frames.
    pub attempts_per_frame: usize,
}

impl Default for CapturePlan {
    fn default() -> Self {
        Self {
            frame_count: 8,
            interval: Duration::from_millis(400),
            attempts_per_frame: 3,
        }
    }
}

impl CapturePlan {
    pub fn new(frame_count: usize, interval: Duration) -> Self {
        Self {
            frame_count,
            interval,
            ..Self::default()
        }
    }

    fn max_attempts(&self) -> usize {
        self.frame_count.saturating_mul(self.attempts_per_frame.max(1))
    }
}

/// Anything that can produce a capture sequence: a V4L2 camera, or a test double.
pub trait FrameSource: Send {
    fn capture_sequence(
        &mut self,
        plan: &CapturePlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<Frame>, CaptureError>;
}

/// Drive one capture sequence over a per-frame reader.
///
/// Dark frames are skipped and count against the attempt budget. The token
/// is checked before every read and during every inter-frame wait; an
/// aborted sequence discards everything it collected.
pub fn run_sequence<F>(
    plan: &CapturePlan,
    cancel: &CancellationToken,
    mut next_frame: F,
) -> Result<Vec<Frame>, CaptureError>
where
    F: FnMut() -> Result<Frame, CameraError>,
{
    let wanted = plan.frame_count;
    if wanted == 0 {
        return Err(CaptureError::InvalidPlan("frame_count must be at least 1".into()));
    }

    let max_attempts = plan.max_attempts();
    let mut frames = Vec::with_capacity(wanted.min(64));
    let mut attempts = 0usize;
    let mut dark_skipped = 0usize;

    while frames.len() < wanted {
        if cancel.is_cancelled() {
            tracing::info!(got = frames.len(), wanted, "capture aborted; discarding frames");
            return Err(CaptureError::Aborted);
        }
        if attempts >= max_attempts {
            tracing::warn!(got = frames.len(), wanted, dark_skipped, "capture attempt budget exhausted");
            return Err(CaptureError::Incomplete {
                wanted,
                got: frames.len(),
            });
        }
        if attempts > 0 {
            wait(plan.interval, cancel)?;
        }
        attempts += 1;

        let mut frame = match next_frame() {
            Ok(frame) => frame,
            Err(source) if frames.is_empty() => return Err(CaptureError::Camera(source)),
            Err(source) => {
                return Err(CaptureError::Interrupted {
                    wanted,
                    got: frames.len(),
                    source,
                })
            }
        };

        frame.is_dark = frame::is_dark_frame(&frame.data, DARK_FRAME_THRESHOLD);
        if frame.is_dark {
            dark_skipped += 1;
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            continue;
        }
        frames.push(frame);
    }

    tracing::debug!(captured = frames.len(), attempts, dark_skipped, "capture sequence complete");
    Ok(frames)
}

/// Sleep for `interval`, waking early with `Aborted` if the token fires.
fn wait(interval: Duration, cancel: &CancellationToken) -> Result<(), CaptureError> {
    let deadline = std::time::Instant::now() + interval;
    loop {
        if cancel.is_cancelled() {
            return Err(CaptureError::Aborted);
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn bright(seq: u32) -> Frame {
        Frame {
            data: vec![128u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            timestamp: Instant::now(),
            sequence: seq,
            is_dark: false,
        }
    }

    fn dark(seq: u32) -> Frame {
        Frame {
            data: vec![0u8; 4 * 4 * 3],
            ..bright(seq)
        }
    }

    fn fast_plan(count: usize) -> CapturePlan {
        CapturePlan::new(count, Duration::ZERO)
    }

    #[test]
    fn test_default_plan() {
        let plan = CapturePlan::default();
        assert_eq!(plan.frame_count, 8);
        assert_eq!(plan.interval, Duration::from_millis(400));
    }

    #[test]
    fn test_collects_exactly_requested_frames() {
        let mut seq = 0;
        let frames = run_sequence(&fast_plan(8), &CancellationToken::new(), || {
            seq += 1;
            Ok(bright(seq))
        })
        .unwrap();
        assert_eq!(frames.len(), 8);
        assert_eq!(seq, 8, "no extra reads after the sequence is complete");
    }

    #[test]
    fn test_dark_frames_are_skipped() {
        let mut seq = 0;
        let frames = run_sequence(&fast_plan(2), &CancellationToken::new(), || {
            seq += 1;
            Ok(if seq % 2 == 1 { dark(seq) } else { bright(seq) })
        })
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| !f.is_dark));
    }

    #[test]
    fn test_all_dark_is_incomplete_not_padded() {
        let result = run_sequence(&fast_plan(3), &CancellationToken::new(), || Ok(dark(0)));
        match result {
            Err(CaptureError::Incomplete { wanted, got }) => {
                assert_eq!(wanted, 3);
                assert_eq!(got, 0);
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn test_interrupted_stream_is_failure() {
        let mut seq = 0;
        let result = run_sequence(&fast_plan(8), &CancellationToken::new(), || {
            seq += 1;
            if seq > 2 {
                Err(CameraError::CaptureFailed("stream ended".into()))
            } else {
                Ok(bright(seq))
            }
        });
        match result {
            Err(CaptureError::Interrupted { wanted, got, .. }) => {
                assert_eq!(wanted, 8);
                assert_eq!(got, 2);
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }

    #[test]
    fn test_first_read_failure_is_camera_error() {
        let result = run_sequence(&fast_plan(8), &CancellationToken::new(), || {
            Err(CameraError::AccessDenied("/dev/video0".into()))
        });
        assert!(matches!(
            result,
            Err(CaptureError::Camera(CameraError::AccessDenied(_)))
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_sequence(&fast_plan(8), &cancel, || Ok(bright(0)));
        assert!(matches!(result, Err(CaptureError::Aborted)));
    }

    #[test]
    fn test_cancel_mid_sequence_discards_frames() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut seq = 0;
        let result = run_sequence(&fast_plan(8), &cancel, || {
            seq += 1;
            if seq == 3 {
                trigger.cancel();
            }
            Ok(bright(seq))
        });
        assert!(matches!(result, Err(CaptureError::Aborted)));
    }

    #[test]
    fn test_zero_frames_rejected() {
        let result = run_sequence(&fast_plan(0), &CancellationToken::new(), || Ok(bright(0)));
        assert!(matches!(result, Err(CaptureError::InvalidPlan(_))));
    }

    #[test]
    fn test_huge_plan_budget_saturates() {
        let plan = CapturePlan {
            frame_count: usize::MAX,
            interval: Duration::ZERO,
            attempts_per_frame: 3,
        };
        assert_eq!(plan.max_attempts(), usize::MAX);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut seq = 0;
        let result = run_sequence(&plan, &cancel, || {
            seq += 1;
            if seq == 4 {
                trigger.cancel();
            }
            Ok(bright(seq))
        });
        assert!(matches!(result, Err(CaptureError::Aborted)));
    }

    #[test]
    fn test_interval_is_respected() {
        let plan = CapturePlan::new(3, Duration::from_millis(30));
        let start = Instant::now();
        run_sequence(&plan, &CancellationToken::new(), || Ok(bright(0))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
