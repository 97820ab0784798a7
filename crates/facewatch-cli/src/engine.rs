use facewatch_core::{
    FaceDetector, FrameSource, IdentityMatcher, PipelineError, PixelFormat, RawFrame,
    RecognitionOutcome, RecognitionPipeline,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("recognition already in flight")]
    Busy,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A raw camera frame owned for the trip to the engine thread.
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub row_stride: Option<usize>,
    pub format: PixelFormat,
    pub sequence: u64,
}

impl OwnedFrame {
    fn as_raw(&self) -> RawFrame<'_> {
        let raw = RawFrame::new(&self.data, self.width, self.height, self.format);
        match self.row_stride {
            Some(stride) => raw.with_row_stride(stride),
            None => raw,
        }
    }
}

type Reply = oneshot::Sender<Result<RecognitionOutcome, EngineError>>;

/// Messages sent from the acquisition loop to the engine thread.
enum EngineRequest {
    Recognize { frame: OwnedFrame, reply: Reply },
    SetRotationCompensation(i32),
}

/// Clone-safe handle to the engine thread.
///
/// At most one recognition is in flight: frames offered while the engine
/// is busy are dropped and counted.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    busy: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl EngineHandle {
    /// Offer a frame. Returns `None` (frame dropped) while a previous
    /// recognition is still outstanding.
    pub fn try_submit(
        &self,
        frame: OwnedFrame,
    ) -> Option<oneshot::Receiver<Result<RecognitionOutcome, EngineError>>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(seq = frame.sequence, "engine busy; dropping frame");
            return None;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let sequence = frame.sequence;
        if self
            .tx
            .try_send(EngineRequest::Recognize { frame, reply: reply_tx })
            .is_err()
        {
            self.busy.store(false, Ordering::Release);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(seq = sequence, "engine queue unavailable; dropping frame");
            return None;
        }
        Some(reply_rx)
    }

    /// Submit a frame and wait for its outcome.
    pub async fn recognize(&self, frame: OwnedFrame) -> Result<RecognitionOutcome, EngineError> {
        let reply = self.try_submit(frame).ok_or(EngineError::Busy)?;
        reply.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Update the device rotation compensation for subsequent frames.
    pub async fn set_rotation_compensation(&self, degrees: i32) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::SetRotationCompensation(degrees))
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the recognition engine on a dedicated OS thread.
///
/// The thread owns the pipeline and detector and exits once every
/// [`EngineHandle`] is dropped, disposing the pipeline on the way out.
pub fn spawn_engine<M, D>(
    mut pipeline: RecognitionPipeline<M>,
    mut detector: D,
    queue_depth: usize,
) -> Result<(EngineHandle, std::thread::JoinHandle<()>), EngineError>
where
    M: IdentityMatcher + Send + 'static,
    D: FaceDetector + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let busy = Arc::new(AtomicBool::new(false));
    let thread_busy = Arc::clone(&busy);

    let join = std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frame, reply } => {
                        let started = std::time::Instant::now();
                        let result = pipeline
                            .recognize_frame(FrameSource::Raw(frame.as_raw()), &mut detector)
                            .map_err(EngineError::from);
                        tracing::debug!(
                            seq = frame.sequence,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            matched = result.as_ref().map(|o| o.matched.len()).unwrap_or(0),
                            "frame processed"
                        );
                        // Clear before replying so the receiver can submit the next frame at once.
                        thread_busy.store(false, Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::SetRotationCompensation(degrees) => {
                        tracing::debug!(degrees, "rotation compensation updated");
                        pipeline.set_rotation_compensation(degrees);
                    }
                }
            }
            pipeline.dispose();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok((
        EngineHandle {
            tx,
            busy,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        join,
    ))
}
