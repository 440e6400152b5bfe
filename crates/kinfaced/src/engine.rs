use image::RgbImage;
use kinface_core::{
    EnrollReceipt, EnrollmentError, EnrollmentService, RecognitionError, RecognitionResult,
    RecognitionService,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollmentError),
    #[error(transparent)]
    Recognize(#[from] RecognitionError),
    #[error("request exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Enroll {
        images: Vec<RgbImage>,
        name: String,
        relation: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<EnrollReceipt, EnrollmentError>>,
    },
    Recognize {
        image: RgbImage,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Vec<RecognitionResult>, RecognitionError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Request enrollment of a new person from decoded photos.
    pub async fn enroll(
        &self,
        images: Vec<RgbImage>,
        name: String,
        relation: String,
    ) -> Result<EnrollReceipt, EngineError> {
        self.call(|cancel, reply| EngineRequest::Enroll {
            images,
            name,
            relation,
            cancel,
            reply,
        })
        .await
    }

    /// Request recognition of every face in a decoded image.
    pub async fn recognize(&self, image: RgbImage) -> Result<Vec<RecognitionResult>, EngineError> {
        self.call(|cancel, reply| EngineRequest::Recognize {
            image,
            cancel,
            reply,
        })
        .await
    }

    /// Send a request and wait for its reply within the deadline.
    ///
    /// On timeout the request's token is cancelled so the engine abandons it
    /// before touching the roster. The store checks the token under its lock
    /// before writing; a deadline that passes while the write itself is in
    /// progress still reports `Timeout`, and the person remains enrolled.
    async fn call<T, E>(
        &self,
        build: impl FnOnce(CancellationToken, oneshot::Sender<Result<T, E>>) -> EngineRequest,
    ) -> Result<T, EngineError>
    where
        EngineError: From<E>,
    {
        let cancel = CancellationToken::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = build(cancel.clone(), reply_tx);

        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(reply) => Ok(reply??),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout = ?self.timeout, "engine request timed out; cancelled");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Embedding extraction is CPU-bound, so enroll and recognize requests run
/// one at a time off the async runtime. Requests cancelled while queued are
/// dropped without running.
pub fn spawn_engine(
    enroll: EnrollmentService,
    recognize: RecognitionService,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("kinface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        images,
                        name,
                        relation,
                        cancel,
                        reply,
                    } => {
                        if cancel.is_cancelled() {
                            let _ = reply.send(Err(EnrollmentError::Cancelled));
                            continue;
                        }
                        let result = enroll.enroll(&images, &name, &relation, &cancel);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize {
                        image,
                        cancel,
                        reply,
                    } => {
                        if cancel.is_cancelled() {
                            let _ = reply.send(Err(RecognitionError::Cancelled));
                            continue;
                        }
                        let result = recognize.recognize(&image, &cancel);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}
