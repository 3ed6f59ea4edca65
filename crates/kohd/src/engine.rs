use koh_core::{Config, Identity, PredictionResult, Recognizer, RecognizerError, Status};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Predict {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<PredictionResult>, EngineError>>,
    },
    Accept {
        result: PredictionResult,
        reply: oneshot::Sender<()>,
    },
    Correct {
        old: Identity,
        new: Identity,
        reply: oneshot::Sender<Result<Option<PathBuf>, EngineError>>,
    },
    Commit {
        identity: Identity,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<Status, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Load an image, detect every face and predict each one.
    pub async fn predict_file(&self, path: PathBuf) -> Result<Vec<PredictionResult>, EngineError> {
        self.request(|reply| EngineRequest::Predict { path, reply })
            .await?
    }

    /// Queue a prediction's face under its predicted identity.
    pub async fn accept(&self, result: PredictionResult) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Accept { result, reply })
            .await
    }

    pub async fn correct(
        &self,
        old: Identity,
        new: Identity,
    ) -> Result<Option<PathBuf>, EngineError> {
        self.request(|reply| EngineRequest::Correct { old, new, reply })
            .await?
    }

    /// Train on and persist the pending face of `identity`.
    pub async fn commit(&self, identity: Identity) -> Result<PathBuf, EngineError> {
        self.request(|reply| EngineRequest::Commit { identity, reply })
            .await?
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await?
    }
}

/// Build the recognizer from `config`, train it on the corpus, and run it
/// on a dedicated OS thread.
///
/// Fails fast if the detector model cannot be loaded or the corpus cannot
/// be listed.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let mut recognizer = Recognizer::from_config(config)?;
    let trained = recognizer.bulk_train_from_store()?;
    tracing::info!(
        faces = trained,
        dir = %config.faces_dir.display(),
        "initial training complete"
    );
    spawn_with(recognizer)
}

/// Run an already-built recognizer on the engine thread.
pub fn spawn_with(mut recognizer: Recognizer) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("koh-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut recognizer, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn handle(recognizer: &mut Recognizer, req: EngineRequest) {
    // A dropped receiver means the caller gave up; nothing to report.
    match req {
        EngineRequest::Predict { path, reply } => {
            let result = recognizer.predict_in_file(&path).map_err(EngineError::from);
            if let Ok(results) = &result {
                tracing::debug!(path = %path.display(), faces = results.len(), "predict");
            }
            let _ = reply.send(result);
        }
        EngineRequest::Accept { result, reply } => {
            recognizer.accept(result);
            let _ = reply.send(());
        }
        EngineRequest::Correct { old, new, reply } => {
            let _ = reply.send(recognizer.correct(&old, &new).map_err(EngineError::from));
        }
        EngineRequest::Commit { identity, reply } => {
            let _ = reply.send(recognizer.commit(&identity).map_err(EngineError::from));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(recognizer.status().map_err(EngineError::from));
        }
    }
}
