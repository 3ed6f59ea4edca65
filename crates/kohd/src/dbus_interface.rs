use crate::engine::{EngineError, EngineHandle};
use crate::session::SessionRegistry;
use koh_core::{Identity, PredictionResult, RecognitionEngine};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.koh.Recognizer1";
pub const OBJECT_PATH: &str = "/org/koh/Recognizer1";

/// D-Bus interface for the koh recognition daemon.
///
/// Bus name: org.koh.Recognizer1
/// Object path: /org/koh/Recognizer1
pub struct KohService {
    engine: EngineHandle,
    sessions: Mutex<SessionRegistry>,
    threshold: f64,
    timeout: Duration,
}

impl KohService {
    pub fn new(engine: EngineHandle, threshold: f64, timeout: Duration) -> Self {
        Self {
            engine,
            sessions: Mutex::new(SessionRegistry::new()),
            threshold,
            timeout,
        }
    }

    /// Await an engine request, bounded by the configured timeout. A timed
    /// out request keeps running on the engine thread, so commits and
    /// corrections may still land after the caller was told `Failed`.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> fdo::Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "engine request failed");
                Err(fdo::Error::Failed(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "engine request timed out");
                Err(fdo::Error::Failed(format!(
                    "engine did not answer within {}s; the request may still complete, \
                     check Status before retrying",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    fn prediction_json(&self, index: usize, r: &PredictionResult) -> serde_json::Value {
        serde_json::json!({
            "index": index,
            "identity": r.identity,
            "confidence": r.confidence,
            "matched": RecognitionEngine::is_match(r.confidence, self.threshold),
            "x": r.rect.x,
            "y": r.rect.y,
            "width": r.rect.width,
            "height": r.rect.height,
        })
    }
}

fn parse_session(session: &str) -> fdo::Result<Uuid> {
    Uuid::parse_str(session)
        .map_err(|_| fdo::Error::InvalidArgs(format!("malformed session id: {session}")))
}

fn parse_identity(identity: &str) -> fdo::Result<Identity> {
    Identity::new(identity).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.koh.Recognizer1")]
impl KohService {
    /// Open a review session. Returns its id.
    async fn register(&self) -> String {
        let id = self.sessions.lock().await.register();
        tracing::info!(session = %id, "session registered");
        id.to_string()
    }

    /// Close a review session. Returns false if it was not open.
    async fn unregister(&self, session: &str) -> fdo::Result<bool> {
        let id = parse_session(session)?;
        let mut sessions = self.sessions.lock().await;
        let Some(registered_at) = sessions.get(&id).map(|s| s.registered_at) else {
            return Ok(false);
        };
        sessions.unregister(&id);
        let age = chrono::Utc::now() - registered_at;
        tracing::info!(session = %id, age_secs = age.num_seconds(), "session closed");
        Ok(true)
    }

    /// Detect and predict every face in an image file on the daemon's
    /// filesystem. Returns a JSON array, one object per face.
    async fn predict(&self, session: &str, path: &str) -> fdo::Result<String> {
        let id = parse_session(session)?;
        if self.sessions.lock().await.get(&id).is_none() {
            return Err(fdo::Error::InvalidArgs(format!("unknown session: {id}")));
        }
        tracing::info!(session = %id, path, "predict requested");

        let results = self.call(self.engine.predict_file(PathBuf::from(path))).await?;
        let json: Vec<_> = results
            .iter()
            .enumerate()
            .map(|(i, r)| self.prediction_json(i, r))
            .collect();

        // The session may have closed while the engine was busy.
        if !self.sessions.lock().await.set_predictions(&id, results) {
            return Err(fdo::Error::InvalidArgs(format!("unknown session: {id}")));
        }
        Ok(serde_json::Value::Array(json).to_string())
    }

    /// Queue face `index` of the session's last prediction for training.
    /// Returns the identity it was queued under.
    async fn accept(&self, session: &str, index: u32) -> fdo::Result<String> {
        let id = parse_session(session)?;
        let result = self
            .sessions
            .lock()
            .await
            .prediction(&id, index as usize)
            .cloned()
            .ok_or_else(|| {
                fdo::Error::InvalidArgs(format!("no prediction {index} in session {id}"))
            })?;
        let identity = result.identity.to_string();
        self.call(self.engine.accept(result)).await?;
        Ok(identity)
    }

    /// Relabel a pending face. Returns the renamed corpus file, or an
    /// empty string when nothing on disk was renamed.
    async fn correct(&self, old: &str, new: &str) -> fdo::Result<String> {
        let old = parse_identity(old)?;
        let new = parse_identity(new)?;
        tracing::info!(old = %old, new = %new, "correct requested");
        let renamed = self.call(self.engine.correct(old, new)).await?;
        Ok(renamed
            .map(|p| p.display().to_string())
            .unwrap_or_default())
    }

    /// Train on and save the pending face of `identity`. Returns the path
    /// of the new corpus file.
    async fn commit(&self, identity: &str) -> fdo::Result<String> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, "commit requested");
        let path = self.call(self.engine.commit(identity)).await?;
        Ok(path.display().to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.call(self.engine.status()).await?;
        let sessions = self.sessions.lock().await.len();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "confidence_threshold": self.threshold,
            "sessions": sessions,
            "recognizer": status,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{id, stripes, trained_handle};
    use koh_core::ImageStore;

    fn service(dir: &std::path::Path) -> KohService {
        KohService::new(trained_handle(dir), 100.0, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_review_flow() {
        let dir = tempfile::tempdir().unwrap();
        ImageStore::new(dir.path())
            .with_extension("png")
            .save(&id("4"), &stripes(24, 3))
            .unwrap();
        let svc = service(dir.path());
        let probe = dir.path().join("probe.png");
        koh_core::codec::save_grayscale_new(&stripes(24, 3), &probe).unwrap();

        let session = svc.register().await;
        let json = svc.predict(&session, probe.to_str().unwrap()).await.unwrap();
        let faces: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(faces[0]["identity"], "4");
        assert_eq!(faces[0]["matched"], true);
        assert_eq!(faces[0]["width"], 24);

        assert_eq!(svc.accept(&session, 0).await.unwrap(), "4");
        let shown = |name: &str| dir.path().join(name).display().to_string();
        assert_eq!(svc.correct("4", "8").await.unwrap(), shown("identity8.000.png"));
        assert_eq!(svc.commit("8").await.unwrap(), shown("identity8.001.png"));

        let status: serde_json::Value =
            serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(status["sessions"], 1);
        assert_eq!(status["recognizer"]["identities"], 1);
        assert_eq!(status["recognizer"]["records"], 2);

        assert!(svc.unregister(&session).await.unwrap());
        assert!(!svc.unregister(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_warns_request_may_complete() {
        let dir = tempfile::tempdir().unwrap();
        let svc = KohService::new(trained_handle(dir.path()), 100.0, Duration::from_millis(20));

        let stalled = std::future::pending::<Result<(), EngineError>>();
        let err = svc.call(stalled).await.unwrap_err();

        match err {
            fdo::Error::Failed(msg) => assert!(msg.contains("may still complete"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let session = svc.register().await;
        let err = svc.accept(&session, 0).await.unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ghost = Uuid::new_v4().to_string();
        for session in ["not-a-uuid", ghost.as_str()] {
            let err = svc.predict(session, "/x.png").await.unwrap_err();
            assert!(matches!(err, fdo::Error::InvalidArgs(_)), "{session}");
        }
        let err = svc.commit("bad id").await.unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
    }
}
