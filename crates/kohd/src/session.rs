//! Client sessions.
//!
//! A client registers once, then refers to the faces of its last
//! prediction by index when accepting. Predictions are kept per session so
//! two reviewers never accept each other's faces.

use chrono::{DateTime, Utc};
use koh_core::PredictionResult;
use std::collections::HashMap;
use uuid::Uuid;

pub struct Session {
    pub registered_at: DateTime<Utc>,
    /// Results of the session's most recent prediction, in detection order.
    pub predictions: Vec<PredictionResult>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Session {
                registered_at: Utc::now(),
                predictions: Vec::new(),
            },
        );
        id
    }

    /// Returns whether the session existed.
    pub fn unregister(&mut self, id: &Uuid) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Replace the session's predictions. Returns `false` for an unknown
    /// session.
    pub fn set_predictions(&mut self, id: &Uuid, predictions: Vec<PredictionResult>) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.predictions = predictions;
                true
            }
            None => false,
        }
    }

    pub fn prediction(&self, id: &Uuid, index: usize) -> Option<&PredictionResult> {
        self.sessions.get(id)?.predictions.get(index)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use koh_core::{FaceImage, FaceRect, Identity};

    fn result(identity: &str) -> PredictionResult {
        PredictionResult {
            face: FaceImage::filled(4, 4, 0).unwrap(),
            rect: FaceRect::new(0, 0, 4, 4),
            identity: Identity::new(identity).unwrap(),
            confidence: 1.0,
        }
    }

    #[test]
    fn test_register_unregister() {
        let mut reg = SessionRegistry::new();
        let a = reg.register();
        let b = reg.register();
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert!(reg.get(&a).unwrap().registered_at <= Utc::now());

        assert!(reg.unregister(&a));
        assert!(!reg.unregister(&a));
        assert!(reg.get(&a).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_predictions_are_per_session() {
        let mut reg = SessionRegistry::new();
        let a = reg.register();
        let b = reg.register();

        assert!(reg.set_predictions(&a, vec![result("1"), result("2")]));
        assert_eq!(reg.prediction(&a, 1).unwrap().identity.as_str(), "2");
        assert!(reg.prediction(&a, 2).is_none());
        assert!(reg.prediction(&b, 0).is_none());

        // A new prediction replaces the old list.
        assert!(reg.set_predictions(&a, vec![result("3")]));
        assert_eq!(reg.prediction(&a, 0).unwrap().identity.as_str(), "3");
        assert!(reg.prediction(&a, 1).is_none());
    }

    #[test]
    fn test_unknown_session() {
        let mut reg = SessionRegistry::new();
        let ghost = Uuid::new_v4();
        assert!(!reg.set_predictions(&ghost, vec![result("1")]));
        assert!(reg.prediction(&ghost, 0).is_none());
    }
}
