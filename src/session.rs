//! Training-session context.
//!
//! A session is created once per training run and handed by reference to
//! every component. It holds the validated configuration, the cooperative
//! cancellation flag and the optional occupation dump.

use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::TrainingConfig;
use crate::error::Result;

/// State occupation of one pattern, one column per emitting state.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupationRecord {
    /// Pattern or utterance identifier.
    pub id: String,
    /// `T x S` occupation probabilities.
    pub gamma: Array2<f64>,
}

/// Requests cancellation of a running session from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Stop before the next pattern starts.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct TrainingSession {
    config: TrainingConfig,
    cancelled: Arc<AtomicBool>,
    occupation: Option<Mutex<Vec<OccupationRecord>>>,
}

impl TrainingSession {
    /// Validate `config` and open a session.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let occupation = config.dump_occupation.then(|| Mutex::new(Vec::new()));
        Ok(Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            occupation,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancelled),
        }
    }

    /// Checked only between patterns.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn dumps_occupation(&self) -> bool {
        self.occupation.is_some()
    }

    pub(crate) fn record_occupation(&self, id: String, gamma: Array2<f64>) {
        if let Some(sink) = &self.occupation {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(OccupationRecord { id, gamma });
        }
    }

    /// Drain the records collected so far.
    pub fn take_occupation(&self) -> Vec<OccupationRecord> {
        match &self.occupation {
            Some(sink) => std::mem::take(&mut *sink.lock().unwrap_or_else(PoisonError::into_inner)),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_refused() {
        let config = TrainingConfig::new().with_max_iterations(0);
        assert!(TrainingSession::new(config).is_err());
    }

    #[test]
    fn test_cancel_handle() {
        let session = TrainingSession::new(TrainingConfig::default()).unwrap();
        assert!(!session.is_cancelled());
        session.cancel_handle().cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn test_occupation_sink() {
        let session = TrainingSession::new(TrainingConfig::default()).unwrap();
        session.record_occupation("ignored".to_string(), Array2::zeros((1, 1)));
        assert!(session.take_occupation().is_empty());

        let session =
            TrainingSession::new(TrainingConfig::default().with_dump_occupation(true)).unwrap();
        session.record_occupation("u1".to_string(), Array2::zeros((2, 3)));
        let records = session.take_occupation();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "u1");
        assert!(session.take_occupation().is_empty());
    }
}
