//! Per-device single-flight guard for frame analysis.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Set of devices with an analysis in flight.
///
/// Membership is held by an [`AnalysisPermit`]; dropping the permit removes
/// the device again, whichever way the analysis ends.
#[derive(Debug, Clone, Default)]
pub struct AnalysisGate {
    pending: Arc<Mutex<HashSet<String>>>,
}

impl AnalysisGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `device_id`, or `None` if an analysis for it is already running.
    pub fn try_acquire(&self, device_id: &str) -> Option<AnalysisPermit> {
        let inserted = self.pending.lock().insert(device_id.to_string());
        if !inserted {
            debug!("[Analysis] {} already has an analysis in flight", device_id);
            return None;
        }
        Some(AnalysisPermit {
            gate: self.clone(),
            device_id: device_id.to_string(),
        })
    }

    pub fn is_pending(&self, device_id: &str) -> bool {
        self.pending.lock().contains(device_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn release(&self, device_id: &str) {
        self.pending.lock().remove(device_id);
    }
}

/// Proof of membership in the pending set.
#[derive(Debug)]
pub struct AnalysisPermit {
    gate: AnalysisGate,
    device_id: String,
}

impl AnalysisPermit {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Release explicitly; equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for AnalysisPermit {
    fn drop(&mut self) {
        self.gate.release(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_per_device() {
        let gate = AnalysisGate::new();

        let permit = gate.try_acquire("cam-1");
        assert!(permit.is_some());
        assert!(gate.try_acquire("cam-1").is_none());
        assert!(gate.is_pending("cam-1"));

        permit.unwrap().release();
        assert!(!gate.is_pending("cam-1"));
        assert!(gate.try_acquire("cam-1").is_some());
    }

    #[test]
    fn test_devices_are_independent() {
        let gate = AnalysisGate::new();
        let _a = gate.try_acquire("cam-1").unwrap();
        let _b = gate.try_acquire("cam-2").unwrap();
        assert_eq!(gate.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_permit_released_when_task_is_aborted() {
        let gate = AnalysisGate::new();
        let permit = gate.try_acquire("cam-1").unwrap();

        let task = tokio::spawn(async move {
            let _permit = permit;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        assert!(gate.is_pending("cam-1"));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!gate.is_pending("cam-1"));
    }

    #[tokio::test]
    async fn test_permit_released_when_task_fails() {
        let gate = AnalysisGate::new();
        let permit = gate.try_acquire("cam-1").unwrap();

        let result = tokio::spawn(async move {
            let _permit = permit;
            Err::<(), &str>("detector unavailable")
        })
        .await
        .unwrap();

        assert!(result.is_err());
        assert!(gate.try_acquire("cam-1").is_some());
    }
}
