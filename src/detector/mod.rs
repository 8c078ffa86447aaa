//! Object detection on camera frames.
//!
//! The model itself is external; the bridge only sees [`Detector`], which
//! maps frame bytes to scored class labels. [`DetectionResult`] is the
//! per-device summary the engine keeps and diffs.

mod http;

pub use http::HttpDetector;

use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

/// One labelled box reported by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Detection {
    pub class: String,
    pub score: f32,
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &[u8], max_results: usize) -> Result<Vec<Detection>>;
}

/// Occurrence count per object class.
///
/// Every stored count is at least 1; an absent class has no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
    counts: BTreeMap<String, u32>,
}

impl DetectionResult {
    /// Count detections scoring at or above `threshold`.
    pub fn from_detections<'a>(
        detections: impl IntoIterator<Item = &'a Detection>,
        threshold: f32,
    ) -> Self {
        let mut counts = BTreeMap::new();
        for detection in detections {
            if detection.score >= threshold && !detection.class.is_empty() {
                *counts.entry(detection.class.clone()).or_insert(0) += 1;
            }
        }
        Self { counts }
    }

    pub fn count(&self, class: &str) -> u32 {
        self.counts.get(class).copied().unwrap_or(0)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.counts.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for DetectionResult {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        Self {
            counts: iter
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(class, count)| (class.into(), count))
                .collect(),
        }
    }
}

/// Presence facts to publish when `new` replaces `old`.
///
/// Every class in `new` is reported present; every class only in `old` is
/// reported absent. Classes are returned in name order.
pub fn presence_changes(old: Option<&DetectionResult>, new: &DetectionResult) -> Vec<(String, bool)> {
    let mut changes: Vec<(String, bool)> = new.classes().map(|c| (c.to_string(), true)).collect();
    if let Some(old) = old {
        changes.extend(
            old.classes()
                .filter(|class| !new.contains(class))
                .map(|class| (class.to_string(), false)),
        );
    }
    changes.sort();
    changes
}
