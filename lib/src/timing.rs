//! Scoped step timers.
//!
//! A [`Timer`] emits a `start` event when created and a `finish` event
//! with the elapsed time when dropped, on every exit path.  Labels are
//! hierarchical (dot-joined); parallel steps that share a label are told
//! apart by a per-process instance id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// A scoped timer; see the module docs.
#[derive(Debug)]
pub struct Timer {
    label: String,
    instance: u64,
    started: Instant,
}

impl Timer {
    /// Start a timer, emitting the `start` event.
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        debug!(label = %label, instance, "start");
        Self {
            label,
            instance,
            started: Instant::now(),
        }
    }

    /// Start a nested timer labelled `<parent>.<suffix>`.
    pub fn nested(&self, suffix: &str) -> Timer {
        Timer::start(format!("{}.{}", self.label, suffix))
    }

    /// The timer's label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        debug!(label = %self.label, instance = self.instance, elapsed_ms, "finish");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_labels() {
        let outer = Timer::start("build");
        let inner = outer.nested("layers");
        let leaf = inner.nested("classes");
        assert_eq!(leaf.label(), "build.layers.classes");
    }

    #[test]
    fn test_instances_are_distinct() {
        let a = Timer::start("step");
        let b = Timer::start("step");
        assert_ne!(a.instance, b.instance);
    }
}
