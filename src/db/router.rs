//! Round-robin selection over read replicas.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out read targets in strict rotation.
///
/// The cursor is a single atomic counter, so concurrent callers each get the next
/// target without locking. Over `k * n` calls each of `n` targets is chosen `k` times.
#[derive(Debug)]
pub struct ReadRouter<T> {
    targets: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> ReadRouter<T> {
    pub fn new(targets: Vec<T>) -> Self {
        Self {
            targets,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next target in rotation; `None` when there are no targets.
    pub fn next(&self) -> Option<&T> {
        if self.targets.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        self.targets.get(idx)
    }

    /// Restart the rotation at the first target.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn targets(&self) -> &[T] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
