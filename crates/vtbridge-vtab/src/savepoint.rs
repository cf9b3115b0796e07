//! Nested savepoint bookkeeping.
//!
//! Savepoint ids are nesting depths handed out by the engine. Rolling back
//! to `r` keeps `r` itself (it can be rolled back to again) and forgets
//! every deeper point; releasing `m` forgets `m` and everything deeper.
//! Forgotten points are dropped without running any module logic.

/// Ordered list of `(id, state)` restore points.
#[derive(Debug, Clone)]
pub struct SavepointStack<S> {
    points: Vec<(i32, S)>,
}

impl<S> Default for SavepointStack<S> {
    fn default() -> Self {
        Self { points: Vec::new() }
    }
}

impl<S> SavepointStack<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a restore point. An existing point with the same or a deeper
    /// id is replaced.
    pub fn savepoint(&mut self, id: i32, state: S) {
        self.points.retain(|(p, _)| *p < id);
        self.points.push((id, state));
    }

    /// Forget every point deeper than `id` and return the state recorded
    /// at `id`, or `None` if `id` was never recorded.
    pub fn rollback_to(&mut self, id: i32) -> Option<&S> {
        self.points.retain(|(p, _)| *p <= id);
        self.points
            .last()
            .filter(|(p, _)| *p == id)
            .map(|(_, state)| state)
    }

    /// Forget `id` and every deeper point.
    pub fn release(&mut self, id: i32) {
        self.points.retain(|(p, _)| *p < id);
    }

    /// Forget everything (transaction end).
    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn ids(&self) -> Vec<i32> {
        self.points.iter().map(|(p, _)| *p).collect()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.points.iter().any(|(p, _)| *p == id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
