//! In-memory cursor of a single run.
//!
//! Owned by the run loop and dropped with it; nothing else reads or writes it.

use std::collections::HashSet;
use std::fmt;

use super::backend::ThreadId;

/// `task_id:phase_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseKey {
    pub task_id: String,
    pub phase_id: String,
}

impl PhaseKey {
    pub fn new(task_id: &str, phase_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
        }
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_id, self.phase_id)
    }
}

#[derive(Debug, Default)]
pub struct ExecutionCursor {
    /// The active thread and the task it is bound to.
    thread: Option<(String, ThreadId)>,
    completed: HashSet<PhaseKey>,
    /// Consecutive failing check runs of the most recently checked phase.
    check_failures: Option<(PhaseKey, u32)>,
}

impl ExecutionCursor {
    /// The active thread, if it is bound to `task_id`.
    pub fn thread_for(&self, task_id: &str) -> Option<&ThreadId> {
        self.thread
            .as_ref()
            .filter(|(bound, _)| bound == task_id)
            .map(|(_, thread)| thread)
    }

    pub fn bind_thread(&mut self, task_id: &str, thread: ThreadId) {
        self.thread = Some((task_id.to_string(), thread));
    }

    pub fn active_thread(&self) -> Option<&ThreadId> {
        self.thread.as_ref().map(|(_, thread)| thread)
    }

    pub fn is_completed(&self, key: &PhaseKey) -> bool {
        self.completed.contains(key)
    }

    pub fn mark_completed(&mut self, key: PhaseKey) {
        if self
            .check_failures
            .as_ref()
            .is_some_and(|(failed, _)| *failed == key)
        {
            self.check_failures = None;
        }
        self.completed.insert(key);
    }

    /// Record a failing check run and return the consecutive count for `key`.
    pub fn record_check_failure(&mut self, key: &PhaseKey) -> u32 {
        let count = match &self.check_failures {
            Some((failed, count)) if failed == key => count + 1,
            _ => 1,
        };
        self.check_failures = Some((key.clone(), count));
        count
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: &str) -> ThreadId {
        ThreadId::new(id).unwrap()
    }

    #[test]
    fn test_phase_key_display() {
        assert_eq!(PhaseKey::new("task-1", "review").to_string(), "task-1:review");
    }

    #[test]
    fn test_thread_binding_follows_task() {
        let mut cursor = ExecutionCursor::default();
        assert!(cursor.thread_for("task-1").is_none());

        cursor.bind_thread("task-1", thread("thr-1"));
        assert_eq!(cursor.thread_for("task-1"), Some(&thread("thr-1")));
        assert!(cursor.thread_for("task-2").is_none());

        cursor.bind_thread("task-2", thread("thr-2"));
        assert!(cursor.thread_for("task-1").is_none());
        assert_eq!(cursor.active_thread(), Some(&thread("thr-2")));
    }

    #[test]
    fn test_check_failures_are_consecutive_per_phase() {
        let mut cursor = ExecutionCursor::default();
        let a = PhaseKey::new("task-1", "tests");
        let b = PhaseKey::new("task-1", "implementation");

        assert_eq!(cursor.record_check_failure(&a), 1);
        assert_eq!(cursor.record_check_failure(&a), 2);
        assert_eq!(cursor.record_check_failure(&b), 1);
        assert_eq!(cursor.record_check_failure(&a), 1);

        cursor.mark_completed(a.clone());
        assert!(cursor.is_completed(&a));
        assert_eq!(cursor.record_check_failure(&a), 1);
        assert_eq!(cursor.completed_count(), 1);
    }
}
