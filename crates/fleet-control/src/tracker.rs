//! Tracks the live control session of each node
//!
//! A node that reconnects before its old TCP connection times out would
//! otherwise run two sessions; registering the new one aborts the old.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct SessionTracker {
    /// node_id -> (session number, task)
    sessions: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session task, aborting whatever the node had before
    pub fn register(&self, node_id: String, session: u64, handle: JoinHandle<()>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some((old_session, old_handle)) = sessions.remove(&node_id) {
                debug!(node_id = %node_id, old_session, session, "Replacing node session");
                old_handle.abort();
            }
            sessions.insert(node_id, (session, handle));
        }
    }

    /// Forget a session that ended on its own; a newer session is left alone
    pub fn finish(&self, node_id: &str, session: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(node_id).is_some_and(|(s, _)| *s == session) {
                sessions.remove(node_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every tracked task, for draining at shutdown
    pub fn drain(&self) -> Vec<JoinHandle<()>> {
        match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, (_, handle))| handle).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await })
    }

    #[tokio::test]
    async fn test_newer_session_replaces_older() {
        let tracker = SessionTracker::new();

        let first = sleeper();
        let first_abort = first.abort_handle();
        tracker.register("node-a".to_string(), 1, first);
        tracker.register("node-a".to_string(), 2, sleeper());

        assert_eq!(tracker.len(), 1);
        for _ in 0..100 {
            if first_abort.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(first_abort.is_finished());
    }

    #[tokio::test]
    async fn test_finish_ignores_stale_session() {
        let tracker = SessionTracker::new();
        tracker.register("node-a".to_string(), 2, sleeper());

        tracker.finish("node-a", 1);
        assert_eq!(tracker.len(), 1);

        tracker.finish("node-a", 2);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_tracker() {
        let tracker = SessionTracker::new();
        tracker.register("node-a".to_string(), 1, sleeper());
        tracker.register("node-b".to_string(), 1, sleeper());

        let handles = tracker.drain();
        assert_eq!(handles.len(), 2);
        assert!(tracker.is_empty());
        for handle in handles {
            handle.abort();
        }
    }
}
