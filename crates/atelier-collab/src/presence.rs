//! Presence: who is in a document, where their cursor is, whether they are
//! idle. Never persisted.
//!
//! Departures are announced only after a short grace period so a transient
//! reconnect does not flap join/leave for everyone else.

use atelier_ot::{transform_cursor, Cursor, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Where presence changes are announced. The gateway implements this by
/// broadcasting to the document's clients; presence itself holds no
/// back-reference to the connection layer.
pub trait PresenceSink: Send + Sync {
    fn presence_joined(&self, document_id: &str, user_id: &str);
    fn presence_left(&self, document_id: &str, user_id: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: String,
    pub cursor: Option<Cursor>,
    pub idle: bool,
    pub last_activity: DateTime<Utc>,
}

struct ClientPresence {
    user_id: String,
    document_id: String,
    cursor: Option<Cursor>,
    last_activity: Instant,
    last_activity_wall: DateTime<Utc>,
}

struct PendingLeave {
    document_id: String,
    user_id: String,
    deadline: Instant,
}

pub struct PresenceTracker {
    sink: Arc<dyn PresenceSink>,
    leave_grace: Duration,
    idle_after: Duration,
    clients: Mutex<HashMap<String, ClientPresence>>,
    pending_leaves: Mutex<Vec<PendingLeave>>,
}

impl PresenceTracker {
    pub fn new(sink: Arc<dyn PresenceSink>, leave_grace: Duration, idle_after: Duration) -> Self {
        Self {
            sink,
            leave_grace,
            idle_after,
            clients: Mutex::new(HashMap::new()),
            pending_leaves: Mutex::new(Vec::new()),
        }
    }

    /// Register a client. A join within the grace window of that user's
    /// departure is treated as a transient reconnect: the pending leave is
    /// cancelled and no join is announced.
    pub fn join(&self, client_id: &str, user_id: &str, document_id: &str) {
        let was_pending = {
            let mut pending = self.pending_leaves.lock().unwrap();
            let before = pending.len();
            pending.retain(|p| !(p.document_id == document_id && p.user_id == user_id));
            pending.len() != before
        };

        self.clients.lock().unwrap().insert(
            client_id.to_string(),
            ClientPresence {
                user_id: user_id.to_string(),
                document_id: document_id.to_string(),
                cursor: None,
                last_activity: Instant::now(),
                last_activity_wall: Utc::now(),
            },
        );

        if !was_pending {
            self.sink.presence_joined(document_id, user_id);
        }
    }

    /// Schedule the client's departure announcement.
    pub fn disconnect(&self, client_id: &str) {
        let removed = self.clients.lock().unwrap().remove(client_id);
        if let Some(presence) = removed {
            self.pending_leaves.lock().unwrap().push(PendingLeave {
                document_id: presence.document_id,
                user_id: presence.user_id,
                deadline: Instant::now() + self.leave_grace,
            });
        }
    }

    pub fn update_cursor(&self, client_id: &str, cursor: Cursor) {
        if let Some(presence) = self.clients.lock().unwrap().get_mut(client_id) {
            presence.cursor = Some(cursor);
            presence.last_activity = Instant::now();
            presence.last_activity_wall = Utc::now();
        }
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(presence) = self.clients.lock().unwrap().get_mut(client_id) {
            presence.last_activity = Instant::now();
            presence.last_activity_wall = Utc::now();
        }
    }

    /// Shift every cursor in the document past an applied operation so
    /// remote cursors do not drift. The submitting client's cursor is left
    /// alone; its own edit already carries its position.
    pub fn transform_cursors(&self, document_id: &str, op: &Operation, exclude_client: &str) {
        let mut clients = self.clients.lock().unwrap();
        for (client_id, presence) in clients.iter_mut() {
            if presence.document_id != document_id || client_id == exclude_client {
                continue;
            }
            if let Some(cursor) = &presence.cursor {
                presence.cursor = Some(transform_cursor(cursor, op));
            }
        }
    }

    pub fn presence_for(&self, document_id: &str) -> Vec<PresenceInfo> {
        let clients = self.clients.lock().unwrap();
        clients
            .values()
            .filter(|p| p.document_id == document_id)
            .map(|p| PresenceInfo {
                user_id: p.user_id.clone(),
                cursor: p.cursor.clone(),
                idle: p.last_activity.elapsed() >= self.idle_after,
                last_activity: p.last_activity_wall,
            })
            .collect()
    }

    /// Users in the document (for cursor-cap checks).
    pub fn user_count(&self, document_id: &str) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.document_id == document_id)
            .count()
    }

    /// Announce departures whose grace period has expired. Returns how many
    /// leaves fired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingLeave> = {
            let mut pending = self.pending_leaves.lock().unwrap();
            let (fire, keep): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.deadline <= now);
            *pending = keep;
            fire
        };

        for leave in &expired {
            self.sink.presence_left(&leave.document_id, &leave.user_id);
        }
        expired.len()
    }

    /// Background sweep loop; exits on cancellation.
    pub async fn run_sweeper(self: Arc<Self>, ctx: atelier_types::Ctx) {
        let mut interval = tokio::time::interval(self.leave_grace.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = ctx.cancelled() => return,
            }
        }
    }
}
