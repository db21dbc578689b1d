//! Per-user conversation state.
//!
//! Sessions live in memory only.  [`SessionStore::lock`] hands out an owned
//! guard that the engine holds for the whole update, so two updates of one
//! user never interleave.  Arrival order is kept by
//! [`UpdateQueue`](crate::queue::UpdateQueue), not by this lock.
//!
//! Sessions untouched for longer than the idle TTL are dropped; the user then
//! gets the same "session expired" fallback as after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bumblebee_store::{RecordId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::dialog::Dialog;
use crate::scene::SceneId;
use crate::transport::MessageId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scratch {
    /// Vehicle whose reminders the Reminders scene shows.
    pub vehicle_id: Option<RecordId>,
    /// Last message the bot sent to this user, replaced on the next render.
    pub last_bot_message: Option<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// `None` before the first `/start` and while a dialog runs.
    pub scene: Option<SceneId>,
    pub dialog: Option<Dialog>,
    pub scratch: Scratch,
}

impl Session {
    /// Forget the scene, the dialog and every selection.  The last bot
    /// message is kept so the next render can still replace it.
    pub fn reset(&mut self) {
        let last = self.scratch.last_bot_message;
        *self = Self::default();
        self.scratch.last_bot_message = last;
    }
}

pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Slot {
    session: Arc<Mutex<Session>>,
    touched: Instant,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Slot>>,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_idle_ttl(SESSION_IDLE_TTL)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Exclusive access to `user`'s session, created on first use.
    pub async fn lock(&self, user: UserId) -> OwnedMutexGuard<Session> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let now = Instant::now();
            let evicted = evict_idle(&mut sessions, now, self.idle_ttl);
            if evicted > 0 {
                debug!(evicted, "idle sessions dropped");
            }
            let slot = sessions.entry(user).or_insert_with(|| Slot {
                session: Arc::default(),
                touched: now,
            });
            slot.touched = now;
            slot.session.clone()
        };
        session.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Drop sessions idle for at least `ttl` that no update currently holds.
fn evict_idle(sessions: &mut HashMap<UserId, Slot>, now: Instant, ttl: Duration) -> usize {
    let before = sessions.len();
    sessions.retain(|_, slot| {
        now.duration_since(slot.touched) < ttl || Arc::strong_count(&slot.session) > 1
    });
    before - sessions.len()
}
