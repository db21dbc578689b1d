//! Per-user update lanes.
//!
//! Updates of one user are handled strictly in arrival order, one at a time,
//! while different users run in parallel.  [`UpdateQueue::push`] is
//! synchronous, so the order in which the polling loop pushes is the order
//! the engine sees.  A lane's task exits after sitting idle; the next update
//! for that user opens a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bumblebee_store::UserId;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::engine::Engine;
use crate::transport::Incoming;

pub const LANE_IDLE: Duration = Duration::from_secs(60);

type Lanes = Arc<Mutex<HashMap<UserId, UnboundedSender<Incoming>>>>;

pub struct UpdateQueue {
    engine: Arc<Engine>,
    lanes: Lanes,
    idle: Duration,
}

impl UpdateQueue {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_idle(engine, LANE_IDLE)
    }

    pub fn with_idle(engine: Arc<Engine>, idle: Duration) -> Self {
        Self {
            engine,
            lanes: Arc::default(),
            idle,
        }
    }

    /// Queue `update` behind the user's earlier updates.  Must be called
    /// from within a tokio runtime.
    pub fn push(&self, update: Incoming) {
        let user = update.user.id;
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());

        let update = match lanes.get(&user) {
            Some(lane) => match lane.send(update) {
                Ok(()) => return,
                // The lane's task is gone; open a new one below.
                Err(mpsc::error::SendError(update)) => update,
            },
            None => update,
        };

        let (lane, rx) = mpsc::unbounded_channel();
        // `rx` is alive here, so this cannot fail.
        let _ = lane.send(update);
        lanes.insert(user, lane.clone());
        drop(lanes);

        debug!(user_id = user, "update lane opened");
        tokio::spawn(drain(
            self.engine.clone(),
            self.lanes.clone(),
            user,
            lane,
            rx,
            self.idle,
        ));
    }

    /// Users with a live lane.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

async fn drain(
    engine: Arc<Engine>,
    lanes: Lanes,
    user: UserId,
    lane: UnboundedSender<Incoming>,
    mut rx: UnboundedReceiver<Incoming>,
    idle: Duration,
) {
    loop {
        let next = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(update)) => Some(update),
            Ok(None) => None,
            Err(_) => {
                // Retire the lane under the map lock so no push can slip in
                // between the emptiness check and the removal.
                let mut lanes = lanes.lock().unwrap_or_else(|p| p.into_inner());
                match rx.try_recv() {
                    Ok(update) => Some(update),
                    Err(_) => {
                        if lanes.get(&user).is_some_and(|l| l.same_channel(&lane)) {
                            lanes.remove(&user);
                        }
                        None
                    }
                }
            }
        };

        match next {
            Some(update) => engine.handle(update).await,
            None => break,
        }
    }
    debug!(user_id = user, "update lane closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testing::Harness;
    use crate::transport::{Incoming, IncomingKind};

    use super::UpdateQueue;

    fn text(h: &Harness, text: &str) -> Incoming {
        Incoming {
            user: h.user.clone(),
            chat: h.chat,
            kind: IncomingKind::Text(text.to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_users_updates_keep_arrival_order() {
        for _ in 0..25 {
            let h = Harness::new();
            h.command("start").await;
            h.press("profile").await;
            h.press("add_vehicle").await;

            let queue = UpdateQueue::new(h.engine.clone());
            queue.push(text(&h, "Civic"));
            queue.push(text(&h, "2020"));

            let vehicles = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let vehicles = h.store().vehicles(h.user.id).await.unwrap();
                    if !vehicles.is_empty() && h.session().await.dialog.is_none() {
                        return vehicles;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();

            assert_eq!(vehicles.len(), 1);
            assert_eq!(vehicles[0].name, "Civic");
            assert_eq!(vehicles[0].year, 2020);
        }
    }

    #[tokio::test]
    async fn idle_lane_is_retired_and_reopened() {
        let h = Harness::new();
        h.command("start").await;
        let queue = UpdateQueue::with_idle(h.engine.clone(), Duration::from_millis(20));

        queue.push(text(&h, "hello"));
        assert_eq!(queue.active_lanes(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.active_lanes(), 0);

        let before = h.transport.answered();
        queue.push(Incoming {
            user: h.user.clone(),
            chat: h.chat,
            kind: IncomingKind::Button {
                callback_id: "cb".into(),
                message_id: None,
                data: "notes".into(),
            },
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.transport.answered() == before {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.transport.last().text, "You have no notes.");
    }
}
