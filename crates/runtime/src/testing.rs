//! In-memory transport and a wired-up engine for the unit tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bumblebee_scheduler::{Clock, ManualClock, Scheduler, SchedulerOptions};
use bumblebee_store::{NewNote, RecordStore, RedbRecordStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use tempfile::TempDir;

use crate::context::AppContext;
use crate::engine::Engine;
use crate::session::{Session, SessionStore};
use crate::transport::{ChatId, Incoming, IncomingKind, MessageId, Transport, UserRef, View};

/// Records every message it is asked to show.
#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicI64,
    sent: Mutex<Vec<(ChatId, View)>>,
    rendered: Mutex<Vec<View>>,
    deleted: Mutex<Vec<MessageId>>,
    answered: AtomicUsize,
}

impl FakeTransport {
    /// Every view sent or edited, in order.
    pub fn rendered(&self) -> Vec<View> {
        self.rendered.lock().unwrap().clone()
    }

    pub fn last(&self) -> View {
        self.rendered().pop().unwrap_or_default()
    }

    /// Views sent as new messages to `chat`.
    pub fn sent_to(&self, chat: ChatId) -> Vec<View> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == chat)
            .map(|(_, view)| view.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, chat: ChatId, view: &View) -> Result<MessageId> {
        self.sent.lock().unwrap().push((chat, view.clone()));
        self.rendered.lock().unwrap().push(view.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn edit(&self, _chat: ChatId, _message: MessageId, view: &View) -> Result<()> {
        self.rendered.lock().unwrap().push(view.clone());
        Ok(())
    }

    async fn delete(&self, _chat: ChatId, message: MessageId) -> Result<()> {
        self.deleted.lock().unwrap().push(message);
        Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str) -> Result<()> {
        self.answered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// One user talking to an engine backed by temporary databases.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub transport: Arc<FakeTransport>,
    pub clock: Arc<ManualClock>,
    pub user: UserRef,
    pub chat: ChatId,
    presses: AtomicUsize,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(chrono_tz::UTC, Duration::zero())
    }

    pub fn with_timezone(timezone: Tz) -> Self {
        Self::build(timezone, Duration::zero())
    }

    /// The scheduler's clock runs `skew` ahead of the engine's, so times the
    /// engine accepts as future can already be past for the scheduler.
    pub fn with_scheduler_skew(skew: Duration) -> Self {
        Self::build(chrono_tz::UTC, skew)
    }

    fn build(timezone: Tz, skew: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let scheduler_clock: Arc<dyn Clock> = if skew.is_zero() {
            clock.clone()
        } else {
            Arc::new(ManualClock::new(start_time() + skew))
        };

        let store = RedbRecordStore::open(dir.path().join("records.redb")).unwrap();
        let scheduler = Scheduler::open(
            dir.path().join("jobs.redb"),
            scheduler_clock,
            SchedulerOptions::default(),
        )
        .unwrap();
        let transport = Arc::new(FakeTransport::default());

        let ctx = AppContext {
            bot_name: "Bumblebee".to_string(),
            timezone,
            store: Arc::new(store),
            scheduler: Arc::new(scheduler),
            transport: transport.clone(),
            clock: clock.clone(),
            sessions: Arc::new(SessionStore::new()),
        };

        Self {
            engine: Arc::new(Engine::new(ctx)),
            transport,
            clock,
            user: UserRef {
                id: 42,
                display_name: "driver".to_string(),
            },
            chat: 4200,
            presses: AtomicUsize::new(0),
            _dir: dir,
        }
    }

    async fn deliver(&self, kind: IncomingKind) -> View {
        self.engine
            .handle(Incoming {
                user: self.user.clone(),
                chat: self.chat,
                kind,
            })
            .await;
        self.transport.last()
    }

    pub async fn command(&self, name: &str) -> View {
        self.deliver(IncomingKind::Command(name.to_string())).await
    }

    pub async fn text(&self, text: &str) -> View {
        self.deliver(IncomingKind::Text(text.to_string())).await
    }

    pub async fn photo(&self, file_id: &str) -> View {
        self.deliver(IncomingKind::Photo {
            file_id: file_id.to_string(),
        })
        .await
    }

    /// Press a button on the last bot message.
    pub async fn press(&self, data: &str) -> View {
        let n = self.presses.fetch_add(1, Ordering::SeqCst);
        let message_id = self.session().await.scratch.last_bot_message;
        self.deliver(IncomingKind::Button {
            callback_id: format!("cb{n}"),
            message_id,
            data: data.to_string(),
        })
        .await
    }

    pub async fn session(&self) -> Session {
        self.engine.ctx.sessions.lock(self.user.id).await.clone()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.engine.ctx.store
    }

    pub fn note(&self, title: &str) -> NewNote {
        NewNote {
            title: title.to_string(),
            body: None,
            created_at: self.clock.now(),
        }
    }
}
