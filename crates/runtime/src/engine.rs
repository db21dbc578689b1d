//! Update dispatch.
//!
//! [`Engine::handle`] takes one incoming update, locks the user's session
//! for the whole update and routes it: commands reset the session, free
//! text and photos feed the active dialog, button presses go through the
//! current scene's route table.  Failures end in a fallback view with a
//! path back to the menu; they never propagate to the polling loop.

use anyhow::Result;
use bumblebee_scheduler::JobKey;
use bumblebee_store::{EntityKind, RecordId, Reminder, UserId};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::dialog::{Flow, StepInput};
use crate::report::{DateRange, build_report};
use crate::scene::{
    Action, SESSION_EXPIRED, SceneId, cancel_button, fallback_view, numbered, numbered_buttons,
    scene_def,
};
use crate::session::Session;
use crate::transport::{
    Button, ChatId, Incoming, IncomingKind, MessageId, Placement, UserRef, View,
};

const FAILURE: &str = "Something went wrong. Open the main menu to continue.";

/// Where and how the current update renders.
pub(crate) struct Turn<'a> {
    pub user: &'a UserRef,
    pub chat: ChatId,
    /// Message carrying the pressed button, if any.
    pub anchor: Option<MessageId>,
    pub placement: Placement,
}

impl<'a> Turn<'a> {
    fn of(update: &'a Incoming) -> Self {
        match &update.kind {
            IncomingKind::Button { message_id, .. } => Self {
                user: &update.user,
                chat: update.chat,
                anchor: *message_id,
                placement: Placement::InPlace,
            },
            _ => Self {
                user: &update.user,
                chat: update.chat,
                anchor: None,
                placement: Placement::Bottom,
            },
        }
    }
}

pub struct Engine {
    pub(crate) ctx: AppContext,
}

impl Engine {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Handle one update end to end.
    pub async fn handle(&self, update: Incoming) {
        let user_id = update.user.id;
        let mut session = self.ctx.sessions.lock(user_id).await;
        let turn = Turn::of(&update);

        if let Err(err) = self.dispatch(&mut session, &turn, &update.kind).await {
            error!(user_id, ?err, "update handling failed");
            if let Err(err) = self.render(&mut session, &turn, fallback_view(FAILURE)).await {
                warn!(user_id, ?err, "could not render the fallback view");
            }
        }

        if let IncomingKind::Button { callback_id, .. } = &update.kind {
            if let Err(err) = self.ctx.transport.answer_callback(callback_id).await {
                debug!(user_id, ?err, "answer_callback failed");
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, turn: &Turn<'_>, kind: &IncomingKind) -> Result<()> {
        match kind {
            IncomingKind::Command(command) => match command.as_str() {
                "start" | "menu" => {
                    session.reset();
                    self.enter(session, turn, SceneId::Menu).await
                }
                other => {
                    debug!(user_id = turn.user.id, command = other, "unknown command ignored");
                    Ok(())
                }
            },
            IncomingKind::Text(text) => {
                if session.dialog.is_some() {
                    self.on_step_input(session, turn, StepInput::Text(text)).await
                } else {
                    debug!(user_id = turn.user.id, "free text outside a dialog ignored");
                    Ok(())
                }
            }
            IncomingKind::Photo { file_id } => {
                if session.dialog.is_some() {
                    self.on_step_input(session, turn, StepInput::Photo(file_id)).await
                } else {
                    debug!(user_id = turn.user.id, "photo outside a dialog ignored");
                    Ok(())
                }
            }
            IncomingKind::Button { data, .. } => self.on_button(session, turn, data).await,
        }
    }

    async fn on_button(&self, session: &mut Session, turn: &Turn<'_>, data: &str) -> Result<()> {
        if data == "main_menu" {
            session.reset();
            return self.enter(session, turn, SceneId::Menu).await;
        }

        if session.dialog.is_some() {
            return match data {
                "step:skip" => self.on_step_input(session, turn, StepInput::Skip).await,
                "step:cancel" => self.abandon_dialog(session, turn).await,
                _ => {
                    debug!(user_id = turn.user.id, data, "button ignored while a dialog runs");
                    Ok(())
                }
            };
        }

        let Some(scene) = session.scene else {
            debug!(user_id = turn.user.id, data, "button press without a scene");
            return self.render(session, turn, fallback_view(SESSION_EXPIRED)).await;
        };

        match scene_def(scene).route(data) {
            Some((action, arg)) => self.perform(session, turn, action, arg).await,
            None => {
                debug!(user_id = turn.user.id, ?scene, data, "unmatched button press");
                Ok(())
            }
        }
    }

    async fn perform(
        &self,
        session: &mut Session,
        turn: &Turn<'_>,
        action: Action,
        arg: Option<u64>,
    ) -> Result<()> {
        let user = turn.user.id;
        match (action, arg) {
            (Action::Goto(scene), _) => self.enter(session, turn, scene).await,
            (Action::Retake, _) => self.retake(session, turn).await,
            (Action::Start(Flow::AddReminder), _) => {
                if !self.selected_vehicle_exists(session, user).await? {
                    return self.retake(session, turn).await;
                }
                self.start_dialog(session, turn, Flow::AddReminder).await
            }
            (Action::Start(flow), _) => self.start_dialog(session, turn, flow).await,
            (Action::RemovalList(kind), _) => self.list(session, turn, kind, "remove").await,
            (Action::ViewList(kind), _) => self.list(session, turn, kind, "view").await,
            (Action::Remove(kind), Some(id)) => {
                self.remove(session, user, kind, id).await?;
                self.retake(session, turn).await
            }
            (Action::Show(kind), Some(id)) => self.show(session, turn, kind, id).await,
            (Action::PickVehicle, Some(id)) => {
                session.scratch.vehicle_id = Some(id);
                self.retake(session, turn).await
            }
            (Action::ChangeVehicle, _) => {
                session.scratch.vehicle_id = None;
                self.retake(session, turn).await
            }
            (Action::ReportMenu, _) => {
                let view = View::text("Choose the report period:")
                    .buttons(vec![
                        Button::new("7 days", "report:7"),
                        Button::new("30 days", "report:30"),
                        Button::new("90 days", "report:90"),
                        Button::new("Custom range", "report_custom"),
                    ])
                    .row(vec![cancel_button()]);
                self.render(session, turn, view).await
            }
            (Action::ReportDays, Some(days)) if (1..=366).contains(&days) => {
                let range = DateRange::last_days(self.ctx.today(), days as u32);
                let expenses = self.ctx.store.expenses(user).await?;
                let report = build_report(&expenses, range, self.ctx.timezone);
                let view = View::text(report.render()).row(vec![cancel_button()]);
                self.render(session, turn, view).await
            }
            (action, arg) => {
                debug!(user_id = user, ?action, ?arg, "action without a usable argument");
                self.retake(session, turn).await
            }
        }
    }

    // ── Scene transitions ────────────────────────────────────────────────

    /// Make `scene` current and render its primary view.
    pub(crate) async fn enter(&self, session: &mut Session, turn: &Turn<'_>, scene: SceneId) -> Result<()> {
        if let Some(previous) = session.scene {
            if previous != scene {
                self.leave(session, previous, Some(scene));
            }
        }
        session.scene = Some(scene);
        debug!(user_id = turn.user.id, ?scene, "entering scene");
        let view = self.scene_view(session, turn.user, scene).await?;
        self.render(session, turn, view).await
    }

    /// Render the current scene again without changing it.
    pub(crate) async fn retake(&self, session: &mut Session, turn: &Turn<'_>) -> Result<()> {
        let Some(scene) = session.scene else {
            return self.render(session, turn, fallback_view(SESSION_EXPIRED)).await;
        };
        let view = self.scene_view(session, turn.user, scene).await?;
        self.render(session, turn, view).await
    }

    /// Stop tracking a scene without rendering.  Precedes every dialog.
    pub(crate) fn exit(&self, session: &mut Session) {
        if let Some(from) = session.scene.take() {
            self.leave(session, from, None);
        }
    }

    pub(crate) async fn render(&self, session: &mut Session, turn: &Turn<'_>, view: View) -> Result<()> {
        let previous = turn.anchor.or(session.scratch.last_bot_message);
        let message = self
            .ctx
            .transport
            .replace(turn.chat, previous, &view, turn.placement)
            .await?;
        session.scratch.last_bot_message = Some(message);
        Ok(())
    }

    pub(crate) fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.ctx.timezone)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }

    // ── Lists, details and removal ───────────────────────────────────────

    async fn selected_vehicle_exists(&self, session: &Session, user: UserId) -> Result<bool> {
        Ok(match session.scratch.vehicle_id {
            Some(id) => self.ctx.store.vehicle(user, id).await?.is_some(),
            None => false,
        })
    }

    /// `(id, label)` rows for a numbered list of `kind`.
    async fn items(&self, session: &Session, user: UserId, kind: EntityKind) -> Result<Vec<(RecordId, String)>> {
        let store = &self.ctx.store;
        Ok(match kind {
            EntityKind::Vehicle => store
                .vehicles(user)
                .await?
                .into_iter()
                .map(|v| (v.id, format!("{} {}", v.name, v.year)))
                .collect(),
            EntityKind::Reminder => match session.scratch.vehicle_id {
                Some(vehicle) => store
                    .reminders(user, vehicle)
                    .await?
                    .into_iter()
                    .map(|r| (r.id, r.title))
                    .collect(),
                None => Vec::new(),
            },
            EntityKind::Note => store
                .notes(user)
                .await?
                .into_iter()
                .map(|n| (n.id, n.title))
                .collect(),
            EntityKind::Purchase => store
                .purchases(user)
                .await?
                .into_iter()
                .map(|p| (p.id, p.title))
                .collect(),
            EntityKind::Expense => store
                .expenses(user)
                .await?
                .into_iter()
                .map(|e| (e.id, format!("{} ({}, {:.2})", e.title, e.category, e.price)))
                .collect(),
        })
    }

    async fn list(&self, session: &mut Session, turn: &Turn<'_>, kind: EntityKind, action: &str) -> Result<()> {
        let items = self.items(session, turn.user.id, kind).await?;
        if items.is_empty() {
            return self.retake(session, turn).await;
        }
        let heading = if action == "remove" {
            format!("Choose the {kind} to remove:")
        } else {
            format!("Choose the {kind} to open:")
        };
        let ids: Vec<RecordId> = items.iter().map(|(id, _)| *id).collect();
        let text = format!("{heading}\n{}", numbered(items.iter().map(|(_, label)| label.as_str())));
        let view = View::text(text)
            .buttons(numbered_buttons(action, kind, &ids))
            .row(vec![cancel_button()]);
        self.render(session, turn, view).await
    }

    async fn show(&self, session: &mut Session, turn: &Turn<'_>, kind: EntityKind, id: RecordId) -> Result<()> {
        let user = turn.user.id;
        let store = &self.ctx.store;
        let view = match kind {
            EntityKind::Note => store.note(user, id).await?.map(|note| {
                let body = note.body.as_deref().unwrap_or("(no text)");
                View::text(format!("{}\n\n{body}", note.title))
            }),
            EntityKind::Purchase => store
                .purchase(user, id)
                .await?
                .map(|purchase| View::text(purchase.title).photo(purchase.photo)),
            EntityKind::Reminder => store.reminder(user, id).await?.map(|reminder| {
                let mut text = format!("{}\nDue: {}", reminder.title, self.local_time(reminder.fire_at));
                if let Some(description) = &reminder.description {
                    text.push_str(&format!("\n\n{description}"));
                }
                if reminder.done {
                    text.push_str("\n\nDone.");
                }
                View::text(text)
            }),
            EntityKind::Vehicle | EntityKind::Expense => None,
        };

        match view {
            Some(view) => self.render(session, turn, view.row(vec![cancel_button()])).await,
            None => {
                debug!(user_id = user, %kind, id, "nothing to show");
                self.retake(session, turn).await
            }
        }
    }

    /// Delete a record.  Removing a reminder, or a vehicle with reminders,
    /// cancels their scheduled notifications.  A missing record is a no-op.
    async fn remove(&self, session: &mut Session, user: UserId, kind: EntityKind, id: RecordId) -> Result<()> {
        let store = &self.ctx.store;
        let removed = match kind {
            EntityKind::Vehicle => match store.remove_vehicle(user, id).await? {
                Some(removal) => {
                    if session.scratch.vehicle_id == Some(id) {
                        session.scratch.vehicle_id = None;
                    }
                    self.cancel_jobs(user, &removal.reminders).await;
                    true
                }
                None => false,
            },
            EntityKind::Reminder => match store.remove_reminder(user, id).await? {
                Some(reminder) => {
                    self.cancel_jobs(user, std::slice::from_ref(&reminder)).await;
                    true
                }
                None => false,
            },
            EntityKind::Note => store.remove_note(user, id).await?.is_some(),
            EntityKind::Purchase => store.remove_purchase(user, id).await?.is_some(),
            EntityKind::Expense => store.remove_expense(user, id).await?.is_some(),
        };

        if removed {
            info!(user_id = user, %kind, id, "record removed");
        } else {
            debug!(user_id = user, %kind, id, "record already gone");
        }
        Ok(())
    }

    async fn cancel_jobs(&self, user: UserId, reminders: &[Reminder]) {
        for reminder in reminders {
            let key = JobKey::for_reminder(user, &reminder.title);
            if let Err(err) = self.ctx.scheduler.cancel_reminder(&key, reminder.id).await {
                warn!(user_id = user, reminder = reminder.id, ?err, "could not cancel reminder job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bumblebee_scheduler::{Clock, JobKey};
    use bumblebee_store::NewVehicle;
    use chrono::{Duration, TimeZone};

    use crate::testing::Harness;

    use super::*;

    // ── End-to-end scenarios ─────────────────────────────────────────────

    #[tokio::test]
    async fn add_first_vehicle_from_profile() {
        let h = Harness::new();

        let menu = h.command("start").await;
        assert!(menu.text.contains("Bumblebee"));
        assert_eq!(
            menu.button_data(),
            vec!["profile", "reminders", "notes", "purchases", "analytics"]
        );

        let profile = h.press("profile").await;
        assert_eq!(profile.text, "You have no vehicles.");
        assert_eq!(profile.button_data(), vec!["add_vehicle", "back"]);

        let prompt = h.press("add_vehicle").await;
        assert_eq!(prompt.text, "Enter the vehicle name (one word):");
        assert_eq!(h.session().await.scene, None);

        assert_eq!(h.text("Civic").await.text, "Enter the model year:");
        let profile = h.text("2020").await;
        assert!(profile.text.contains("1. Civic 2020"), "{}", profile.text);
        assert!(profile.button_data().contains(&"remove_vehicle"));

        let session = h.session().await;
        assert_eq!(session.scene, Some(SceneId::Profile));
        assert_eq!(session.dialog, None);
        assert_eq!(h.store().vehicles(h.user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_reminder_schedules_a_job_in_local_time() {
        let h = Harness::with_timezone(chrono_tz::Europe::Moscow);
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();

        h.command("start").await;
        let picker = h.press("reminders").await;
        assert_eq!(picker.button_data(), vec![format!("pick_vehicle:{}", car.id).as_str(), "back"]);

        let empty = h.press(&format!("pick_vehicle:{}", car.id)).await;
        assert_eq!(empty.text, "Civic 2020: 0 tasks");
        assert_eq!(empty.button_data(), vec!["add_reminder", "change_vehicle", "back"]);

        h.press("add_reminder").await;
        h.text("Oil change").await;
        h.text("every 5000km").await;
        let view = h.text("2099-01-01 10:00").await;
        assert!(view.text.starts_with("Civic 2020: 1 tasks"), "{}", view.text);
        assert!(view.text.contains("Oil change - 2099-01-01 10:00"));

        let pending = h.engine.context().scheduler.pending().unwrap();
        assert_eq!(pending.len(), 1);
        let job = &pending[0];
        assert_eq!(job.key, JobKey::for_reminder(h.user.id, "Oil change"));
        let expected = chrono_tz::Europe::Moscow
            .with_ymd_and_hms(2099, 1, 1, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(job.fire_at, expected);
        assert_eq!(job.payload.title, "Oil change");
        assert_eq!(job.payload.description.as_deref(), Some("every 5000km"));
        assert_eq!(job.payload.display_name, h.user.display_name);
        assert_eq!(job.payload.vehicle_name, "Civic");
    }

    #[tokio::test]
    async fn custom_report_rejects_reversed_range() {
        let h = Harness::new();
        h.command("start").await;
        h.press("analytics").await;
        h.press("report").await;
        assert_eq!(h.press("report_custom").await.text, "Enter the start date as YYYY-MM-DD:");
        h.text("2024-05-10").await;

        let rejected = h.text("2024-05-01").await;
        assert!(
            rejected.text.starts_with("The end date cannot be earlier than the start date (2024-05-10)"),
            "{}",
            rejected.text
        );
        assert!(!rejected.text.contains("Expenses from"));
        let session = h.session().await;
        assert_eq!(session.dialog.map(|d| d.current()), Some(Some(crate::dialog::Step::RangeEnd)));

        let report = h.text("2024-05-31").await;
        assert!(report.text.starts_with("Expenses from 2024-05-10 to 2024-05-31"));
        assert_eq!(h.session().await.scene, Some(SceneId::Analytics));
    }

    // ── Scene engine ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn retake_is_idempotent() {
        let h = Harness::new();
        h.store()
            .add_note(h.user.id, h.note("Tyres"))
            .await
            .unwrap();
        h.command("start").await;
        h.press("notes").await;

        let first = h.press("cancel").await;
        let second = h.press("cancel").await;
        assert_eq!(first, second);
        assert!(first.text.contains("1. Tyres"));
    }

    #[tokio::test]
    async fn press_without_a_scene_renders_fallback() {
        let h = Harness::new();
        let view = h.press("add_note").await;
        assert_eq!(view.text, SESSION_EXPIRED);
        assert_eq!(view.button_data(), vec!["main_menu"]);

        // Unmatched presses inside a scene are a no-op.
        h.command("start").await;
        let before = h.transport.rendered().len();
        h.press("no_such_button").await;
        assert_eq!(h.transport.rendered().len(), before);
        assert_eq!(h.transport.answered(), 2);
    }

    #[tokio::test]
    async fn free_text_outside_a_dialog_is_ignored() {
        let h = Harness::new();
        h.command("start").await;
        let before = h.transport.rendered().len();
        h.text("hello?").await;
        assert_eq!(h.transport.rendered().len(), before);
    }

    #[tokio::test]
    async fn text_reply_moves_the_prompt_below_it() {
        let h = Harness::new();
        h.command("start").await;
        h.press("profile").await;
        h.press("add_vehicle").await;
        let prompt = h.session().await.scratch.last_bot_message.unwrap();

        h.text("Civic").await;
        assert_eq!(h.transport.deleted(), vec![prompt]);
        let next = h.session().await.scratch.last_bot_message.unwrap();
        assert_ne!(next, prompt);
        assert_eq!(h.transport.sent_to(h.chat).last().unwrap().text, "Enter the model year:");
    }

    #[tokio::test]
    async fn stale_vehicle_selection_fails_closed() {
        let h = Harness::new();
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", car.id)).await;

        h.store().remove_vehicle(h.user.id, car.id).await.unwrap();
        let view = h.press("cancel").await;
        assert_eq!(view.button_data(), vec!["main_menu"]);
        assert_eq!(h.session().await.scratch.vehicle_id, None);
    }

    #[tokio::test]
    async fn leaving_reminders_clears_the_vehicle_selection() {
        let h = Harness::new();
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", car.id)).await;
        assert_eq!(h.session().await.scratch.vehicle_id, Some(car.id));

        h.press("back").await;
        assert_eq!(h.session().await.scene, Some(SceneId::Menu));
        assert_eq!(h.session().await.scratch.vehicle_id, None);
    }

    #[tokio::test]
    async fn dialog_keeps_the_vehicle_selection_of_its_scene() {
        let h = Harness::new();
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", car.id)).await;

        h.press("add_reminder").await;
        let session = h.session().await;
        assert_eq!(session.scene, None);
        assert!(session.dialog.is_some());
        assert_eq!(session.scratch.vehicle_id, Some(car.id));
    }

    #[tokio::test]
    async fn start_command_clears_an_active_dialog() {
        let h = Harness::new();
        h.command("start").await;
        h.press("notes").await;
        h.press("add_note").await;
        assert!(h.session().await.dialog.is_some());

        h.command("menu").await;
        let session = h.session().await;
        assert_eq!(session.dialog, None);
        assert_eq!(session.scene, Some(SceneId::Menu));
    }

    // ── Removal ──────────────────────────────────────────────────────────

    async fn vehicle_with_reminder(h: &Harness) -> (RecordId, RecordId) {
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", car.id)).await;
        h.press("add_reminder").await;
        h.text("Oil change").await;
        h.text("every 5000km").await;
        h.text("2099-01-01 10:00").await;
        let reminder = h.store().reminders(h.user.id, car.id).await.unwrap()[0].id;
        (car.id, reminder)
    }

    #[tokio::test]
    async fn removing_a_reminder_cancels_its_job() {
        let h = Harness::new();
        let (_, reminder) = vehicle_with_reminder(&h).await;

        let list = h.press("remove_reminder").await;
        assert_eq!(list.button_data(), vec![format!("remove_reminder:{reminder}").as_str(), "cancel"]);
        let view = h.press(&format!("remove_reminder:{reminder}")).await;
        assert!(view.text.contains("0 tasks"));
        assert!(h.engine.context().scheduler.pending().unwrap().is_empty());

        // Pressing a stale removal button is a no-op.
        let again = h.press(&format!("remove_reminder:{reminder}")).await;
        assert_eq!(again, view);
    }

    #[tokio::test]
    async fn removing_a_vehicle_cancels_all_its_jobs() {
        let h = Harness::new();
        let (car, _) = vehicle_with_reminder(&h).await;

        h.press("back").await;
        h.press("profile").await;
        let view = h.press(&format!("remove_vehicle:{car}")).await;
        assert_eq!(view.text, "You have no vehicles.");
        assert!(h.engine.context().scheduler.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reminder_already_due_for_the_scheduler_fires_on_next_run() {
        // The scheduler's clock runs ahead, so a time the dialog accepts is
        // already past when the job is registered.
        let h = Harness::with_scheduler_skew(Duration::hours(1));
        let car = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", car.id)).await;
        h.press("add_reminder").await;
        h.text("Oil change").await;
        h.text("every 5000km").await;

        let at = h.clock.now() + Duration::minutes(2);
        let view = h.text(&at.format("%Y-%m-%d %H:%M").to_string()).await;

        assert!(view.text.starts_with("Civic 2020: 1 tasks"), "{}", view.text);
        assert_eq!(h.store().reminders(h.user.id, car.id).await.unwrap().len(), 1);
        let scheduler = &h.engine.context().scheduler;
        assert_eq!(scheduler.pending().unwrap().len(), 1);

        let delivery = h.engine.context().delivery();
        assert_eq!(scheduler.run_due(&*delivery).await.unwrap(), 1);
        let sent = h.transport.sent_to(h.chat);
        assert!(
            sent.iter().any(|view| view.text.contains("Complete the task - Oil change")),
            "{sent:?}"
        );
        assert!(scheduler.pending().unwrap().is_empty());
    }

    // ── Dialog runner ────────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_input_reprompts_without_storing() {
        let h = Harness::new();
        h.command("start").await;
        h.press("profile").await;
        h.press("add_vehicle").await;

        let view = h.text("Civic Type R").await;
        assert!(view.text.starts_with("The name must be one word"));
        h.text("Civic").await;
        let view = h.text("1850").await;
        assert!(view.text.starts_with("Cars from that year are extinct"));
        assert!(view.text.contains("1900 to 2024"));
        assert!(h.store().vehicles(h.user.id).await.unwrap().is_empty());

        let session = h.session().await;
        assert_eq!(session.dialog.map(|d| d.step), Some(1));
    }

    #[tokio::test]
    async fn duplicate_titles_are_rejected_case_insensitively() {
        let h = Harness::new();
        h.store()
            .add_note(h.user.id, h.note("Tyres"))
            .await
            .unwrap();
        h.command("start").await;
        h.press("notes").await;
        h.press("add_note").await;

        let view = h.text("  TYRES ").await;
        assert!(view.text.starts_with("You already have a note with that name"));
        assert_eq!(h.text("Wipers").await.text, "Enter the note text:");
        let notes = h.text("buy in autumn").await;
        assert!(notes.text.contains("2. Wipers"));
        assert_eq!(h.store().notes(h.user.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_reminder_titles_are_unique_across_vehicles() {
        let h = Harness::new();
        let civic = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Civic".into(), year: 2020 })
            .await
            .unwrap();
        let golf = h
            .store()
            .add_vehicle(h.user.id, NewVehicle { name: "Golf".into(), year: 2015 })
            .await
            .unwrap();
        let existing = h
            .store()
            .add_reminder(
                h.user.id,
                civic.id,
                bumblebee_store::NewReminder {
                    title: "Oil change".into(),
                    description: None,
                    fire_at: h.clock.now() + Duration::days(30),
                },
            )
            .await
            .unwrap();

        h.command("start").await;
        h.press("reminders").await;
        h.press(&format!("pick_vehicle:{}", golf.id)).await;
        h.press("add_reminder").await;
        let view = h.text("oil CHANGE").await;
        assert!(view.text.starts_with("You already have a reminder with that name"), "{}", view.text);

        // A fired reminder no longer blocks its title.
        assert!(h.store().complete_reminder(h.user.id, existing.id).await.unwrap());
        let view = h.text("oil CHANGE").await;
        assert_eq!(view.text.lines().next(), Some("Enter the task description:"));
    }

    #[tokio::test]
    async fn purchase_photo_can_be_skipped_or_sent() {
        let h = Harness::new();
        h.command("start").await;
        h.press("purchases").await;

        h.press("add_purchase").await;
        h.text("Floor mats").await;
        assert_eq!(
            h.text("no photo").await.text.lines().next(),
            Some("Send a photo or press Skip.")
        );
        h.press("step:skip").await;

        h.press("add_purchase").await;
        h.text("Dash cam").await;
        h.photo("file-123").await;

        let purchases = h.store().purchases(h.user.id).await.unwrap();
        assert_eq!(purchases.len(), 2);
        assert_eq!(purchases[0].photo, None);
        assert_eq!(purchases[1].photo.as_deref(), Some("file-123"));

        let shown = h.press(&format!("view_purchase:{}", purchases[1].id)).await;
        assert_eq!(shown.photo.as_deref(), Some("file-123"));
    }

    #[tokio::test]
    async fn expense_skip_keyword_saves_or_abandons() {
        let h = Harness::new();
        h.command("start").await;
        h.press("analytics").await;

        // Skip before the price: nothing saved.
        h.press("add_expense").await;
        h.text("Fuel").await;
        let view = h.text("skip").await;
        assert_eq!(view.text, "No expenses recorded yet.");
        assert_eq!(h.session().await.scene, Some(SceneId::Analytics));

        // Skip at the optional description: saved without it.
        h.press("add_expense").await;
        h.text("Fuel").await;
        h.text("fuel").await;
        h.text("1 500,50").await;
        let view = h.text("SKIP").await;
        assert!(view.text.contains("Total spent: 1500.50"), "{}", view.text);

        let expenses = h.store().expenses(h.user.id).await.unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].description, None);
    }

    #[tokio::test]
    async fn cancel_button_abandons_the_dialog() {
        let h = Harness::new();
        h.command("start").await;
        h.press("notes").await;
        h.press("add_note").await;
        h.text("Tyres").await;
        let view = h.press("step:cancel").await;
        assert_eq!(view.text, "You have no notes.");
        assert!(h.store().notes(h.user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_finds_titles_by_substring() {
        let h = Harness::new();
        for title in ["Winter tyres", "Wipers", "Summer TYRES"] {
            h.store()
                .add_note(h.user.id, h.note(title))
                .await
                .unwrap();
        }
        h.command("start").await;
        h.press("notes").await;
        h.press("search_note").await;
        let view = h.text("tyres").await;
        assert!(view.text.starts_with("Found 2:"), "{}", view.text);
        assert_eq!(view.button_data().len(), 3);
        assert_eq!(h.session().await.scene, Some(SceneId::Notes));
    }

    #[tokio::test]
    async fn fixed_window_report_counts_recent_expenses() {
        let h = Harness::new();
        h.command("start").await;
        h.press("analytics").await;
        h.press("add_expense").await;
        h.text("Fuel").await;
        h.text("fuel").await;
        h.text("50").await;
        h.text("full tank").await;

        let view = h.press("report:7").await;
        assert!(view.text.contains("Entries: 1"), "{}", view.text);
        assert!(view.text.contains("fuel"));
    }
}
