//! Linear step dialogs: ask, validate, store, advance.
//!
//! A dialog runs outside scene tracking (`session.scene` is `None`) and
//! collects its answers into a typed [`Draft`].  On completion the record is
//! persisted, the dialog is cleared and the origin scene is entered again.

use std::fmt;

use anyhow::{Context, Result, bail};
use bumblebee_scheduler::{JobKey, ReminderPayload};
use bumblebee_store::{
    EntityKind, NewExpense, NewNote, NewPurchase, NewReminder, NewVehicle, same_title,
};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, Turn};
use crate::report::{DateRange, build_report};
use crate::scene::{SceneId, VEHICLE_GONE, cancel_button, fallback_view, numbered, numbered_buttons};
use crate::session::Session;
use crate::transport::{Button, View};
use crate::validate::{self, Rejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    AddVehicle,
    AddReminder,
    AddNote,
    AddPurchase,
    AddExpense,
    SearchNotes,
    SearchPurchases,
    CustomReport,
}

impl Flow {
    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::AddVehicle => &[Step::VehicleName, Step::VehicleYear],
            Self::AddReminder => &[
                Step::ReminderTitle,
                Step::ReminderDescription,
                Step::ReminderDate,
            ],
            Self::AddNote => &[Step::NoteTitle, Step::NoteBody],
            Self::AddPurchase => &[Step::PurchaseTitle, Step::PurchasePhoto],
            Self::AddExpense => &[
                Step::ExpenseTitle,
                Step::ExpenseCategory,
                Step::ExpensePrice,
                Step::ExpenseDescription,
            ],
            Self::SearchNotes | Self::SearchPurchases => &[Step::Query],
            Self::CustomReport => &[Step::RangeStart, Step::RangeEnd],
        }
    }

    /// Scene the dialog returns to.
    pub fn origin(self) -> SceneId {
        match self {
            Self::AddVehicle => SceneId::Profile,
            Self::AddReminder => SceneId::Reminders,
            Self::AddNote | Self::SearchNotes => SceneId::Notes,
            Self::AddPurchase | Self::SearchPurchases => SceneId::Purchases,
            Self::AddExpense | Self::CustomReport => SceneId::Analytics,
        }
    }

    fn draft(self) -> Draft {
        match self {
            Self::AddVehicle => Draft::Vehicle {
                name: None,
                year: None,
            },
            Self::AddReminder => Draft::Reminder {
                title: None,
                description: None,
                fire_at: None,
            },
            Self::AddNote => Draft::Note {
                title: None,
                body: None,
            },
            Self::AddPurchase => Draft::Purchase {
                title: None,
                photo: None,
            },
            Self::AddExpense => Draft::Expense {
                title: None,
                category: None,
                price: None,
                description: None,
            },
            Self::SearchNotes | Self::SearchPurchases => Draft::Search { query: None },
            Self::CustomReport => Draft::Range {
                start: None,
                end: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    VehicleName,
    VehicleYear,
    ReminderTitle,
    ReminderDescription,
    ReminderDate,
    NoteTitle,
    NoteBody,
    PurchaseTitle,
    PurchasePhoto,
    ExpenseTitle,
    ExpenseCategory,
    ExpensePrice,
    ExpenseDescription,
    Query,
    RangeStart,
    RangeEnd,
}

impl Step {
    pub fn prompt(self) -> &'static str {
        match self {
            Self::VehicleName => "Enter the vehicle name (one word):",
            Self::VehicleYear => "Enter the model year:",
            Self::ReminderTitle => "Enter the task title:",
            Self::ReminderDescription => "Enter the task description:",
            Self::ReminderDate => "Enter the date and time as YYYY-MM-DD HH:MM:",
            Self::NoteTitle => "Enter the note title:",
            Self::NoteBody => "Enter the note text:",
            Self::PurchaseTitle => "Enter the purchase title:",
            Self::PurchasePhoto => "Send a photo of the purchase or press Skip:",
            Self::ExpenseTitle => "Enter the expense title (or `skip` to cancel):",
            Self::ExpenseCategory => "Enter the category (or `skip` to cancel):",
            Self::ExpensePrice => "Enter the price (or `skip` to cancel):",
            Self::ExpenseDescription => "Enter a description (or `skip` to save without one):",
            Self::Query => "Enter the text to search for:",
            Self::RangeStart => "Enter the start date as YYYY-MM-DD:",
            Self::RangeEnd => "Enter the end date as YYYY-MM-DD:",
        }
    }

    /// May be left empty.
    pub fn optional(self) -> bool {
        matches!(self, Self::PurchasePhoto | Self::ExpenseDescription)
    }

    /// Offers an inline Skip button.
    pub fn skippable(self) -> bool {
        matches!(self, Self::PurchasePhoto)
    }
}

/// Answers collected so far, typed per flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    Vehicle {
        name: Option<String>,
        year: Option<i32>,
    },
    Reminder {
        title: Option<String>,
        description: Option<String>,
        fire_at: Option<DateTime<Utc>>,
    },
    Note {
        title: Option<String>,
        body: Option<String>,
    },
    Purchase {
        title: Option<String>,
        photo: Option<String>,
    },
    Expense {
        title: Option<String>,
        category: Option<String>,
        price: Option<f64>,
        description: Option<String>,
    },
    Search {
        query: Option<String>,
    },
    Range {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dialog {
    pub flow: Flow,
    /// Index into `flow.steps()`.
    pub step: usize,
    pub draft: Draft,
}

impl Dialog {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            step: 0,
            draft: flow.draft(),
        }
    }

    pub fn current(&self) -> Option<Step> {
        self.flow.steps().get(self.step).copied()
    }

    /// The current step and every step after it.
    pub fn remaining(&self) -> &'static [Step] {
        let steps = self.flow.steps();
        &steps[self.step.min(steps.len())..]
    }

    /// Move to the next step.  `None` when the dialog is finished.
    pub fn advance(&mut self) -> Option<Step> {
        self.step += 1;
        self.current()
    }
}

/// One answer to the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepInput<'a> {
    Text(&'a str),
    Photo(&'a str),
    /// The inline Skip button.
    Skip,
}

impl<'a> StepInput<'a> {
    fn text(self) -> Result<&'a str, Rejection> {
        match self {
            Self::Text(text) => Ok(text),
            _ => Err(Rejection::TextExpected),
        }
    }
}

/// Why a step did not accept its input.
pub(crate) enum StepError {
    Rejected(Rejection),
    Failed(anyhow::Error),
}

impl From<Rejection> for StepError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(rejection) => write!(f, "rejected: {rejection}"),
            Self::Failed(err) => write!(f, "failed: {err:#}"),
        }
    }
}

const NOT_SCHEDULED: &str =
    "The reminder could not be scheduled and was not saved. Please try again.";

fn prompt_view(step: Step, rejection: Option<&Rejection>) -> View {
    let text = match rejection {
        Some(rejection) => format!("{rejection}\n\n{}", step.prompt()),
        None => step.prompt().to_string(),
    };
    let mut view = View::text(text);
    if step.skippable() {
        view = view.row(vec![Button::new("Skip", "step:skip")]);
    }
    view.row(vec![Button::new("Cancel", "step:cancel")])
}

fn is_skip_keyword(input: StepInput<'_>) -> bool {
    matches!(input, StepInput::Text(text) if text.trim().eq_ignore_ascii_case("skip"))
}

impl Engine {
    /// Leave scene tracking and ask the first question of `flow`.
    pub(crate) async fn start_dialog(
        &self,
        session: &mut Session,
        turn: &Turn<'_>,
        flow: Flow,
    ) -> Result<()> {
        self.exit(session);
        let dialog = Dialog::new(flow);
        let first = dialog
            .current()
            .context("dialog flow without steps")?;
        debug!(user_id = turn.user.id, ?flow, "dialog started");
        session.dialog = Some(dialog);
        self.render(session, turn, prompt_view(first, None)).await
    }

    /// Drop the dialog without saving and go back to its origin scene.
    pub(crate) async fn abandon_dialog(&self, session: &mut Session, turn: &Turn<'_>) -> Result<()> {
        let Some(dialog) = session.dialog.take() else {
            return Ok(());
        };
        info!(user_id = turn.user.id, flow = ?dialog.flow, "dialog abandoned");
        self.enter(session, turn, dialog.flow.origin()).await
    }

    /// Feed one answer to the active dialog.
    pub(crate) async fn on_step_input(
        &self,
        session: &mut Session,
        turn: &Turn<'_>,
        input: StepInput<'_>,
    ) -> Result<()> {
        let Some(mut dialog) = session.dialog.take() else {
            return Ok(());
        };
        let Some(step) = dialog.current() else {
            return self.complete(session, turn, dialog).await;
        };

        if dialog.flow == Flow::AddExpense && is_skip_keyword(input) {
            if dialog.remaining().iter().all(|s| s.optional()) {
                return self.complete(session, turn, dialog).await;
            }
            session.dialog = Some(dialog);
            return self.abandon_dialog(session, turn).await;
        }

        if input == StepInput::Skip && !step.skippable() {
            debug!(user_id = turn.user.id, ?step, "skip pressed on a required step");
            session.dialog = Some(dialog);
            return Ok(());
        }

        match self.accept(turn, &mut dialog, step, input).await {
            Ok(()) => match dialog.advance() {
                Some(next) => {
                    session.dialog = Some(dialog);
                    self.render(session, turn, prompt_view(next, None)).await
                }
                None => self.complete(session, turn, dialog).await,
            },
            Err(StepError::Rejected(rejection)) => {
                debug!(user_id = turn.user.id, ?step, %rejection, "step input rejected");
                session.dialog = Some(dialog);
                self.render(session, turn, prompt_view(step, Some(&rejection)))
                    .await
            }
            Err(StepError::Failed(err)) => {
                session.dialog = Some(dialog);
                Err(err)
            }
        }
    }

    /// Validate `input` for `step` and store it in the draft.
    async fn accept(
        &self,
        turn: &Turn<'_>,
        dialog: &mut Dialog,
        step: Step,
        input: StepInput<'_>,
    ) -> Result<(), StepError> {
        let user = turn.user.id;
        let store = &self.ctx.store;

        match (step, &mut dialog.draft) {
            (Step::VehicleName, Draft::Vehicle { name, .. }) => {
                let value = validate::word(input.text()?)?;
                let vehicles = store.vehicles(user).await?;
                if vehicles.iter().any(|v| same_title(&v.name, &value)) {
                    return Err(Rejection::Duplicate(EntityKind::Vehicle).into());
                }
                *name = Some(value);
            }
            (Step::VehicleYear, Draft::Vehicle { year, .. }) => {
                let max = validate::current_year(self.ctx.timezone, self.ctx.now());
                *year = Some(validate::year(input.text()?, max)?);
            }
            (Step::ReminderTitle, Draft::Reminder { title, .. }) => {
                let value = validate::title(input.text()?)?;
                // Jobs are keyed by user and title, across every vehicle.
                for vehicle in store.vehicles(user).await? {
                    let reminders = store.reminders(user, vehicle.id).await?;
                    if reminders.iter().any(|r| !r.done && same_title(&r.title, &value)) {
                        return Err(Rejection::Duplicate(EntityKind::Reminder).into());
                    }
                }
                *title = Some(value);
            }
            (Step::ReminderDescription, Draft::Reminder { description, .. }) => {
                *description = Some(validate::description(input.text()?)?);
            }
            (Step::ReminderDate, Draft::Reminder { fire_at, .. }) => {
                let at = validate::future_datetime(
                    input.text()?,
                    self.ctx.timezone,
                    self.ctx.now(),
                )?;
                *fire_at = Some(at);
            }
            (Step::NoteTitle, Draft::Note { title, .. }) => {
                let value = validate::title(input.text()?)?;
                let notes = store.notes(user).await?;
                if notes.iter().any(|n| same_title(&n.title, &value)) {
                    return Err(Rejection::Duplicate(EntityKind::Note).into());
                }
                *title = Some(value);
            }
            (Step::NoteBody, Draft::Note { body, .. }) => {
                *body = Some(validate::description(input.text()?)?);
            }
            (Step::PurchaseTitle, Draft::Purchase { title, .. }) => {
                let value = validate::title(input.text()?)?;
                let purchases = store.purchases(user).await?;
                if purchases.iter().any(|p| same_title(&p.title, &value)) {
                    return Err(Rejection::Duplicate(EntityKind::Purchase).into());
                }
                *title = Some(value);
            }
            (Step::PurchasePhoto, Draft::Purchase { photo, .. }) => match input {
                StepInput::Photo(file_id) => *photo = Some(file_id.to_string()),
                StepInput::Skip => *photo = None,
                StepInput::Text(_) => return Err(Rejection::PhotoExpected.into()),
            },
            (Step::ExpenseTitle, Draft::Expense { title, .. }) => {
                let value = validate::title(input.text()?)?;
                let expenses = store.expenses(user).await?;
                if expenses.iter().any(|e| same_title(&e.title, &value)) {
                    return Err(Rejection::Duplicate(EntityKind::Expense).into());
                }
                *title = Some(value);
            }
            (Step::ExpenseCategory, Draft::Expense { category, .. }) => {
                *category = Some(validate::title(input.text()?)?);
            }
            (Step::ExpensePrice, Draft::Expense { price, .. }) => {
                *price = Some(validate::price(input.text()?)?);
            }
            (Step::ExpenseDescription, Draft::Expense { description, .. }) => {
                *description = Some(validate::description(input.text()?)?);
            }
            (Step::Query, Draft::Search { query }) => {
                *query = Some(validate::title(input.text()?)?);
            }
            (Step::RangeStart, Draft::Range { start, .. }) => {
                *start = Some(validate::date(input.text()?)?);
            }
            (Step::RangeEnd, Draft::Range { start, end }) => {
                let from = (*start).context("range end asked before its start")?;
                *end = Some(validate::end_date(input.text()?, from)?);
            }
            (step, draft) => {
                return Err(StepError::Failed(anyhow::anyhow!(
                    "step {step:?} does not belong to draft {draft:?}"
                )));
            }
        }

        Ok(())
    }

    /// Persist (or evaluate) the finished dialog and leave it.
    async fn complete(&self, session: &mut Session, turn: &Turn<'_>, dialog: Dialog) -> Result<()> {
        let user = turn.user.id;
        let store = &self.ctx.store;
        let origin = dialog.flow.origin();
        info!(user_id = user, flow = ?dialog.flow, "dialog completed");

        match dialog.draft {
            Draft::Vehicle {
                name: Some(name),
                year: Some(year),
            } => {
                store.add_vehicle(user, NewVehicle { name, year }).await?;
            }
            Draft::Reminder {
                title: Some(title),
                description,
                fire_at: Some(fire_at),
            } => {
                return self
                    .complete_reminder(session, turn, title, description, fire_at)
                    .await;
            }
            Draft::Note {
                title: Some(title),
                body,
            } => {
                store
                    .add_note(
                        user,
                        NewNote {
                            title,
                            body,
                            created_at: self.ctx.now(),
                        },
                    )
                    .await?;
            }
            Draft::Purchase {
                title: Some(title),
                photo,
            } => {
                store
                    .add_purchase(
                        user,
                        NewPurchase {
                            title,
                            photo,
                            created_at: self.ctx.now(),
                        },
                    )
                    .await?;
            }
            Draft::Expense {
                title: Some(title),
                category: Some(category),
                price: Some(price),
                description,
            } => {
                store
                    .add_expense(
                        user,
                        NewExpense {
                            title,
                            category,
                            description,
                            price,
                            created_at: self.ctx.now(),
                        },
                    )
                    .await?;
            }
            Draft::Search { query: Some(query) } => {
                session.scene = Some(origin);
                let view = self.search_results(user, dialog.flow, &query).await?;
                return self.render(session, turn, view).await;
            }
            Draft::Range {
                start: Some(start),
                end: Some(end),
            } => {
                session.scene = Some(origin);
                let range = DateRange::new(start, end).context("reversed report range")?;
                let expenses = store.expenses(user).await?;
                let report = build_report(&expenses, range, self.ctx.timezone);
                let view = View::text(report.render()).row(vec![cancel_button()]);
                return self.render(session, turn, view).await;
            }
            draft => bail!("incomplete draft at completion: {draft:?}"),
        }

        self.enter(session, turn, origin).await
    }

    async fn complete_reminder(
        &self,
        session: &mut Session,
        turn: &Turn<'_>,
        title: String,
        description: Option<String>,
        fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let user = turn.user.id;
        let store = &self.ctx.store;

        let vehicle = match session.scratch.vehicle_id {
            Some(id) => store.vehicle(user, id).await?,
            None => None,
        };
        let Some(vehicle) = vehicle else {
            warn!(user_id = user, "reminder dialog finished without a vehicle");
            session.scratch.vehicle_id = None;
            session.scene = Some(SceneId::Reminders);
            return self.render(session, turn, fallback_view(VEHICLE_GONE)).await;
        };

        let reminder = store
            .add_reminder(
                user,
                vehicle.id,
                NewReminder {
                    title: title.clone(),
                    description: description.clone(),
                    fire_at,
                },
            )
            .await?;

        let payload = ReminderPayload {
            user_id: user,
            chat_id: turn.chat,
            display_name: turn.user.display_name.clone(),
            reminder_id: reminder.id,
            vehicle_name: vehicle.name.clone(),
            title: title.clone(),
            description,
        };
        let key = JobKey::for_reminder(user, &title);
        if let Err(err) = self.ctx.scheduler.schedule(key, fire_at, payload).await {
            warn!(user_id = user, reminder = reminder.id, %err, "reminder not scheduled, rolling back");
            if let Err(rollback) = store.remove_reminder(user, reminder.id).await {
                error!(user_id = user, reminder = reminder.id, ?rollback, "rollback failed");
            }
            session.scene = Some(SceneId::Reminders);
            let view = View::text(NOT_SCHEDULED).row(vec![cancel_button()]);
            return self.render(session, turn, view).await;
        }

        self.enter(session, turn, SceneId::Reminders).await
    }

    async fn search_results(&self, user: i64, flow: Flow, query: &str) -> Result<View> {
        let needle = query.to_lowercase();
        let (kind, hits): (EntityKind, Vec<(u64, String)>) = match flow {
            Flow::SearchNotes => (
                EntityKind::Note,
                self.ctx
                    .store
                    .notes(user)
                    .await?
                    .into_iter()
                    .filter(|n| n.title.to_lowercase().contains(&needle))
                    .map(|n| (n.id, n.title))
                    .collect(),
            ),
            _ => (
                EntityKind::Purchase,
                self.ctx
                    .store
                    .purchases(user)
                    .await?
                    .into_iter()
                    .filter(|p| p.title.to_lowercase().contains(&needle))
                    .map(|p| (p.id, p.title))
                    .collect(),
            ),
        };

        if hits.is_empty() {
            return Ok(View::text(format!("Nothing found for \"{query}\"."))
                .row(vec![cancel_button()]));
        }
        let ids: Vec<u64> = hits.iter().map(|(id, _)| *id).collect();
        let text = format!(
            "Found {}:\n{}",
            hits.len(),
            numbered(hits.iter().map(|(_, title)| title.as_str()))
        );
        Ok(View::text(text)
            .buttons(numbered_buttons("view", kind, &ids))
            .row(vec![cancel_button()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_walks_its_steps_in_order() {
        let mut dialog = Dialog::new(Flow::AddReminder);
        assert_eq!(dialog.current(), Some(Step::ReminderTitle));
        assert_eq!(dialog.advance(), Some(Step::ReminderDescription));
        assert_eq!(dialog.advance(), Some(Step::ReminderDate));
        assert_eq!(dialog.advance(), None);
        assert!(dialog.remaining().is_empty());
    }

    #[test]
    fn only_trailing_expense_description_is_optional() {
        let mut dialog = Dialog::new(Flow::AddExpense);
        assert!(!dialog.remaining().iter().all(|s| s.optional()));
        dialog.advance();
        dialog.advance();
        assert_eq!(dialog.current(), Some(Step::ExpensePrice));
        assert!(!dialog.remaining().iter().all(|s| s.optional()));
        dialog.advance();
        assert!(dialog.remaining().iter().all(|s| s.optional()));
    }

    #[test]
    fn every_flow_starts_with_an_empty_draft_of_its_kind() {
        assert_eq!(
            Dialog::new(Flow::AddVehicle).draft,
            Draft::Vehicle {
                name: None,
                year: None
            }
        );
        assert_eq!(Flow::SearchPurchases.origin(), SceneId::Purchases);
        assert_eq!(Flow::CustomReport.origin(), SceneId::Analytics);
    }

    #[test]
    fn rejection_is_shown_above_the_prompt() {
        let view = prompt_view(Step::VehicleYear, Some(&Rejection::NotAYear));
        assert!(view.text.starts_with("Enter the year as a number"));
        assert!(view.text.ends_with(Step::VehicleYear.prompt()));
        assert_eq!(view.button_data(), vec!["step:cancel"]);
        assert_eq!(
            prompt_view(Step::PurchasePhoto, None).button_data(),
            vec!["step:skip", "step:cancel"]
        );
    }
}
