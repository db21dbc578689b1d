use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bumblebee_scheduler::{Delivery, ScheduledJob};
use bumblebee_store::RecordStore;
use tracing::{debug, info, warn};

use crate::transport::{Transport, View};

/// Sends fired reminders to their chat and marks them done.  Never touches
/// conversation sessions.
pub struct ReminderDelivery {
    transport: Arc<dyn Transport>,
    store: Arc<dyn RecordStore>,
}

impl ReminderDelivery {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn RecordStore>) -> Self {
        Self { transport, store }
    }
}

pub fn reminder_text(job: &ScheduledJob) -> String {
    let payload = &job.payload;
    let mut text = format!(
        "@{}\nComplete the task - {}\nVehicle: {}",
        payload.display_name, payload.title, payload.vehicle_name
    );
    if let Some(description) = &payload.description {
        text.push_str(&format!("\n\n{description}"));
    }
    text
}

#[async_trait]
impl Delivery for ReminderDelivery {
    async fn deliver(&self, job: &ScheduledJob) -> Result<()> {
        let payload = &job.payload;

        // A reminder deleted after its job was registered must stay silent.
        if self
            .store
            .reminder(payload.user_id, payload.reminder_id)
            .await?
            .is_none()
        {
            info!(key = %job.key, reminder = payload.reminder_id, "reminder gone, notification dropped");
            return Ok(());
        }

        self.transport
            .send(payload.chat_id, &View::text(reminder_text(job)))
            .await
            .with_context(|| format!("sending reminder {}", payload.reminder_id))?;

        match self
            .store
            .complete_reminder(payload.user_id, payload.reminder_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(reminder = payload.reminder_id, "reminder removed while sending"),
            Err(err) => warn!(reminder = payload.reminder_id, ?err, "could not mark reminder done"),
        }
        Ok(())
    }
}
