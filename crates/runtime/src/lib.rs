//! Conversation engine: scenes, step dialogs and the glue that turns fired
//! jobs into chat notifications.

pub mod context;
pub mod delivery;
pub mod dialog;
pub mod engine;
pub mod queue;
pub mod report;
pub mod scene;
pub mod session;
pub mod transport;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{AppContext, parse_timezone, scheduler_options};
pub use delivery::ReminderDelivery;
pub use engine::Engine;
pub use queue::UpdateQueue;
pub use scene::SceneId;
pub use session::{Session, SessionStore};
pub use transport::{
    Button, ChatId, Incoming, IncomingKind, MessageId, Placement, Transport, UserRef, View,
};
