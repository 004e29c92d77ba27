use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dedup::{DeliveryKey, DeliveryRecord};
use crate::{ConversationId, ServerMessageId, UnixTimeMs};

pub const ACTION_REPLY: &str = "reply";
pub const ACTION_VIEW: &str = "view";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
}

/// OS-level alert request. Display is fire-and-forget: a dropped
/// notification loses nothing, the message is still fetched through the
/// normal transport once the app is foregrounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub actions: Vec<NotificationAction>,
}

/// Platform notification surface. `show` must not block and is never
/// retried.
pub trait Notifier: Send + Sync {
    fn show(&self, notification: Notification);
}

/// What the push channel knows about a message delivered while the app was
/// backgrounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub conversation_id: ConversationId,
    pub sender_name: String,
    pub preview: String,
}

/// Action selection reported back by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationActionEvent {
    pub action_id: String,
    pub message_id: ServerMessageId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Conversation focused for input.
    Compose,
    ReadOnly,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConversation {
    pub message_id: ServerMessageId,
    pub mode: OpenMode,
}

/// Receives messages pushed while the app is not in the foreground and
/// reconciles them with the foreground stream through the shared delivery
/// record, so a message arriving on both channels renders exactly once.
pub struct BackgroundDeliveryBridge<N: Notifier> {
    dedup: Arc<DeliveryRecord>,
    notifier: Arc<N>,
}

impl<N: Notifier> BackgroundDeliveryBridge<N> {
    #[must_use]
    pub fn new(dedup: Arc<DeliveryRecord>, notifier: Arc<N>) -> Self {
        Self { dedup, notifier }
    }

    /// Handle one background delivery. Returns `true` when a notification
    /// was requested, `false` when the message was already observed on the
    /// foreground path.
    pub fn on_background_message(
        &self,
        server_id: ServerMessageId,
        summary: &MessageSummary,
    ) -> bool {
        let key = DeliveryKey::Server(server_id.clone());
        if !self.dedup.add_if_absent(key, UnixTimeMs::now()) {
            debug!(server_id = %server_id, "push copy already rendered, suppressing");
            return false;
        }

        info!(server_id = %server_id, conversation = %summary.conversation_id, "background delivery");
        self.notifier.show(Notification {
            title: summary.sender_name.clone(),
            body: summary.preview.clone(),
            actions: vec![
                NotificationAction {
                    id: ACTION_REPLY.into(),
                    label: "Reply".into(),
                },
                NotificationAction {
                    id: ACTION_VIEW.into(),
                    label: "View".into(),
                },
            ],
        });
        true
    }

    /// Map an action selection back to an open-conversation request.
    #[must_use]
    pub fn handle_action(&self, event: &NotificationActionEvent) -> Option<OpenConversation> {
        let mode = match event.action_id.as_str() {
            ACTION_REPLY => OpenMode::Compose,
            ACTION_VIEW => OpenMode::ReadOnly,
            _ => {
                debug!(action_id = %event.action_id, "unknown notification action");
                return None;
            }
        };
        Some(OpenConversation {
            message_id: event.message_id.clone(),
            mode,
        })
    }
}
