//! Control-plane notifications.
//!
//! The web backend owns classrooms and assignments. It only tells the core
//! who should hear about an event; the core fans it out on `user:{userId}`
//! where the session registry forwards it to that user's live sessions.

use std::sync::Arc;

use crate::protocol::{user_channel, ChannelMessage, ClassroomEvent, ProtocolError, ServerMessage};
use crate::store::CoordinationStore;

pub struct ControlPlane {
    store: Arc<CoordinationStore>,
}

impl ControlPlane {
    pub fn new(store: Arc<CoordinationStore>) -> Self {
        Self { store }
    }

    /// Publish `event` to one user. Returns how many nodes were listening
    /// (zero when the user has no live session anywhere).
    pub fn notify_user(&self, user_id: &str, event: &ClassroomEvent) -> Result<usize, ProtocolError> {
        let text = ChannelMessage::new(
            None,
            ServerMessage::Notification {
                event: event.clone(),
            },
        )
        .encode()?;
        let receivers = self.store.publish(&user_channel(user_id), text);
        log::debug!("Notified {user_id} ({receivers} listeners): {event:?}");
        Ok(receivers)
    }

    /// Publish `event` to each recipient. Returns the total listener count.
    pub fn notify_users<'a>(
        &self,
        user_ids: impl IntoIterator<Item = &'a str>,
        event: &ClassroomEvent,
    ) -> Result<usize, ProtocolError> {
        user_ids
            .into_iter()
            .map(|user_id| self.notify_user(user_id, event))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_user_channel() {
        let store = Arc::new(CoordinationStore::standalone());
        let control = ControlPlane::new(store.clone());
        let mut sub = store.subscribe("user:teacher-1");

        let event = ClassroomEvent::AssignmentSubmitted {
            classroom_id: "c1".into(),
            assignment_id: "a1".into(),
            student_id: "s1".into(),
        };
        assert_eq!(control.notify_user("teacher-1", &event).unwrap(), 1);

        let received = ChannelMessage::decode(&sub.try_recv().unwrap()).unwrap();
        assert_eq!(received.origin, None);
        assert_eq!(received.message, ServerMessage::Notification { event });
    }

    #[tokio::test]
    async fn test_notify_without_listeners() {
        let store = Arc::new(CoordinationStore::standalone());
        let control = ControlPlane::new(store);
        let event = ClassroomEvent::ClassroomCreated {
            classroom_id: "c1".into(),
            name: "Physics".into(),
        };
        assert_eq!(control.notify_users(["a", "b"], &event).unwrap(), 0);
    }
}
