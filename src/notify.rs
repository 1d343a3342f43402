//! Widget events and notifiers.
//!
//! The execution core emits a [`WidgetEvent`] whenever it persists a new
//! outcome for an instance. Delivery to connected screens is up to the
//! notifier implementation and must not block the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::widget::{WidgetInstance, WidgetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetEventKind {
    /// A new execution outcome was stored.
    Update,
    /// The instance was halted without a result (timeout, crash).
    Stopped,
}

/// Payload pushed to every subscriber of a widget instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetEvent {
    pub kind: WidgetEventKind,
    pub dashboard_token: String,
    pub widget_instance_id: i64,
    pub state: WidgetState,
    pub log: Option<String>,
    pub data: Option<String>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl WidgetEvent {
    /// Snapshot of a freshly reloaded instance.
    pub fn from_instance(kind: WidgetEventKind, instance: &WidgetInstance) -> Self {
        Self {
            kind,
            dashboard_token: instance.dashboard_token.clone(),
            widget_instance_id: instance.id,
            state: instance.state,
            log: instance.log.clone(),
            data: instance.data.clone(),
            last_execution_at: instance.last_execution_at,
            last_success_at: instance.last_success_at,
        }
    }
}

/// Delivers widget events to whoever is subscribed to an instance.
pub trait ExecutionNotifier: Send + Sync {
    fn notify_widget_instance_subscribers(&self, event: WidgetEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
    fn notify_widget_instance_subscribers(&self, _event: WidgetEvent) {}
}

/// A notifier that forwards events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls a watchdog; volume is one
/// event per execution.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<WidgetEvent>,
}

impl ChannelNotifier {
    pub fn new(sender: mpsc::UnboundedSender<WidgetEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WidgetEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl ExecutionNotifier for ChannelNotifier {
    fn notify_widget_instance_subscribers(&self, event: WidgetEvent) {
        // Receiver may have been dropped
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        let mut instance = WidgetInstance::placeholder(7);
        instance.dashboard_token = "lobby".into();
        instance.state = WidgetState::Warning;

        notifier.notify_widget_instance_subscribers(WidgetEvent::from_instance(
            WidgetEventKind::Update,
            &instance,
        ));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.widget_instance_id, 7);
        assert_eq!(event.dashboard_token, "lobby");
        assert_eq!(event.state, WidgetState::Warning);
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (notifier, rx) = ChannelNotifier::channel();
        drop(rx);
        notifier.notify_widget_instance_subscribers(WidgetEvent::from_instance(
            WidgetEventKind::Stopped,
            &WidgetInstance::placeholder(1),
        ));
    }
}
