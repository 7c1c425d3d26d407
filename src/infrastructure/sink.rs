use async_trait::async_trait;
use tracing::info;

use crate::domain::ports::{NotificationEvent, NotificationSink};

/// Sink that writes events to the structured log. Stands in for the
/// user-facing broadcast fabric, which is wired in by embedders.
#[derive(Clone, Default)]
pub struct LogNotificationSink;

impl LogNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn publish(&self, user_id: &str, event: NotificationEvent, payload: serde_json::Value) {
        info!(
            user_id = %user_id,
            event = %event,
            payload = %payload,
            "notification published"
        );
    }
}
