//! Diagnostic events attached to resources

use crate::api::{Event, Kind, ObjectKey, ObjectMeta, ObjectReference};
use crate::store::{Api, ClusterApi, StoreError};
use crate::util::time::unix_timestamp;
use std::sync::Arc;
use tracing::{debug, warn};

pub const EVENT_WARNING: &str = "Warning";

/// Writes [`Event`] objects, one per (object, reason), counting repeats
#[derive(Clone)]
pub struct EventRecorder {
    client: Arc<dyn ClusterApi>,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn ClusterApi>) -> Self {
        Self { client }
    }

    fn event_name(kind: Kind, name: &str, reason: &str) -> String {
        format!(
            "{}.{}.{}",
            name,
            kind.as_str().to_lowercase(),
            reason.to_lowercase()
        )
    }

    /// Record an event; failures are logged and otherwise ignored
    pub async fn record(
        &self,
        kind: Kind,
        key: &ObjectKey,
        event_type: &str,
        reason: &str,
        message: &str,
    ) {
        if let Err(e) = self.try_record(kind, key, event_type, reason, message).await {
            warn!("Failed to record event {} for {} {}: {}", reason, kind, key, e);
        }
    }

    async fn try_record(
        &self,
        kind: Kind,
        key: &ObjectKey,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
        let name = Self::event_name(kind, &key.name, reason);
        let now = unix_timestamp();

        match api.get_opt(&name).await? {
            Some(mut existing) => {
                existing.count += 1;
                existing.event_type = event_type.to_string();
                existing.message = message.to_string();
                existing.last_seen = now;
                api.update(existing).await?;
            },
            None => {
                api.create(Event {
                    metadata: ObjectMeta::new(&key.namespace, &name),
                    involved: ObjectReference {
                        kind,
                        name: key.name.clone(),
                    },
                    event_type: event_type.to_string(),
                    reason: reason.to_string(),
                    message: message.to_string(),
                    count: 1,
                    last_seen: now,
                })
                .await?;
            },
        }
        debug!("Recorded {} event {} for {} {}", event_type, reason, kind, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_repeats_bump_count() {
        let client: Arc<dyn ClusterApi> = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(client.clone());
        let key = ObjectKey::new("default", "web");

        recorder
            .record(Kind::HiddenService, &key, EVENT_WARNING, "ReconcileFailed", "boom")
            .await;
        recorder
            .record(Kind::HiddenService, &key, EVENT_WARNING, "ReconcileFailed", "again")
            .await;

        let api: Api<Event> = Api::namespaced(client, "default");
        let event = api.get("web.hiddenservice.reconcilefailed").await.unwrap();
        assert_eq!(event.count, 2);
        assert_eq!(event.message, "again");
        assert_eq!(event.involved.kind, Kind::HiddenService);
    }
}
