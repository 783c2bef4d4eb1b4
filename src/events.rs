// Events module - Broadcast of platform status changes, alerts and samples

use crate::model::{Alert, ServerSample, ServiceId, ServiceStatus, SiteId, SiteSample, SiteStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    SiteStatusChanged {
        site_id: SiteId,
        status: SiteStatus,
        timestamp: DateTime<Utc>,
    },
    ServiceStatusChanged {
        service_id: ServiceId,
        site_id: SiteId,
        status: ServiceStatus,
        timestamp: DateTime<Utc>,
    },
    AlertCreated {
        alert: Alert,
    },
    AlertUpdated {
        alert: Alert,
    },
    ServerSampleCollected {
        sample: ServerSample,
    },
    SiteSampleCollected {
        sample: SiteSample,
    },
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PlatformEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn site_status(&self, site_id: SiteId, status: SiteStatus) {
        self.publish(PlatformEvent::SiteStatusChanged {
            site_id,
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn service_status(&self, service_id: ServiceId, site_id: SiteId, status: ServiceStatus) {
        self.publish(PlatformEvent::ServiceStatusChanged {
            service_id,
            site_id,
            status,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.site_status(SiteId::new(), SiteStatus::Active);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let site_id = SiteId::new();

        bus.site_status(site_id, SiteStatus::Stopped);

        match rx.recv().await.unwrap() {
            PlatformEvent::SiteStatusChanged { site_id: id, status, .. } => {
                assert_eq!(id, site_id);
                assert_eq!(status, SiteStatus::Stopped);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
