//! Global event hub for the `GET /events` stream.
//!
//! Daemon-wide notifications (currently certificate changes) are published
//! here. Each event name is rate limited: a second event with the same name
//! inside the window is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use clibridge_protocol::GlobalEvent;

use crate::certs::CertificateManager;

const HUB_BUFFER: usize = 64;

/// Cheap-to-clone publisher of [`GlobalEvent`]s.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sender: broadcast::Sender<GlobalEvent>,
    rate_limit: Duration,
    last_sent: Mutex<HashMap<&'static str, Instant>>,
}

impl EventHub {
    pub fn new(rate_limit: Duration) -> Self {
        let (sender, _) = broadcast::channel(HUB_BUFFER);
        Self {
            inner: Arc::new(HubInner {
                sender,
                rate_limit,
                last_sent: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publishes an event unless one with the same name went out within
    /// the rate limit window. Returns whether it was published.
    pub fn publish(&self, event: GlobalEvent) -> bool {
        let name = event.name();
        let now = Instant::now();

        {
            let mut last_sent = self
                .inner
                .last_sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = last_sent.get(name) {
                if now.duration_since(*previous) < self.inner.rate_limit {
                    debug!(event = name, "Global event suppressed by rate limit");
                    return false;
                }
            }
            last_sent.insert(name, now);
        }

        // No subscribers is fine
        let _ = self.inner.sender.send(event);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GlobalEvent> {
        self.inner.sender.subscribe()
    }
}

/// Publishes `certificate_changed` whenever the active fingerprint changes.
pub fn spawn_certificate_watcher(
    hub: EventHub,
    certs: &CertificateManager,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut updates = certs.subscribe();
    let mut previous = updates
        .borrow_and_update()
        .as_ref()
        .map(|active| active.material.fingerprint.clone());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some((fingerprint, provenance)) = updates.borrow_and_update().as_ref().map(|a| {
                (
                    a.material.fingerprint.clone(),
                    a.material.provenance.as_str().to_string(),
                )
            }) else {
                continue;
            };

            if previous.as_deref() == Some(fingerprint.as_str()) {
                continue;
            }

            info!(fingerprint = %fingerprint, "Announcing certificate change");
            hub.publish(GlobalEvent::CertificateChanged {
                previous_fingerprint: previous.replace(fingerprint.clone()),
                fingerprint,
                provenance,
            });
        }

        debug!("Certificate watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_event(fp: &str) -> GlobalEvent {
        GlobalEvent::CertificateChanged {
            previous_fingerprint: None,
            fingerprint: fp.to_string(),
            provenance: "self_signed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_per_name() {
        let hub = EventHub::new(Duration::from_secs(300));
        let mut rx = hub.subscribe();

        assert!(hub.publish(cert_event("a")));
        assert!(!hub.publish(cert_event("b")));

        assert_eq!(rx.recv().await.unwrap(), cert_event("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_rate_limit_passes_everything() {
        let hub = EventHub::new(Duration::ZERO);
        assert!(hub.publish(cert_event("a")));
        assert!(hub.publish(cert_event("b")));
    }

    #[tokio::test]
    async fn test_certificate_watcher_publishes_changes() {
        use crate::certs::{CertMode, CertificateConfig};

        let tmp = tempfile::tempdir().unwrap();
        let certs = Arc::new(CertificateManager::new(CertificateConfig {
            mode: CertMode::SelfSigned,
            self_signed_dir: tmp.path().join("self_signed"),
            external_cert_path: tmp.path().join("cert.pem"),
            external_key_path: tmp.path().join("key.pem"),
            hostname: "localhost".to_string(),
            subject_alt_names: Vec::new(),
        }));
        let first = certs.ensure().unwrap();

        let hub = EventHub::new(Duration::ZERO);
        let mut rx = hub.subscribe();
        let cancel = CancellationToken::new();
        let watcher = spawn_certificate_watcher(hub, &certs, cancel.clone());

        let outcome = certs.regenerate().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            GlobalEvent::CertificateChanged {
                previous_fingerprint: Some(first.fingerprint.clone()),
                fingerprint: outcome.current,
                provenance: "self_signed".to_string(),
            }
        );

        cancel.cancel();
        watcher.await.unwrap();
    }
}
