//! Notification delivery for handoff milestones.
//!
//! This module defines the `Notifier` trait to abstract outbound
//! notification delivery, enabling testability with mock implementations.
//! Notifications are advisory: the service sends them after a transition
//! commits and logs failures instead of propagating them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::request::{ContactInfo, RequestId};

/// What happened to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestAccepted,
    RequestRejected,
    PickupVerified,
    DeliveryCompleted,
}

impl NotificationKind {
    /// Subject line for the outbound message.
    pub fn subject(&self) -> &'static str {
        match self {
            NotificationKind::RequestAccepted => "Your shipment request was accepted",
            NotificationKind::RequestRejected => "Your shipment request was declined",
            NotificationKind::PickupVerified => "Your item is with the courier",
            NotificationKind::DeliveryCompleted => "Your item was delivered",
        }
    }
}

/// A notification addressed to one of the request's parties.
///
/// The payload deliberately carries no verification codes.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub request_id: RequestId,
    pub kind: NotificationKind,
    pub recipient: ContactInfo,
}

/// Trait for delivering notifications.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and keeps the service logic testable without real deliveries.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    ///
    /// # Errors
    /// Returns an error if delivery fails; the caller decides whether that
    /// matters (the handoff service logs and moves on).
    async fn send(&self, notification: &Notification) -> Result<()>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Notifier that POSTs each notification as JSON to a webhook endpoint
/// (typically a transactional-mail relay).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, notification), fields(request_id = %notification.request_id, kind = ?notification.kind))]
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "subject": notification.kind.subject(),
                "notification": notification,
            }))
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(status = %response.status(), "Notification delivered");
        Ok(())
    }
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// Mock notifier for testing.
///
/// Records every notification instead of delivering it, and can be told to
/// fail so tests can assert that delivery errors never surface to callers.
#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<parking_lot::Mutex<Vec<Notification>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Get all notifications that have been sent to this mock.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Get the number of notifications sent.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::HandoffError::Other(anyhow::anyhow!(
                "mock notifier configured to fail"
            )));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}
