//! The handoff service: every operation the HTTP layer exposes.
//!
//! `HandoffService` combines a [`Storage`] implementation, a [`Notifier`]
//! and a [`CodeGenerator`] behind the operations of the verification
//! workflow: create, accept/reject, fetch and validate codes, payment
//! confirmation, listing. Role resolution and the uniform not-found
//! discipline live here; the transition table itself lives in
//! [`crate::request::transition`].

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::codes::CodeGenerator;
use crate::error::{HandoffError, Result};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::request::{
    AnyRequest, CallerRole, CodeStage, ContactInfo, DEFAULT_MAX_ATTEMPTS, Effect, HandoffAction,
    NewRequest, PaymentStatus, Pending, Request, RequestId, RequestPayment, UserId,
    VerificationCode, transition,
};
use crate::storage::Storage;

/// Configuration for the handoff service.
///
/// Defaults are plain values copied onto each request at creation; nothing
/// here is shared mutable state.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Maximum verification attempts per stage, stamped onto each new
    /// request unless the creation input overrides it.
    pub max_attempts: u32,

    /// Bound on the code generator's uniqueness re-draw loop.
    pub max_code_draws: u32,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_code_draws: crate::codes::DEFAULT_MAX_DRAWS,
        }
    }
}

/// What a sender sees when fetching a stage's code.
#[derive(Debug, Clone, Serialize)]
pub struct CodeEnvelope {
    pub request_id: RequestId,
    pub stage: CodeStage,
    pub code: VerificationCode,
    pub instructions: &'static str,
    /// Who to meet: the courier for pickup, the pickup person for delivery.
    pub contact: ContactInfo,
}

/// The verification workflow service.
///
/// # Example
/// ```ignore
/// let service = HandoffService::new(storage, notifier)
///     .with_config(HandoffConfig { max_attempts: 5, ..Default::default() });
/// let request = service.create_request(input).await?;
/// service.accept(request.data.id, courier).await?;
/// ```
pub struct HandoffService<S: Storage, N: Notifier> {
    storage: Arc<S>,
    notifier: Arc<N>,
    codes: CodeGenerator,
    config: HandoffConfig,
}

impl<S: Storage, N: Notifier> HandoffService<S, N> {
    /// Create a service with default configuration.
    pub fn new(storage: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            storage,
            notifier,
            codes: CodeGenerator::default(),
            config: HandoffConfig::default(),
        }
    }

    /// Set a custom configuration.
    ///
    /// This is a builder method that can be chained after `new()`.
    pub fn with_config(mut self, config: HandoffConfig) -> Self {
        self.codes = CodeGenerator::new(config.max_code_draws);
        self.config = config;
        self
    }

    /// Get the underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Creation and payment
    // ------------------------------------------------------------------

    /// Create a request in the pending state.
    ///
    /// The sender must be identity-verified. `max_attempts` defaults from
    /// the service configuration unless the input overrides it.
    #[tracing::instrument(skip(self, input), fields(requester = %input.requester_id, offer = %input.offer_id))]
    pub async fn create_request(&self, mut input: NewRequest) -> Result<Request<Pending>> {
        if !input.requester_verified {
            return Err(HandoffError::SenderNotVerified(input.requester_id));
        }
        input.max_attempts = Some(input.max_attempts.unwrap_or(self.config.max_attempts));

        let request = self.storage.create_request(input).await?;
        tracing::info!(request_id = %request.data.id, "Shipment request created");
        Ok(request)
    }

    /// Record the external payment confirmation for a request.
    ///
    /// Only the requester may confirm; the reference is the payment
    /// provider's opaque id.
    #[tracing::instrument(skip(self, payment_ref))]
    pub async fn confirm_payment(
        &self,
        id: RequestId,
        caller: UserId,
        payment_ref: String,
    ) -> Result<RequestPayment> {
        let (_, role) = self.storage.get_request_for(id, caller).await?;
        if role != CallerRole::Requester {
            return Err(HandoffError::RequestNotFound(id));
        }

        let payment = RequestPayment {
            payment_ref,
            status: PaymentStatus::Paid,
            updated_at: Utc::now(),
        };
        self.storage.record_payment(id, &payment).await?;
        tracing::info!(request_id = %id, "Payment confirmed");
        Ok(payment)
    }

    /// Get the payment record, visible to either party.
    pub async fn payment(&self, id: RequestId, caller: UserId) -> Result<Option<RequestPayment>> {
        self.storage.get_request_for(id, caller).await?;
        self.storage.get_payment(id).await
    }

    // ------------------------------------------------------------------
    // Courier decisions and validations
    // ------------------------------------------------------------------

    /// Courier accepts a pending request; a pickup code is issued.
    pub async fn accept(&self, id: RequestId, caller: UserId) -> Result<AnyRequest> {
        self.apply(id, caller, HandoffAction::Accept).await
    }

    /// Courier declines a pending request.
    pub async fn reject(&self, id: RequestId, caller: UserId) -> Result<AnyRequest> {
        self.apply(id, caller, HandoffAction::Reject).await
    }

    /// Courier submits the pickup code received from the sender.
    ///
    /// On a mismatch the error carries the remaining attempt count; the
    /// request state is unchanged (though the attempt was counted).
    pub async fn validate_pickup_code(
        &self,
        id: RequestId,
        caller: UserId,
        code: &str,
    ) -> Result<AnyRequest> {
        self.apply(id, caller, HandoffAction::ValidatePickup { code })
            .await
    }

    /// Courier submits the delivery code relayed by the pickup person.
    pub async fn validate_delivery_code(
        &self,
        id: RequestId,
        caller: UserId,
        code: &str,
    ) -> Result<AnyRequest> {
        self.apply(id, caller, HandoffAction::ValidateDelivery { code })
            .await
    }

    #[tracing::instrument(skip(self, action), fields(action = action.as_str()))]
    async fn apply(
        &self,
        id: RequestId,
        caller: UserId,
        action: HandoffAction<'_>,
    ) -> Result<AnyRequest> {
        let (request, role) = self.storage.get_request_for(id, caller).await?;
        let outcome = transition(request, action, role, &self.codes, self.storage.as_ref()).await?;
        self.run_effects(&outcome.request, &outcome.effects).await;
        Ok(outcome.request)
    }

    // ------------------------------------------------------------------
    // Code retrieval
    // ------------------------------------------------------------------

    /// Sender fetches the pickup code to hand the item to the courier.
    pub async fn pickup_code(&self, id: RequestId, caller: UserId) -> Result<CodeEnvelope> {
        let (request, role) = self.storage.get_request_for(id, caller).await?;
        match (&request, role) {
            (AnyRequest::InProcess(req), CallerRole::Requester) => Ok(CodeEnvelope {
                request_id: id,
                stage: CodeStage::Pickup,
                code: req.state.pickup_code.clone(),
                instructions: "Provide this code to the courier when handing over your item",
                contact: req.data.courier_contact.clone(),
            }),
            _ => Err(HandoffError::RequestNotFound(id)),
        }
    }

    /// Sender fetches the delivery code to relay to the pickup person.
    pub async fn delivery_code(&self, id: RequestId, caller: UserId) -> Result<CodeEnvelope> {
        let (request, role) = self.storage.get_request_for(id, caller).await?;
        match (&request, role) {
            (AnyRequest::InTransit(req), CallerRole::Requester) => Ok(CodeEnvelope {
                request_id: id,
                stage: CodeStage::Delivery,
                code: req.state.delivery_code.clone(),
                instructions: "Share this code with your pickup person. \
                               They will provide it to the courier.",
                contact: req.data.pickup_person.clone(),
            }),
            _ => Err(HandoffError::RequestNotFound(id)),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Get a request, visible to either party.
    pub async fn get_request(&self, id: RequestId, caller: UserId) -> Result<AnyRequest> {
        let (request, _) = self.storage.get_request_for(id, caller).await?;
        Ok(request)
    }

    /// Requests made against the caller's offers, newest first.
    pub async fn requests_for_courier(&self, caller: UserId) -> Result<Vec<AnyRequest>> {
        self.storage.list_requests_for_courier(caller).await
    }

    /// Requests the caller created as sender, newest first.
    pub async fn requests_for_requester(&self, caller: UserId) -> Result<Vec<AnyRequest>> {
        self.storage.list_requests_for_requester(caller).await
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    /// Execute transition effects. Notification delivery is advisory:
    /// failures are logged and never surfaced to the caller, whose
    /// transition has already committed.
    async fn run_effects(&self, request: &AnyRequest, effects: &[Effect]) {
        for effect in effects {
            let kind = match effect {
                Effect::NotifyAccepted => NotificationKind::RequestAccepted,
                Effect::NotifyRejected => NotificationKind::RequestRejected,
                Effect::NotifyPickupVerified => NotificationKind::PickupVerified,
                Effect::NotifyDeliveryCompleted => NotificationKind::DeliveryCompleted,
            };
            let notification = Notification {
                request_id: request.id(),
                kind,
                recipient: request.data().sender_contact.clone(),
            };
            if let Err(e) = self.notifier.send(&notification).await {
                tracing::warn!(
                    request_id = %request.id(),
                    kind = ?kind,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::notify::MockNotifier;
    use crate::request::RequestStatus;
    use crate::storage::MemoryStorage;

    fn contact(name: &str) -> ContactInfo {
        ContactInfo {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: None,
        }
    }

    fn new_request(requester: UserId, courier: UserId) -> NewRequest {
        NewRequest {
            item_id: Uuid::new_v4().into(),
            offer_id: Uuid::new_v4().into(),
            requester_id: requester,
            courier_id: courier,
            requester_verified: true,
            comments: Some("fragile".to_string()),
            max_attempts: None,
            sender_contact: contact("Sender"),
            courier_contact: contact("Courier"),
            pickup_person: contact("Recipient"),
        }
    }

    fn service() -> (
        HandoffService<MemoryStorage, MockNotifier>,
        Arc<MemoryStorage>,
        Arc<MockNotifier>,
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let notifier = Arc::new(MockNotifier::new());
        let service = HandoffService::new(storage.clone(), notifier.clone());
        (service, storage, notifier)
    }

    #[tokio::test]
    async fn unverified_sender_cannot_create_request() {
        let (service, storage, _) = service();
        let requester = UserId::from(Uuid::new_v4());
        let mut input = new_request(requester, UserId::from(Uuid::new_v4()));
        input.requester_verified = false;

        let err = service.create_request(input).await.unwrap_err();
        assert!(matches!(err, HandoffError::SenderNotVerified(u) if u == requester));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn configured_max_attempts_is_stamped_on_new_requests() {
        let (service, _, _) = service();
        let service = service.with_config(HandoffConfig {
            max_attempts: 5,
            ..Default::default()
        });
        let request = service
            .create_request(new_request(
                UserId::from(Uuid::new_v4()),
                UserId::from(Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(request.data.max_attempts, 5);
    }

    #[tokio::test]
    async fn stranger_gets_not_found_for_every_operation() {
        let (service, _, _) = service();
        let requester = UserId::from(Uuid::new_v4());
        let courier = UserId::from(Uuid::new_v4());
        let stranger = UserId::from(Uuid::new_v4());

        let request = service
            .create_request(new_request(requester, courier))
            .await
            .unwrap();
        let id = request.data.id;

        for result in [
            service.accept(id, stranger).await.err(),
            service.pickup_code(id, stranger).await.err(),
            service.validate_pickup_code(id, stranger, "0000").await.err(),
            service.get_request(id, stranger).await.err(),
            service
                .confirm_payment(id, stranger, "pi_123".to_string())
                .await
                .err(),
        ] {
            assert!(matches!(result, Some(HandoffError::RequestNotFound(_))));
        }
    }

    #[tokio::test]
    async fn courier_cannot_fetch_codes_and_requester_cannot_validate() {
        let (service, _, _) = service();
        let requester = UserId::from(Uuid::new_v4());
        let courier = UserId::from(Uuid::new_v4());

        let request = service
            .create_request(new_request(requester, courier))
            .await
            .unwrap();
        let id = request.data.id;
        service.accept(id, courier).await.unwrap();

        // Fetch is requester-only
        let err = service.pickup_code(id, courier).await.unwrap_err();
        assert!(matches!(err, HandoffError::RequestNotFound(_)));

        // Validation is courier-only
        let envelope = service.pickup_code(id, requester).await.unwrap();
        let err = service
            .validate_pickup_code(id, requester, envelope.code.as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::RequestNotFound(_)));
    }

    #[tokio::test]
    async fn accept_notifies_even_when_delivery_fails() {
        let (service, _, notifier) = service();
        let requester = UserId::from(Uuid::new_v4());
        let courier = UserId::from(Uuid::new_v4());

        let request = service
            .create_request(new_request(requester, courier))
            .await
            .unwrap();

        notifier.fail_sends(true);
        // Notification failure must not surface
        let accepted = service.accept(request.data.id, courier).await.unwrap();
        assert_eq!(accepted.status(), RequestStatus::InProcess);
        assert_eq!(notifier.sent_count(), 0);
    }

    #[tokio::test]
    async fn payment_confirmation_is_requester_only() {
        let (service, _, _) = service();
        let requester = UserId::from(Uuid::new_v4());
        let courier = UserId::from(Uuid::new_v4());

        let request = service
            .create_request(new_request(requester, courier))
            .await
            .unwrap();
        let id = request.data.id;

        let err = service
            .confirm_payment(id, courier, "pi_abc".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::RequestNotFound(_)));

        let payment = service
            .confirm_payment(id, requester, "pi_abc".to_string())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(
            service.payment(id, courier).await.unwrap().unwrap().payment_ref,
            "pi_abc"
        );
    }
}
