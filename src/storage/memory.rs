//! In-memory storage implementation.
//!
//! Backs the test-suite and doubles as the reference semantics for the
//! [`Storage`] trait. All operations take one mutex acquisition, which makes
//! every trait method (`record_code_attempt` in particular) atomic with
//! respect to concurrent callers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use async_trait::async_trait;

use super::Storage;
use crate::error::{HandoffError, Result};
use crate::request::{
    AnyRequest, AttemptSnapshot, AttemptTicket, CodeStage, DEFAULT_MAX_ATTEMPTS, NewRequest,
    Pending, Request, RequestData, RequestId, RequestPayment, RequestState, UserId,
    VerificationCode,
};

#[derive(Clone)]
struct StoredRequest {
    request: AnyRequest,
    payment: Option<RequestPayment>,
}

/// In-memory [`Storage`] backed by a mutex-guarded map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    rows: Arc<Mutex<HashMap<RequestId, StoredRequest>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests. Test convenience.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_request(&self, input: NewRequest) -> Result<Request<Pending>> {
        let request = Request {
            state: Pending {},
            data: RequestData {
                id: RequestId::from(Uuid::new_v4()),
                item_id: input.item_id,
                offer_id: input.offer_id,
                requester_id: input.requester_id,
                courier_id: input.courier_id,
                comments: input.comments,
                max_attempts: input.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                sender_contact: input.sender_contact,
                courier_contact: input.courier_contact,
                pickup_person: input.pickup_person,
                created_at: Utc::now(),
            },
        };

        self.rows.lock().insert(
            request.data.id,
            StoredRequest {
                request: request.clone().into(),
                payment: None,
            },
        );
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        self.rows
            .lock()
            .get(&id)
            .map(|stored| stored.request.clone())
            .ok_or(HandoffError::RequestNotFound(id))
    }

    async fn code_in_use(&self, stage: CodeStage, code: &VerificationCode) -> Result<bool> {
        let rows = self.rows.lock();
        let in_use = rows.values().any(|stored| match (stage, &stored.request) {
            (CodeStage::Pickup, AnyRequest::InProcess(r)) => r.state.pickup_code == *code,
            (CodeStage::Pickup, AnyRequest::InTransit(r)) => r.state.pickup_code == *code,
            (CodeStage::Delivery, AnyRequest::InTransit(r)) => r.state.delivery_code == *code,
            _ => false,
        });
        Ok(in_use)
    }

    async fn record_code_attempt(&self, id: RequestId, stage: CodeStage) -> Result<AttemptTicket> {
        let mut rows = self.rows.lock();
        let Some(stored) = rows.get_mut(&id) else {
            return Ok(AttemptTicket::Missing);
        };

        let max_attempts = stored.request.data().max_attempts;
        let counter = match (stage, &mut stored.request) {
            (CodeStage::Pickup, AnyRequest::InProcess(r)) => &mut r.state.pickup_attempts,
            (CodeStage::Delivery, AnyRequest::InTransit(r)) => &mut r.state.delivery_attempts,
            // Wrong status for this stage: no attempt to record.
            _ => return Ok(AttemptTicket::Missing),
        };

        if *counter >= max_attempts {
            return Ok(AttemptTicket::Exhausted);
        }
        *counter += 1;
        Ok(AttemptTicket::Counted(AttemptSnapshot {
            attempts: *counter,
            max_attempts,
        }))
    }

    async fn record_payment(&self, id: RequestId, payment: &RequestPayment) -> Result<()> {
        let mut rows = self.rows.lock();
        let stored = rows
            .get_mut(&id)
            .ok_or(HandoffError::RequestNotFound(id))?;
        stored.payment = Some(payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: RequestId) -> Result<Option<RequestPayment>> {
        let rows = self.rows.lock();
        let stored = rows.get(&id).ok_or(HandoffError::RequestNotFound(id))?;
        Ok(stored.payment.clone())
    }

    async fn list_requests_for_courier(&self, courier: UserId) -> Result<Vec<AnyRequest>> {
        Ok(self.list_where(|r| r.data().courier_id == courier))
    }

    async fn list_requests_for_requester(&self, requester: UserId) -> Result<Vec<AnyRequest>> {
        Ok(self.list_where(|r| r.data().requester_id == requester))
    }

    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let any_request = AnyRequest::from(request.clone());
        let mut rows = self.rows.lock();
        let stored = rows
            .get_mut(&any_request.id())
            .ok_or(HandoffError::RequestNotFound(any_request.id()))?;
        stored.request = any_request;
        Ok(())
    }
}

impl MemoryStorage {
    fn list_where(&self, predicate: impl Fn(&AnyRequest) -> bool) -> Vec<AnyRequest> {
        let rows = self.rows.lock();
        let mut matching: Vec<AnyRequest> = rows
            .values()
            .map(|stored| stored.request.clone())
            .filter(|r| predicate(r))
            .collect();
        // Newest first, matching the relational implementation's ordering
        matching.sort_by(|a, b| b.data().created_at.cmp(&a.data().created_at));
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ContactInfo, InProcess};

    fn contact() -> ContactInfo {
        ContactInfo {
            name: "Someone".to_string(),
            email: "someone@example.com".to_string(),
            phone: None,
        }
    }

    fn input() -> NewRequest {
        NewRequest {
            item_id: Uuid::new_v4().into(),
            offer_id: Uuid::new_v4().into(),
            requester_id: UserId::from(Uuid::new_v4()),
            courier_id: UserId::from(Uuid::new_v4()),
            requester_verified: true,
            comments: None,
            max_attempts: None,
            sender_contact: contact(),
            courier_contact: contact(),
            pickup_person: contact(),
        }
    }

    async fn in_process(storage: &MemoryStorage, attempts: u32) -> RequestId {
        let pending = storage.create_request(input()).await.unwrap();
        let request = Request {
            data: pending.data,
            state: InProcess {
                pickup_code: VerificationCode::new("4821").unwrap(),
                pickup_code_generated_at: Utc::now(),
                pickup_attempts: attempts,
            },
        };
        storage.persist(&request).await.unwrap();
        request.data.id
    }

    #[tokio::test]
    async fn attempts_are_not_recorded_against_pending_requests() {
        let storage = MemoryStorage::new();
        let pending = storage.create_request(input()).await.unwrap();

        let ticket = storage
            .record_code_attempt(pending.data.id, CodeStage::Pickup)
            .await
            .unwrap();
        assert!(matches!(ticket, AttemptTicket::Missing));
    }

    #[tokio::test]
    async fn attempts_are_not_recorded_for_the_wrong_stage() {
        let storage = MemoryStorage::new();
        let id = in_process(&storage, 0).await;

        // In-process accepts pickup attempts, not delivery attempts
        let ticket = storage
            .record_code_attempt(id, CodeStage::Delivery)
            .await
            .unwrap();
        assert!(matches!(ticket, AttemptTicket::Missing));
    }

    #[tokio::test]
    async fn unknown_ids_are_missing() {
        let storage = MemoryStorage::new();
        let ticket = storage
            .record_code_attempt(RequestId::from(Uuid::new_v4()), CodeStage::Pickup)
            .await
            .unwrap();
        assert!(matches!(ticket, AttemptTicket::Missing));
    }

    #[tokio::test]
    async fn counter_stops_at_the_maximum() {
        let storage = MemoryStorage::new();
        let id = in_process(&storage, DEFAULT_MAX_ATTEMPTS - 1).await;

        // The last allowed attempt reaches the cap...
        match storage
            .record_code_attempt(id, CodeStage::Pickup)
            .await
            .unwrap()
        {
            AttemptTicket::Counted(snapshot) => {
                assert_eq!(snapshot.attempts, DEFAULT_MAX_ATTEMPTS);
                assert_eq!(snapshot.remaining(), 0);
            }
            other => panic!("expected Counted, got {:?}", other),
        }

        // ...and every further attempt is refused without incrementing
        let ticket = storage
            .record_code_attempt(id, CodeStage::Pickup)
            .await
            .unwrap();
        assert!(matches!(ticket, AttemptTicket::Exhausted));

        let stored = storage.get_request(id).await.unwrap();
        assert_eq!(
            stored.as_in_process().unwrap().state.pickup_attempts,
            DEFAULT_MAX_ATTEMPTS
        );
    }

    #[tokio::test]
    async fn persisting_an_unknown_request_is_not_found() {
        let storage = MemoryStorage::new();
        let pending = storage.create_request(input()).await.unwrap();

        let foreign = Request {
            data: RequestData {
                id: RequestId::from(Uuid::new_v4()),
                ..pending.data
            },
            state: Pending {},
        };
        let err = storage.persist(&foreign).await.unwrap_err();
        assert!(matches!(err, HandoffError::RequestNotFound(_)));
    }
}
