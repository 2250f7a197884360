//! Storage abstraction for shipment requests.
//!
//! This module defines the `Storage` trait, which provides the interface for
//! persisting requests, recording verification attempts, and tracking
//! payments. The type system ensures valid state transitions, so
//! implementations don't need to validate them; they only guard the one
//! operation the type system cannot: the atomic attempt counter.

use async_trait::async_trait;

use crate::error::{HandoffError, Result};
use crate::request::{
    AnyRequest, AttemptTicket, CallerRole, CodeStage, NewRequest, Pending, Request, RequestId,
    RequestPayment, RequestState, UserId, VerificationCode,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

/// Storage trait for persisting and querying shipment requests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a new request in the pending state.
    ///
    /// `max_attempts` defaults from the caller's configuration when the
    /// input leaves it unset.
    async fn create_request(&self, input: NewRequest) -> Result<Request<Pending>>;

    /// Get a request by ID, in whatever state it is in.
    async fn get_request(&self, id: RequestId) -> Result<AnyRequest>;

    /// Whether `code` is currently held by any request in a status where a
    /// code of `stage` is still live. Used by the generator's re-draw loop.
    async fn code_in_use(&self, stage: CodeStage, code: &VerificationCode) -> Result<bool>;

    /// Atomically record one validation attempt for `stage`.
    ///
    /// This is the single read-modify-write of the system: the counter is
    /// incremented and read back in one step, so two concurrent attempts
    /// can never observe the same counter value. The increment is refused
    /// (without error) once the counter has reached `max_attempts`, and the
    /// status is checked in the same step so an attempt can never be
    /// recorded against a request that already moved on.
    async fn record_code_attempt(&self, id: RequestId, stage: CodeStage) -> Result<AttemptTicket>;

    /// Upsert the payment record for a request.
    async fn record_payment(&self, id: RequestId, payment: &RequestPayment) -> Result<()>;

    /// Get the payment record for a request, if one exists.
    async fn get_payment(&self, id: RequestId) -> Result<Option<RequestPayment>>;

    /// List requests made against this courier's offers, newest first.
    async fn list_requests_for_courier(&self, courier: UserId) -> Result<Vec<AnyRequest>>;

    /// List requests created by this sender, newest first.
    async fn list_requests_for_requester(&self, requester: UserId) -> Result<Vec<AnyRequest>>;

    /// Update an existing request's state in storage.
    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>;

    /// Get a request together with the caller's resolved role.
    ///
    /// A caller who is neither the requester nor the courier gets
    /// [`HandoffError::RequestNotFound`], indistinguishable from the id not
    /// existing at all.
    #[tracing::instrument(skip(self))]
    async fn get_request_for(
        &self,
        id: RequestId,
        caller: UserId,
    ) -> Result<(AnyRequest, CallerRole)> {
        let request = self.get_request(id).await?;
        match request.data().role_of(caller) {
            CallerRole::Other => {
                tracing::debug!(request_id = %id, caller = %caller, "Caller is not a party to this request");
                Err(HandoffError::RequestNotFound(id))
            }
            role => Ok((request, role)),
        }
    }
}
