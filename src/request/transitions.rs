//! State transitions for the two-stage handoff using the typestate pattern.
//!
//! This module implements the pickup/delivery verification lifecycle using
//! Rust's type system to enforce valid state transitions at compile time.
//! Each request state is represented as a distinct type parameter on
//! `Request<State>`.
//!
//! # Typestate Pattern
//!
//! The typestate pattern leverages Rust's type system to make invalid states
//! unrepresentable. A `Request<Pending>` can only call methods available for
//! pending requests, and transitions return different types:
//!
//! ```text
//! Request<Pending> ──accept()──> Request<InProcess> ──validate_pickup()──> Request<InTransit>
//!       │                                                                        │
//!       └──reject()──> Request<Rejected>            Request<Completed> <──validate_delivery()──┘
//! ```
//!
//! # State Lifecycle
//!
//! ## 1. Pending → InProcess
//!
//! The courier accepts the request:
//! - Generates a pickup code unique among active pickup codes
//! - Stamps the generation time
//! - Attempt counter starts at zero
//!
//! ## 2. InProcess → InTransit
//!
//! The courier submits the pickup code received from the sender:
//! - The attempt counter was already incremented atomically by the store
//! - **Match**: pickup marked verified, a delivery code is generated,
//!   status moves to in-transit
//! - **Mismatch**: the request stays in-process; the caller learns how many
//!   attempts remain
//!
//! ## 3. InTransit → Completed
//!
//! The courier submits the delivery code relayed through the pickup person.
//! Same comparison discipline as stage one; on a match the request is done.
//!
//! ## 4. Pending → Rejected
//!
//! The courier declines. No code is ever generated.
//!
//! # Attempt exhaustion
//!
//! Counters are monotonic and never reset. Once a counter reaches
//! `max_attempts` the store refuses further attempts and validation returns
//! [`HandoffError::AttemptsExhausted`]; the request deliberately stays in
//! its current state rather than auto-rejecting. Cancelling a stuck request
//! is a separate administrative path.

use chrono::Utc;
use metrics::counter;

use crate::codes::CodeGenerator;
use crate::error::{HandoffError, Result};
use crate::storage::Storage;

use super::types::{
    AnyRequest, AttemptSnapshot, AttemptTicket, CallerRole, CodeStage, Completed, InProcess,
    InTransit, Pending, Rejected, Request,
};

impl Request<Pending> {
    /// Accept this request: issue a pickup code and move to in-process.
    pub async fn accept<S: Storage + ?Sized>(
        self,
        codes: &CodeGenerator,
        storage: &S,
    ) -> Result<Request<InProcess>> {
        let pickup_code = codes.generate(CodeStage::Pickup, storage).await?;
        let request = Request {
            data: self.data,
            state: InProcess {
                pickup_code,
                pickup_code_generated_at: Utc::now(),
                pickup_attempts: 0,
            },
        };
        storage.persist(&request).await?;

        tracing::info!(
            request_id = %request.data.id,
            "Request accepted, pickup code issued"
        );
        Ok(request)
    }

    /// Decline this request. Terminal; no code is generated.
    pub async fn reject<S: Storage + ?Sized>(self, storage: &S) -> Result<Request<Rejected>> {
        let request = Request {
            data: self.data,
            state: Rejected {
                rejected_at: Utc::now(),
            },
        };
        storage.persist(&request).await?;

        tracing::info!(request_id = %request.data.id, "Request rejected");
        Ok(request)
    }
}

/// Outcome of a pickup code validation.
#[derive(Debug)]
pub enum PickupValidation {
    /// The code matched: the item is now with the courier.
    Verified(Request<InTransit>),
    /// The code did not match; the request stays in-process. The incremented
    /// attempt counter was already persisted by the store.
    Mismatch {
        request: Request<InProcess>,
        remaining_attempts: u32,
    },
}

impl Request<InProcess> {
    /// Compare a submitted pickup code against the stored one.
    ///
    /// `attempt` is the counter snapshot returned by the store's atomic
    /// increment. The increment happens before the comparison, so a
    /// successful validation also counts as an attempt.
    ///
    /// On a match the pickup is marked verified, a delivery code is
    /// generated for stage two, and the request moves to in-transit.
    pub async fn validate_pickup<S: Storage + ?Sized>(
        self,
        submitted: &str,
        attempt: AttemptSnapshot,
        codes: &CodeGenerator,
        storage: &S,
    ) -> Result<PickupValidation> {
        if !self.state.pickup_code.matches(submitted) {
            counter!("handoff_code_mismatch_total", "stage" => "pickup").increment(1);
            tracing::info!(
                request_id = %self.data.id,
                attempts = attempt.attempts,
                remaining = attempt.remaining(),
                "Pickup code mismatch"
            );
            let request = Request {
                data: self.data,
                state: InProcess {
                    pickup_attempts: attempt.attempts,
                    ..self.state
                },
            };
            return Ok(PickupValidation::Mismatch {
                remaining_attempts: attempt.remaining(),
                request,
            });
        }

        let now = Utc::now();
        let delivery_code = codes.generate(CodeStage::Delivery, storage).await?;
        let request = Request {
            data: self.data,
            state: InTransit {
                pickup_code: self.state.pickup_code,
                pickup_code_generated_at: self.state.pickup_code_generated_at,
                pickup_verified_at: now,
                pickup_attempts: attempt.attempts,
                delivery_code,
                delivery_code_generated_at: now,
                delivery_attempts: 0,
            },
        };
        storage.persist(&request).await?;

        tracing::info!(
            request_id = %request.data.id,
            attempts = attempt.attempts,
            "Pickup verified, delivery code issued"
        );
        Ok(PickupValidation::Verified(request))
    }
}

/// Outcome of a delivery code validation.
#[derive(Debug)]
pub enum DeliveryValidation {
    /// The code matched: the handoff chain is complete.
    Verified(Request<Completed>),
    /// The code did not match; the request stays in-transit.
    Mismatch {
        request: Request<InTransit>,
        remaining_attempts: u32,
    },
}

impl Request<InTransit> {
    /// Compare a submitted delivery code against the stored one.
    ///
    /// Same discipline as [`Request::validate_pickup`]: the attempt was
    /// already counted atomically, and a match completes the request.
    pub async fn validate_delivery<S: Storage + ?Sized>(
        self,
        submitted: &str,
        attempt: AttemptSnapshot,
        storage: &S,
    ) -> Result<DeliveryValidation> {
        if !self.state.delivery_code.matches(submitted) {
            counter!("handoff_code_mismatch_total", "stage" => "delivery").increment(1);
            tracing::info!(
                request_id = %self.data.id,
                attempts = attempt.attempts,
                remaining = attempt.remaining(),
                "Delivery code mismatch"
            );
            let request = Request {
                data: self.data,
                state: InTransit {
                    delivery_attempts: attempt.attempts,
                    ..self.state
                },
            };
            return Ok(DeliveryValidation::Mismatch {
                remaining_attempts: attempt.remaining(),
                request,
            });
        }

        let now = Utc::now();
        let request = Request {
            data: self.data,
            state: Completed {
                pickup_verified_at: self.state.pickup_verified_at,
                delivery_verified_at: now,
                completed_at: now,
            },
        };
        storage.persist(&request).await?;

        tracing::info!(request_id = %request.data.id, "Delivery verified, request completed");
        Ok(DeliveryValidation::Verified(request))
    }
}

// ============================================================================
// Transition dispatch
// ============================================================================

/// An action a caller can apply to a request.
#[derive(Debug, Clone, Copy)]
pub enum HandoffAction<'a> {
    /// Courier accepts the pending request.
    Accept,
    /// Courier declines the pending request.
    Reject,
    /// Courier submits the pickup code received from the sender.
    ValidatePickup { code: &'a str },
    /// Courier submits the delivery code relayed by the pickup person.
    ValidateDelivery { code: &'a str },
}

impl HandoffAction<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffAction::Accept => "accept",
            HandoffAction::Reject => "reject",
            HandoffAction::ValidatePickup { .. } => "validate_pickup",
            HandoffAction::ValidateDelivery { .. } => "validate_delivery",
        }
    }
}

/// Side effect requested by a transition, executed by the caller.
///
/// Transitions never talk to the outside world themselves; notification
/// delivery (and its failure handling) is the service layer's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Tell the sender the courier accepted.
    NotifyAccepted,
    /// Tell the sender the courier declined.
    NotifyRejected,
    /// Tell the sender the courier has the item.
    NotifyPickupVerified,
    /// Tell the sender the item was delivered.
    NotifyDeliveryCompleted,
}

/// Result of a dispatched transition: the request in its new state plus the
/// effects the caller should execute.
#[derive(Debug)]
pub struct Transitioned {
    pub request: AnyRequest,
    pub effects: Vec<Effect>,
}

/// The complete transition table in one place.
///
/// Every valid `(state, action, actor)` combination has exactly one arm
/// here; everything else (wrong actor, wrong status, terminal state)
/// collapses into [`HandoffError::RequestNotFound`] so responses never
/// reveal request state to a caller who is not entitled to act on it.
pub async fn transition<S: Storage + ?Sized>(
    request: AnyRequest,
    action: HandoffAction<'_>,
    role: CallerRole,
    codes: &CodeGenerator,
    storage: &S,
) -> Result<Transitioned> {
    let id = request.id();

    match (request, action, role) {
        (AnyRequest::Pending(req), HandoffAction::Accept, CallerRole::Courier) => {
            let accepted = req.accept(codes, storage).await?;
            Ok(Transitioned {
                request: accepted.into(),
                effects: vec![Effect::NotifyAccepted],
            })
        }

        (AnyRequest::Pending(req), HandoffAction::Reject, CallerRole::Courier) => {
            let rejected = req.reject(storage).await?;
            Ok(Transitioned {
                request: rejected.into(),
                effects: vec![Effect::NotifyRejected],
            })
        }

        (
            AnyRequest::InProcess(req),
            HandoffAction::ValidatePickup { code },
            CallerRole::Courier,
        ) => match storage.record_code_attempt(id, CodeStage::Pickup).await? {
            AttemptTicket::Counted(attempt) => {
                match req.validate_pickup(code, attempt, codes, storage).await? {
                    PickupValidation::Verified(verified) => Ok(Transitioned {
                        request: verified.into(),
                        effects: vec![Effect::NotifyPickupVerified],
                    }),
                    PickupValidation::Mismatch {
                        remaining_attempts, ..
                    } => Err(HandoffError::InvalidCode {
                        request_id: id,
                        stage: CodeStage::Pickup,
                        remaining_attempts,
                    }),
                }
            }
            AttemptTicket::Exhausted => {
                counter!("handoff_attempts_exhausted_total", "stage" => "pickup").increment(1);
                Err(HandoffError::AttemptsExhausted {
                    request_id: id,
                    stage: CodeStage::Pickup,
                })
            }
            AttemptTicket::Missing => Err(HandoffError::RequestNotFound(id)),
        },

        (
            AnyRequest::InTransit(req),
            HandoffAction::ValidateDelivery { code },
            CallerRole::Courier,
        ) => match storage.record_code_attempt(id, CodeStage::Delivery).await? {
            AttemptTicket::Counted(attempt) => {
                match req.validate_delivery(code, attempt, storage).await? {
                    DeliveryValidation::Verified(verified) => Ok(Transitioned {
                        request: verified.into(),
                        effects: vec![Effect::NotifyDeliveryCompleted],
                    }),
                    DeliveryValidation::Mismatch {
                        remaining_attempts, ..
                    } => Err(HandoffError::InvalidCode {
                        request_id: id,
                        stage: CodeStage::Delivery,
                        remaining_attempts,
                    }),
                }
            }
            AttemptTicket::Exhausted => {
                counter!("handoff_attempts_exhausted_total", "stage" => "delivery").increment(1);
                Err(HandoffError::AttemptsExhausted {
                    request_id: id,
                    stage: CodeStage::Delivery,
                })
            }
            AttemptTicket::Missing => Err(HandoffError::RequestNotFound(id)),
        },

        (request, action, role) => {
            tracing::debug!(
                request_id = %request.id(),
                status = %request.status(),
                action = action.as_str(),
                role = ?role,
                "Transition refused"
            );
            Err(HandoffError::RequestNotFound(request.id()))
        }
    }
}
