//! Core types for the handoff verification system.
//!
//! This module defines the type-safe request lifecycle using the typestate pattern.
//! Each shipment request progresses through distinct states, enforced at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database status for filtering and querying requests.
///
/// This enum represents the string values stored in the database's `status`
/// column. It is also the vocabulary of the active-code uniqueness rules:
/// a pickup code is active while its request is `in_process` or `in_transit`,
/// a delivery code while its request is `in_transit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum RequestStatus {
    Pending,
    InProcess,
    InTransit,
    Completed,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProcess => "in_process",
            RequestStatus::InTransit => "in_transit",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Rejected)
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "in_process" => Ok(RequestStatus::InProcess),
            "in_transit" => Ok(RequestStatus::InTransit),
            "completed" => Ok(RequestStatus::Completed),
            "rejected" => Ok(RequestStatus::Rejected),
            _ => Err(format!("unknown request status: {}", s)),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two handoff stages, each secured by its own 4-digit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStage {
    /// Sender hands the item to the courier.
    Pickup,
    /// Courier hands the item to the pickup person.
    Delivery,
}

impl CodeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStage::Pickup => "pickup",
            CodeStage::Delivery => "delivery",
        }
    }

    /// Statuses in which a code of this stage counts as "in flight" for
    /// uniqueness purposes.
    pub fn active_statuses(&self) -> &'static [RequestStatus] {
        match self {
            CodeStage::Pickup => &[RequestStatus::InProcess, RequestStatus::InTransit],
            CodeStage::Delivery => &[RequestStatus::InTransit],
        }
    }
}

impl std::fmt::Display for CodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of digits in a verification code.
pub const CODE_LENGTH: usize = 4;

/// A 4-digit verification code.
///
/// Construction is validated: the value is always exactly four ASCII digits,
/// leading zeros allowed. Comparison against a submitted guess is
/// constant-time.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationCode(String);

impl VerificationCode {
    /// Validate and wrap a code value. Returns `None` unless the value is
    /// exactly [`CODE_LENGTH`] ASCII digits.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.len() == CODE_LENGTH && value.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a submitted guess.
    ///
    /// Length is checked first; a guess of the wrong length can never match
    /// a stored code.
    pub fn matches(&self, submitted: &str) -> bool {
        submitted.len() == self.0.len()
            && constant_time_eq::constant_time_eq(self.0.as_bytes(), submitted.as_bytes())
    }
}

// Codes are secrets: keep them out of debug output and logs.
impl std::fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerificationCode(****)")
    }
}

impl std::fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Display only first 8 characters for readability in logs
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a shipment request.
    RequestId
);
uuid_id!(
    /// Unique identifier for the item being shipped.
    ItemId
);
uuid_id!(
    /// Unique identifier for the courier's flight offer.
    OfferId
);
uuid_id!(
    /// Unique identifier for a marketplace user.
    UserId
);

// ============================================================================
// Parties and contacts
// ============================================================================

/// Contact details surfaced to the counterparty at a handoff point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// The caller's relationship to a request, resolved once per operation.
///
/// Every state-machine entry point takes the resolved role rather than
/// probing the caller's attributes ad hoc. `Other` always collapses to a
/// not-found response so strangers cannot probe for request existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    /// The sender who created the request.
    Requester,
    /// The owner of the offer the request was made against.
    Courier,
    /// Anyone else.
    Other,
}

/// Default maximum verification attempts per stage.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Immutable data shared by a request in every state.
///
/// `courier_id` duplicates information reachable through the offer, but
/// materializing it here lets role checks run without a join against the
/// offers table. Contact snapshots are captured at creation time for the
/// same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// The ID with which the request was created.
    pub id: RequestId,

    /// The item to be transported.
    pub item_id: ItemId,

    /// The offer this request was made against.
    pub offer_id: OfferId,

    /// The sender who created the request.
    pub requester_id: UserId,

    /// The courier who owns the offer.
    pub courier_id: UserId,

    /// Free-text comment from the sender.
    pub comments: Option<String>,

    /// Maximum verification attempts per stage before validation is refused.
    pub max_attempts: u32,

    /// Contact details of the sender, used for milestone notifications.
    pub sender_contact: ContactInfo,

    /// Contact details of the courier, shown to the sender with the pickup code.
    pub courier_contact: ContactInfo,

    /// Contact details of the pickup person, shown to the sender with the
    /// delivery code.
    pub pickup_person: ContactInfo,

    pub created_at: DateTime<Utc>,
}

impl RequestData {
    /// Resolve a caller's role relative to this request.
    pub fn role_of(&self, caller: UserId) -> CallerRole {
        if caller == self.requester_id {
            CallerRole::Requester
        } else if caller == self.courier_id {
            CallerRole::Courier
        } else {
            CallerRole::Other
        }
    }
}

/// Input for creating a new shipment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub item_id: ItemId,
    pub offer_id: OfferId,
    pub requester_id: UserId,
    pub courier_id: UserId,
    /// Whether the requester has passed identity verification. Unverified
    /// senders may not create requests.
    pub requester_verified: bool,
    pub comments: Option<String>,
    /// Per-request override of the configured maximum attempt count.
    pub max_attempts: Option<u32>,
    pub sender_contact: ContactInfo,
    pub courier_contact: ContactInfo,
    pub pickup_person: ContactInfo,
}

// ============================================================================
// Request states
// ============================================================================

/// Marker trait for valid request states.
///
/// This trait enables the typestate pattern, ensuring that operations
/// are only performed on requests in valid states.
pub trait RequestState: Send + Sync {}

/// A shipment request in a specific lifecycle state.
///
/// Uses the typestate pattern to ensure type-safe state transitions.
/// The generic parameter `T` represents the current state of the request.
#[derive(Debug, Clone, Serialize)]
pub struct Request<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// The immutable request data.
    pub data: RequestData,
}

/// Request is waiting for the courier to accept or reject it.
///
/// This is the initial state for all newly created requests. No
/// verification code exists yet.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl RequestState for Pending {}

/// The courier accepted; the item has not yet changed hands.
///
/// A pickup code exists and the sender can fetch it. The courier validates
/// it at the first handoff.
#[derive(Debug, Clone, Serialize)]
pub struct InProcess {
    pub pickup_code: VerificationCode,
    pub pickup_code_generated_at: DateTime<Utc>,
    /// Validation tries so far. Monotonic, never reset, capped at
    /// `max_attempts`.
    pub pickup_attempts: u32,
}

impl RequestState for InProcess {}

/// The courier holds the item and is traveling.
///
/// Pickup verification succeeded; a delivery code exists for the final
/// handoff. The pickup code is carried over because it still occupies the
/// active pickup code space.
#[derive(Debug, Clone, Serialize)]
pub struct InTransit {
    pub pickup_code: VerificationCode,
    pub pickup_code_generated_at: DateTime<Utc>,
    pub pickup_verified_at: DateTime<Utc>,
    pub pickup_attempts: u32,
    pub delivery_code: VerificationCode,
    pub delivery_code_generated_at: DateTime<Utc>,
    pub delivery_attempts: u32,
}

impl RequestState for InTransit {}

/// The item reached the pickup person. Terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub pickup_verified_at: DateTime<Utc>,
    pub delivery_verified_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RequestState for Completed {}

/// The courier declined the request. Terminal; no code was ever generated.
#[derive(Debug, Clone, Serialize)]
pub struct Rejected {
    pub rejected_at: DateTime<Utc>,
}

impl RequestState for Rejected {}

// ============================================================================
// Attempt accounting
// ============================================================================

/// Snapshot of a stage's attempt counter, taken atomically by the store
/// when an attempt is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptSnapshot {
    /// The counter value after this attempt was recorded.
    pub attempts: u32,
    pub max_attempts: u32,
}

impl AttemptSnapshot {
    /// Attempts left after this one. Reaches zero on the final allowed try.
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Result of atomically recording a validation attempt in the store.
#[derive(Debug, Clone, Copy)]
pub enum AttemptTicket {
    /// The counter was incremented; here is its new value.
    Counted(AttemptSnapshot),
    /// The counter already reached the maximum; nothing was incremented and
    /// the code must not be compared.
    Exhausted,
    /// No request with this id is in the status that accepts attempts for
    /// this stage.
    Missing,
}

// ============================================================================
// Unified request representation
// ============================================================================

/// Enum that can hold a request in any state.
///
/// This is used for storage and API responses where requests are handled
/// uniformly regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request", rename_all = "snake_case")]
pub enum AnyRequest {
    Pending(Request<Pending>),
    InProcess(Request<InProcess>),
    InTransit(Request<InTransit>),
    Completed(Request<Completed>),
    Rejected(Request<Rejected>),
}

impl AnyRequest {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the status corresponding to the current state.
    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Pending(_) => RequestStatus::Pending,
            AnyRequest::InProcess(_) => RequestStatus::InProcess,
            AnyRequest::InTransit(_) => RequestStatus::InTransit,
            AnyRequest::Completed(_) => RequestStatus::Completed,
            AnyRequest::Rejected(_) => RequestStatus::Rejected,
        }
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::InProcess(r) => &r.data,
            AnyRequest::InTransit(r) => &r.data,
            AnyRequest::Completed(r) => &r.data,
            AnyRequest::Rejected(r) => &r.data,
        }
    }

    /// Check if this request is in a terminal state (Completed or Rejected).
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as an InProcess request, consuming self.
    pub fn into_in_process(self) -> Option<Request<InProcess>> {
        match self {
            AnyRequest::InProcess(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as an InTransit request, consuming self.
    pub fn into_in_transit(self) -> Option<Request<InTransit>> {
        match self {
            AnyRequest::InTransit(r) => Some(r),
            _ => None,
        }
    }

    /// Try to extract as an InProcess request.
    pub fn as_in_process(&self) -> Option<&Request<InProcess>> {
        match self {
            AnyRequest::InProcess(r) => Some(r),
            _ => None,
        }
    }

    /// Try to extract as an InTransit request.
    pub fn as_in_transit(&self) -> Option<&Request<InTransit>> {
        match self {
            AnyRequest::InTransit(r) => Some(r),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Request to AnyRequest

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}

impl From<Request<InProcess>> for AnyRequest {
    fn from(r: Request<InProcess>) -> Self {
        AnyRequest::InProcess(r)
    }
}

impl From<Request<InTransit>> for AnyRequest {
    fn from(r: Request<InTransit>) -> Self {
        AnyRequest::InTransit(r)
    }
}

impl From<Request<Completed>> for AnyRequest {
    fn from(r: Request<Completed>) -> Self {
        AnyRequest::Completed(r)
    }
}

impl From<Request<Rejected>> for AnyRequest {
    fn from(r: Request<Rejected>) -> Self {
        AnyRequest::Rejected(r)
    }
}

// ============================================================================
// Payments
// ============================================================================

/// Payment lifecycle for a request, tracked one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(format!("unknown payment status: {}", s)),
        }
    }
}

/// External payment confirmation for a request.
///
/// The payment provider is out of scope; `payment_ref` is the provider's
/// opaque reference (e.g. a checkout session id) recorded after payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayment {
    pub payment_ref: String,
    pub status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
}
