//! PostgreSQL implementation of Storage.
//!
//! One `shipment_requests` row per request plus a one-to-one
//! `request_payments` row. The attempt counter is incremented with a single
//! `UPDATE … RETURNING` so concurrent validations serialize on the row lock,
//! and the status and `max_attempts` guards ride along in the same
//! statement. Transient errors (connection drops, pool timeouts) are retried
//! once before surfacing.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::Storage;
use crate::error::{HandoffError, Result};
use crate::request::{
    AnyRequest, AttemptSnapshot, AttemptTicket, CodeStage, Completed, ContactInfo,
    DEFAULT_MAX_ATTEMPTS, InProcess, InTransit, NewRequest, PaymentStatus, Pending, Request,
    RequestData, RequestId, RequestPayment, RequestState, RequestStatus, Rejected, UserId,
    VerificationCode,
};

const REQUEST_COLUMNS: &str = "id, item_id, offer_id, requester_id, courier_id, comments, status, \
     max_attempts, created_at, \
     pickup_code, pickup_code_generated_at, pickup_code_verified_at, pickup_attempts, \
     delivery_code, delivery_code_generated_at, delivery_code_verified_at, delivery_attempts, \
     rejected_at, completed_at, \
     sender_name, sender_email, sender_phone, \
     courier_name, courier_email, courier_phone, pickup_name, pickup_email, pickup_phone";

/// PostgreSQL implementation of the [`Storage`] trait.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/handoff").await?;
/// handoff::migrator().run(&pool).await?;
/// let storage = PostgresStorage::new(pool);
/// ```
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Whether an error is worth one immediate retry.
fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

impl PostgresStorage {
    /// Run `op`, retrying once on a transient error.
    async fn with_retry<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if is_transient(&e) => {
                tracing::warn!(op = label, error = %e, "Transient storage error, retrying once");
                op().await
                    .map_err(|e| HandoffError::Other(anyhow!("{} failed after retry: {}", label, e)))
            }
            Err(e) => Err(HandoffError::Other(anyhow!("{} failed: {}", label, e))),
        }
    }
}

/// Flat row shape of the `shipment_requests` table.
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    item_id: Uuid,
    offer_id: Uuid,
    requester_id: Uuid,
    courier_id: Uuid,
    comments: Option<String>,
    status: RequestStatus,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    pickup_code: Option<String>,
    pickup_code_generated_at: Option<DateTime<Utc>>,
    pickup_code_verified_at: Option<DateTime<Utc>>,
    pickup_attempts: i32,
    delivery_code: Option<String>,
    delivery_code_generated_at: Option<DateTime<Utc>>,
    delivery_code_verified_at: Option<DateTime<Utc>>,
    delivery_attempts: i32,
    rejected_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    sender_name: String,
    sender_email: String,
    sender_phone: Option<String>,
    courier_name: String,
    courier_email: String,
    courier_phone: Option<String>,
    pickup_name: String,
    pickup_email: String,
    pickup_phone: Option<String>,
}

impl RequestRow {
    fn data(&self) -> RequestData {
        RequestData {
            id: RequestId(self.id),
            item_id: self.item_id.into(),
            offer_id: self.offer_id.into(),
            requester_id: UserId(self.requester_id),
            courier_id: UserId(self.courier_id),
            comments: self.comments.clone(),
            max_attempts: self.max_attempts as u32,
            sender_contact: ContactInfo {
                name: self.sender_name.clone(),
                email: self.sender_email.clone(),
                phone: self.sender_phone.clone(),
            },
            courier_contact: ContactInfo {
                name: self.courier_name.clone(),
                email: self.courier_email.clone(),
                phone: self.courier_phone.clone(),
            },
            pickup_person: ContactInfo {
                name: self.pickup_name.clone(),
                email: self.pickup_email.clone(),
                phone: self.pickup_phone.clone(),
            },
            created_at: self.created_at,
        }
    }

    fn code(&self, value: &Option<String>, stage: CodeStage) -> Result<VerificationCode> {
        value
            .clone()
            .and_then(VerificationCode::new)
            .ok_or_else(|| {
                HandoffError::Other(anyhow!(
                    "request {} has no valid {} code for status {}",
                    self.id,
                    stage,
                    self.status
                ))
            })
    }

    fn stamp(&self, value: Option<DateTime<Utc>>, column: &str) -> Result<DateTime<Utc>> {
        value.ok_or_else(|| {
            HandoffError::Other(anyhow!(
                "request {} is missing {} for status {}",
                self.id,
                column,
                self.status
            ))
        })
    }

    /// Reassemble the typed request from the flat row.
    fn into_any(self) -> Result<AnyRequest> {
        let data = self.data();
        let request = match self.status {
            RequestStatus::Pending => AnyRequest::Pending(Request {
                state: Pending {},
                data,
            }),
            RequestStatus::InProcess => AnyRequest::InProcess(Request {
                state: InProcess {
                    pickup_code: self.code(&self.pickup_code, CodeStage::Pickup)?,
                    pickup_code_generated_at: self
                        .stamp(self.pickup_code_generated_at, "pickup_code_generated_at")?,
                    pickup_attempts: self.pickup_attempts as u32,
                },
                data,
            }),
            RequestStatus::InTransit => AnyRequest::InTransit(Request {
                state: InTransit {
                    pickup_code: self.code(&self.pickup_code, CodeStage::Pickup)?,
                    pickup_code_generated_at: self
                        .stamp(self.pickup_code_generated_at, "pickup_code_generated_at")?,
                    pickup_verified_at: self
                        .stamp(self.pickup_code_verified_at, "pickup_code_verified_at")?,
                    pickup_attempts: self.pickup_attempts as u32,
                    delivery_code: self.code(&self.delivery_code, CodeStage::Delivery)?,
                    delivery_code_generated_at: self
                        .stamp(self.delivery_code_generated_at, "delivery_code_generated_at")?,
                    delivery_attempts: self.delivery_attempts as u32,
                },
                data,
            }),
            RequestStatus::Completed => {
                let delivery_verified_at =
                    self.stamp(self.delivery_code_verified_at, "delivery_code_verified_at")?;
                AnyRequest::Completed(Request {
                    state: Completed {
                        pickup_verified_at: self
                            .stamp(self.pickup_code_verified_at, "pickup_code_verified_at")?,
                        delivery_verified_at,
                        completed_at: self.completed_at.unwrap_or(delivery_verified_at),
                    },
                    data,
                })
            }
            RequestStatus::Rejected => AnyRequest::Rejected(Request {
                state: Rejected {
                    rejected_at: self.stamp(self.rejected_at, "rejected_at")?,
                },
                data,
            }),
        };
        Ok(request)
    }
}

#[async_trait]
impl Storage for PostgresStorage {
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
        let data = &request.data;

        self.with_retry("create_request", || {
            sqlx::query(
                r#"
                INSERT INTO shipment_requests (
                    id, item_id, offer_id, requester_id, courier_id, comments,
                    status, max_attempts, created_at, updated_at,
                    sender_name, sender_email, sender_phone,
                    courier_name, courier_email, courier_phone,
                    pickup_name, pickup_email, pickup_phone
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $8,
                        $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(*data.id)
            .bind(*data.item_id)
            .bind(*data.offer_id)
            .bind(*data.requester_id)
            .bind(*data.courier_id)
            .bind(&data.comments)
            .bind(data.max_attempts as i32)
            .bind(data.created_at)
            .bind(&data.sender_contact.name)
            .bind(&data.sender_contact.email)
            .bind(&data.sender_contact.phone)
            .bind(&data.courier_contact.name)
            .bind(&data.courier_contact.email)
            .bind(&data.courier_contact.phone)
            .bind(&data.pickup_person.name)
            .bind(&data.pickup_person.email)
            .bind(&data.pickup_person.phone)
            .execute(&self.pool)
        })
        .await?;

        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        let query = format!(
            "SELECT {} FROM shipment_requests WHERE id = $1",
            REQUEST_COLUMNS
        );
        let row: Option<RequestRow> = self
            .with_retry("get_request", || {
                sqlx::query_as(&query).bind(*id).fetch_optional(&self.pool)
            })
            .await?;

        row.ok_or(HandoffError::RequestNotFound(id))?.into_any()
    }

    async fn code_in_use(&self, stage: CodeStage, code: &VerificationCode) -> Result<bool> {
        let sql = match stage {
            CodeStage::Pickup => {
                "SELECT EXISTS (
                     SELECT 1 FROM shipment_requests
                     WHERE pickup_code = $1 AND status IN ('in_process', 'in_transit')
                 )"
            }
            CodeStage::Delivery => {
                "SELECT EXISTS (
                     SELECT 1 FROM shipment_requests
                     WHERE delivery_code = $1 AND status = 'in_transit'
                 )"
            }
        };

        self.with_retry("code_in_use", || {
            sqlx::query_scalar(sql)
                .bind(code.as_str())
                .fetch_one(&self.pool)
        })
        .await
    }

    async fn record_code_attempt(&self, id: RequestId, stage: CodeStage) -> Result<AttemptTicket> {
        // Increment, cap and status guard in one statement: concurrent
        // submissions serialize on the row lock and each observes its own
        // post-increment value.
        let (update_sql, probe_sql) = match stage {
            CodeStage::Pickup => (
                "UPDATE shipment_requests
                 SET pickup_attempts = pickup_attempts + 1, updated_at = NOW()
                 WHERE id = $1 AND status = 'in_process' AND pickup_attempts < max_attempts
                 RETURNING pickup_attempts, max_attempts",
                "SELECT pickup_attempts, max_attempts FROM shipment_requests
                 WHERE id = $1 AND status = 'in_process'",
            ),
            CodeStage::Delivery => (
                "UPDATE shipment_requests
                 SET delivery_attempts = delivery_attempts + 1, updated_at = NOW()
                 WHERE id = $1 AND status = 'in_transit' AND delivery_attempts < max_attempts
                 RETURNING delivery_attempts, max_attempts",
                "SELECT delivery_attempts, max_attempts FROM shipment_requests
                 WHERE id = $1 AND status = 'in_transit'",
            ),
        };

        let updated: Option<(i32, i32)> = self
            .with_retry("record_code_attempt", || {
                sqlx::query_as(update_sql).bind(*id).fetch_optional(&self.pool)
            })
            .await?;

        if let Some((attempts, max_attempts)) = updated {
            return Ok(AttemptTicket::Counted(AttemptSnapshot {
                attempts: attempts as u32,
                max_attempts: max_attempts as u32,
            }));
        }

        // No row updated: either the counter is full or the request is not
        // in the status that accepts attempts for this stage.
        let probe: Option<(i32, i32)> = self
            .with_retry("record_code_attempt_probe", || {
                sqlx::query_as(probe_sql).bind(*id).fetch_optional(&self.pool)
            })
            .await?;

        Ok(match probe {
            Some(_) => AttemptTicket::Exhausted,
            None => AttemptTicket::Missing,
        })
    }

    async fn record_payment(&self, id: RequestId, payment: &RequestPayment) -> Result<()> {
        let rows_affected = self
            .with_retry("record_payment", || {
                sqlx::query(
                    r#"
                    INSERT INTO request_payments (request_id, payment_ref, status, created_at, updated_at)
                    SELECT id, $2, $3, $4, $4 FROM shipment_requests WHERE id = $1
                    ON CONFLICT (request_id)
                    DO UPDATE SET payment_ref = $2, status = $3, updated_at = $4
                    "#,
                )
                .bind(*id)
                .bind(&payment.payment_ref)
                .bind(payment.status.as_str())
                .bind(payment.updated_at)
                .execute(&self.pool)
            })
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(HandoffError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn get_payment(&self, id: RequestId) -> Result<Option<RequestPayment>> {
        let row: Option<(String, String, DateTime<Utc>)> = self
            .with_retry("get_payment", || {
                sqlx::query_as(
                    "SELECT payment_ref, status, updated_at FROM request_payments WHERE request_id = $1",
                )
                .bind(*id)
                .fetch_optional(&self.pool)
            })
            .await?;

        row.map(|(payment_ref, status, updated_at)| {
            let status: PaymentStatus = status
                .parse()
                .map_err(|e: String| HandoffError::Other(anyhow!(e)))?;
            Ok(RequestPayment {
                payment_ref,
                status,
                updated_at,
            })
        })
        .transpose()
    }

    async fn list_requests_for_courier(&self, courier: UserId) -> Result<Vec<AnyRequest>> {
        self.list_where("courier_id", courier).await
    }

    async fn list_requests_for_requester(&self, requester: UserId) -> Result<Vec<AnyRequest>> {
        self.list_where("requester_id", requester).await
    }

    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let any_request = AnyRequest::from(request.clone());
        let id = any_request.id();

        let rows_affected = match &any_request {
            AnyRequest::Pending(_) => {
                self.with_retry("persist_pending", || {
                    sqlx::query(
                        r#"
                        UPDATE shipment_requests SET
                            status = 'pending',
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .execute(&self.pool)
                })
                .await?
                .rows_affected()
            }
            AnyRequest::InProcess(req) => {
                self.with_retry("persist_in_process", || {
                    sqlx::query(
                        r#"
                        UPDATE shipment_requests SET
                            status = 'in_process',
                            pickup_code = $2,
                            pickup_code_generated_at = $3,
                            pickup_attempts = $4,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .bind(req.state.pickup_code.as_str())
                    .bind(req.state.pickup_code_generated_at)
                    .bind(req.state.pickup_attempts as i32)
                    .execute(&self.pool)
                })
                .await?
                .rows_affected()
            }
            AnyRequest::InTransit(req) => {
                self.with_retry("persist_in_transit", || {
                    sqlx::query(
                        r#"
                        UPDATE shipment_requests SET
                            status = 'in_transit',
                            pickup_code_verified = TRUE,
                            pickup_code_verified_at = $2,
                            pickup_attempts = $3,
                            delivery_code = $4,
                            delivery_code_generated_at = $5,
                            delivery_attempts = $6,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .bind(req.state.pickup_verified_at)
                    .bind(req.state.pickup_attempts as i32)
                    .bind(req.state.delivery_code.as_str())
                    .bind(req.state.delivery_code_generated_at)
                    .bind(req.state.delivery_attempts as i32)
                    .execute(&self.pool)
                })
                .await?
                .rows_affected()
            }
            AnyRequest::Completed(req) => {
                self.with_retry("persist_completed", || {
                    sqlx::query(
                        r#"
                        UPDATE shipment_requests SET
                            status = 'completed',
                            delivery_code_verified = TRUE,
                            delivery_code_verified_at = $2,
                            completed_at = $3,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .bind(req.state.delivery_verified_at)
                    .bind(req.state.completed_at)
                    .execute(&self.pool)
                })
                .await?
                .rows_affected()
            }
            AnyRequest::Rejected(req) => {
                self.with_retry("persist_rejected", || {
                    sqlx::query(
                        r#"
                        UPDATE shipment_requests SET
                            status = 'rejected',
                            rejected_at = $2,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .bind(req.state.rejected_at)
                    .execute(&self.pool)
                })
                .await?
                .rows_affected()
            }
        };

        if rows_affected == 0 {
            return Err(HandoffError::RequestNotFound(id));
        }
        Ok(())
    }
}

impl PostgresStorage {
    async fn list_where(&self, column: &'static str, user: UserId) -> Result<Vec<AnyRequest>> {
        let query = format!(
            "SELECT {} FROM shipment_requests WHERE {} = $1 ORDER BY created_at DESC",
            REQUEST_COLUMNS, column
        );
        let rows: Vec<RequestRow> = self
            .with_retry("list_requests", || {
                sqlx::query_as(&query).bind(*user).fetch_all(&self.pool)
            })
            .await?;

        rows.into_iter().map(RequestRow::into_any).collect()
    }
}
