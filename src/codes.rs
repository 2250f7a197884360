//! Verification code generation.
//!
//! Codes are uniformly random 4-digit strings, leading zeros allowed. A
//! freshly drawn code is re-drawn while another request holds the same value
//! in a status where that stage's code is still live, so a courier can never
//! be holding two identical active codes for the same stage. Uniqueness is
//! enforced with a storage read per draw; there is no cross-process lock,
//! and the window between the read and the caller's persist is accepted.

use metrics::counter;
use rand::Rng;

use crate::error::{HandoffError, Result};
use crate::request::{CODE_LENGTH, CodeStage, VerificationCode};
use crate::storage::Storage;

/// Default bound on uniqueness re-draws before giving up.
///
/// The code space holds 10,000 values, so hitting this bound means the
/// active set is pathologically saturated; failing loudly beats spinning.
pub const DEFAULT_MAX_DRAWS: u32 = 1000;

/// Generator for stage-scoped unique verification codes.
///
/// Pure query + random draw; the caller persists the result as part of the
/// state transition that needs it.
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    max_draws: u32,
}

impl CodeGenerator {
    /// Create a generator with a custom re-draw bound.
    pub fn new(max_draws: u32) -> Self {
        Self { max_draws }
    }

    /// Draw a code unique among codes currently active for `stage`.
    ///
    /// # Errors
    /// Returns [`HandoffError::CodeSpaceExhausted`] if no free code is found
    /// within the configured number of draws.
    pub async fn generate<S: Storage + ?Sized>(
        &self,
        stage: CodeStage,
        storage: &S,
    ) -> Result<VerificationCode> {
        for _ in 0..self.max_draws {
            let code = Self::draw();
            if !storage.code_in_use(stage, &code).await? {
                return Ok(code);
            }
            counter!("handoff_code_redraw_total", "stage" => stage.as_str()).increment(1);
            tracing::debug!(stage = %stage, "Verification code collision, re-drawing");
        }

        tracing::error!(
            stage = %stage,
            max_draws = self.max_draws,
            "Code space exhausted"
        );
        Err(HandoffError::CodeSpaceExhausted(stage))
    }

    /// One uniform draw over the full 4-digit space.
    fn draw() -> VerificationCode {
        let n: u32 = rand::thread_rng().gen_range(0..10u32.pow(CODE_LENGTH as u32));
        VerificationCode::new(format!("{:0width$}", n, width = CODE_LENGTH))
            .expect("formatted draw is always CODE_LENGTH digits")
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DRAWS)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::request::{
        AnyRequest, AttemptTicket, NewRequest, Pending, Request, RequestId, RequestPayment,
        RequestState, UserId,
    };

    /// Storage stub that reports the first `busy` draws as colliding.
    struct CollidingStore {
        busy: u32,
        seen: AtomicU32,
    }

    impl CollidingStore {
        fn new(busy: u32) -> Self {
            Self {
                busy,
                seen: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Storage for CollidingStore {
        async fn create_request(&self, _input: NewRequest) -> Result<Request<Pending>> {
            unimplemented!("not used by the generator")
        }

        async fn get_request(&self, _id: RequestId) -> Result<AnyRequest> {
            unimplemented!("not used by the generator")
        }

        async fn code_in_use(&self, _stage: CodeStage, _code: &VerificationCode) -> Result<bool> {
            Ok(self.seen.fetch_add(1, Ordering::SeqCst) < self.busy)
        }

        async fn record_code_attempt(
            &self,
            _id: RequestId,
            _stage: CodeStage,
        ) -> Result<AttemptTicket> {
            unimplemented!("not used by the generator")
        }

        async fn persist<T: RequestState + Clone>(&self, _request: &Request<T>) -> Result<()>
        where
            AnyRequest: From<Request<T>>,
        {
            unimplemented!("not used by the generator")
        }

        async fn record_payment(&self, _id: RequestId, _payment: &RequestPayment) -> Result<()> {
            unimplemented!("not used by the generator")
        }

        async fn get_payment(&self, _id: RequestId) -> Result<Option<RequestPayment>> {
            unimplemented!("not used by the generator")
        }

        async fn list_requests_for_courier(&self, _courier: UserId) -> Result<Vec<AnyRequest>> {
            unimplemented!("not used by the generator")
        }

        async fn list_requests_for_requester(&self, _requester: UserId) -> Result<Vec<AnyRequest>> {
            unimplemented!("not used by the generator")
        }
    }

    #[test]
    fn draw_is_always_four_digits() {
        for _ in 0..1000 {
            let code = CodeGenerator::draw();
            assert_eq!(code.as_str().len(), 4);
            assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn generator_redraws_past_collisions() {
        let store = CollidingStore::new(5);
        let generator = CodeGenerator::default();

        let code = generator.generate(CodeStage::Pickup, &store).await.unwrap();
        assert_eq!(code.as_str().len(), 4);
        // 5 collisions plus the successful draw
        assert_eq!(store.seen.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn generator_fails_when_code_space_is_saturated() {
        let store = CollidingStore::new(u32::MAX);
        let generator = CodeGenerator::new(25);

        let err = generator
            .generate(CodeStage::Delivery, &store)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandoffError::CodeSpaceExhausted(CodeStage::Delivery)
        ));
        assert_eq!(store.seen.load(Ordering::SeqCst), 25);
    }
}
