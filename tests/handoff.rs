//! End-to-end tests of the handoff workflow against in-memory storage.

use std::sync::Arc;

use handoff::notify::MockNotifier;
use handoff::{
    AnyRequest, ContactInfo, HandoffError, HandoffService, MemoryStorage, NewRequest,
    NotificationKind, RequestId, RequestStatus, Storage, UserId,
};
use uuid::Uuid;

fn contact(name: &str) -> ContactInfo {
    ContactInfo {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        phone: Some("+15550100".to_string()),
    }
}

fn new_request(requester: UserId, courier: UserId) -> NewRequest {
    NewRequest {
        item_id: Uuid::new_v4().into(),
        offer_id: Uuid::new_v4().into(),
        requester_id: requester,
        courier_id: courier,
        requester_verified: true,
        comments: None,
        max_attempts: None,
        sender_contact: contact("Sender"),
        courier_contact: contact("Courier"),
        pickup_person: contact("Recipient"),
    }
}

struct Harness {
    service: HandoffService<MemoryStorage, MockNotifier>,
    storage: Arc<MemoryStorage>,
    notifier: Arc<MockNotifier>,
    requester: UserId,
    courier: UserId,
}

impl Harness {
    fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let notifier = Arc::new(MockNotifier::new());
        Self {
            service: HandoffService::new(storage.clone(), notifier.clone()),
            storage,
            notifier,
            requester: UserId::from(Uuid::new_v4()),
            courier: UserId::from(Uuid::new_v4()),
        }
    }

    async fn create(&self) -> RequestId {
        self.service
            .create_request(new_request(self.requester, self.courier))
            .await
            .expect("Failed to create request")
            .data
            .id
    }

    async fn status(&self, id: RequestId) -> RequestStatus {
        self.storage.get_request(id).await.unwrap().status()
    }
}

/// A guess guaranteed not to match `code`: same length, first digit shifted.
fn wrong_guess(code: &str) -> String {
    let first = code.as_bytes()[0];
    let flipped = b'0' + (first - b'0' + 1) % 10;
    format!("{}{}", flipped as char, &code[1..])
}

#[test_log::test(tokio::test)]
async fn accept_issues_pickup_code_and_moves_in_process() {
    let h = Harness::new();
    let id = h.create().await;
    assert_eq!(h.status(id).await, RequestStatus::Pending);

    let accepted = h.service.accept(id, h.courier).await.unwrap();
    assert_eq!(accepted.status(), RequestStatus::InProcess);

    let request = h.storage.get_request(id).await.unwrap();
    let in_process = request.as_in_process().unwrap();
    assert_eq!(in_process.state.pickup_code.as_str().len(), 4);
    assert_eq!(in_process.state.pickup_attempts, 0);
}

#[test_log::test(tokio::test)]
async fn reject_is_terminal_and_generates_no_code() {
    let h = Harness::new();
    let id = h.create().await;

    let rejected = h.service.reject(id, h.courier).await.unwrap();
    assert_eq!(rejected.status(), RequestStatus::Rejected);

    // No pickup code was ever issued, so the sender has nothing to fetch
    let err = h.service.pickup_code(id, h.requester).await.unwrap_err();
    assert!(matches!(err, HandoffError::RequestNotFound(_)));

    // Terminal: a later accept is refused
    let err = h.service.accept(id, h.courier).await.unwrap_err();
    assert!(matches!(err, HandoffError::RequestNotFound(_)));
}

#[test_log::test(tokio::test)]
async fn full_handoff_happy_path_with_one_wrong_guess() {
    let h = Harness::new();
    let id = h.create().await;
    h.service
        .confirm_payment(id, h.requester, "pi_0042".to_string())
        .await
        .unwrap();

    h.service.accept(id, h.courier).await.unwrap();

    // Sender fetches the pickup code and the courier's contact details
    let pickup = h.service.pickup_code(id, h.requester).await.unwrap();
    assert_eq!(pickup.contact.name, "Courier");

    // One wrong guess burns an attempt but changes nothing else
    let err = h
        .service
        .validate_pickup_code(id, h.courier, &wrong_guess(pickup.code.as_str()))
        .await
        .unwrap_err();
    match err {
        HandoffError::InvalidCode {
            remaining_attempts, ..
        } => assert_eq!(remaining_attempts, 2),
        other => panic!("expected InvalidCode, got {:?}", other),
    }
    assert_eq!(h.status(id).await, RequestStatus::InProcess);

    // The right code moves the item to the courier and issues stage two
    let in_transit = h
        .service
        .validate_pickup_code(id, h.courier, pickup.code.as_str())
        .await
        .unwrap();
    assert_eq!(in_transit.status(), RequestStatus::InTransit);
    let delivery_state = in_transit.as_in_transit().unwrap();
    assert_eq!(delivery_state.state.delivery_code.as_str().len(), 4);
    assert_eq!(delivery_state.state.delivery_attempts, 0);

    // The pickup code can no longer be fetched; the delivery code can
    let err = h.service.pickup_code(id, h.requester).await.unwrap_err();
    assert!(matches!(err, HandoffError::RequestNotFound(_)));
    let delivery = h.service.delivery_code(id, h.requester).await.unwrap();
    assert_eq!(delivery.contact.name, "Recipient");

    // Final handoff
    let completed = h
        .service
        .validate_delivery_code(id, h.courier, delivery.code.as_str())
        .await
        .unwrap();
    assert_eq!(completed.status(), RequestStatus::Completed);
    match completed {
        AnyRequest::Completed(req) => {
            assert!(req.state.delivery_verified_at <= chrono::Utc::now());
        }
        other => panic!("expected completed request, got {:?}", other),
    }

    // Sender was notified at each milestone
    let kinds: Vec<NotificationKind> = h.notifier.sent().iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::RequestAccepted,
            NotificationKind::PickupVerified,
            NotificationKind::DeliveryCompleted,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn exhausted_attempts_leave_the_request_stuck() {
    let h = Harness::new();
    let id = h.create().await;
    h.service.accept(id, h.courier).await.unwrap();
    let pickup = h.service.pickup_code(id, h.requester).await.unwrap();
    let wrong = wrong_guess(pickup.code.as_str());

    // Three wrong guesses count down to zero without a state change
    for expected_remaining in [2u32, 1, 0] {
        let err = h
            .service
            .validate_pickup_code(id, h.courier, &wrong)
            .await
            .unwrap_err();
        match err {
            HandoffError::InvalidCode {
                remaining_attempts, ..
            } => assert_eq!(remaining_attempts, expected_remaining),
            other => panic!("expected InvalidCode, got {:?}", other),
        }
        assert_eq!(h.status(id).await, RequestStatus::InProcess);
    }

    // The counter is full: even the correct code is refused, the counter
    // does not grow, and the request stays where it is. Unsticking it is a
    // separate administrative path, not an automatic rejection.
    for guess in [wrong.as_str(), pickup.code.as_str()] {
        let err = h
            .service
            .validate_pickup_code(id, h.courier, guess)
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::AttemptsExhausted { .. }));
    }
    let request = h.storage.get_request(id).await.unwrap();
    let in_process = request.as_in_process().expect("request should be stuck in_process");
    assert_eq!(in_process.state.pickup_attempts, 3);

    // The sender can still read the code of the stuck request
    assert!(h.service.pickup_code(id, h.requester).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn concurrent_wrong_guesses_both_count() {
    let h = Harness::new();
    let id = h.create().await;
    h.service.accept(id, h.courier).await.unwrap();
    let pickup = h.service.pickup_code(id, h.requester).await.unwrap();
    let wrong = wrong_guess(pickup.code.as_str());

    let service = Arc::new(h.service);
    let (a, b) = tokio::join!(
        {
            let service = service.clone();
            let wrong = wrong.clone();
            let courier = h.courier;
            tokio::spawn(async move { service.validate_pickup_code(id, courier, &wrong).await })
        },
        {
            let service = service.clone();
            let wrong = wrong.clone();
            let courier = h.courier;
            tokio::spawn(async move { service.validate_pickup_code(id, courier, &wrong).await })
        },
    );

    let mut remainings = vec![];
    for result in [a.unwrap(), b.unwrap()] {
        match result.unwrap_err() {
            HandoffError::InvalidCode {
                remaining_attempts, ..
            } => remainings.push(remaining_attempts),
            other => panic!("expected InvalidCode, got {:?}", other),
        }
    }
    remainings.sort();

    // Each submission observed its own post-increment value: no lost update
    assert_eq!(remainings, vec![1, 2]);
    let request = h.storage.get_request(id).await.unwrap();
    assert_eq!(
        request.as_in_process().unwrap().state.pickup_attempts,
        2,
        "both concurrent attempts must be counted"
    );
}

#[test_log::test(tokio::test)]
async fn active_codes_block_reuse_until_completion() {
    let h = Harness::new();
    let id = h.create().await;
    h.service.accept(id, h.courier).await.unwrap();
    let pickup = h.service.pickup_code(id, h.requester).await.unwrap();

    // Pickup code is active while in_process...
    assert!(
        h.storage
            .code_in_use(handoff::CodeStage::Pickup, &pickup.code)
            .await
            .unwrap()
    );

    h.service
        .validate_pickup_code(id, h.courier, pickup.code.as_str())
        .await
        .unwrap();
    let delivery = h.service.delivery_code(id, h.requester).await.unwrap();

    // ...and stays active through in_transit, alongside the delivery code
    assert!(
        h.storage
            .code_in_use(handoff::CodeStage::Pickup, &pickup.code)
            .await
            .unwrap()
    );
    assert!(
        h.storage
            .code_in_use(handoff::CodeStage::Delivery, &delivery.code)
            .await
            .unwrap()
    );

    // Completion releases both values back to the code space
    h.service
        .validate_delivery_code(id, h.courier, delivery.code.as_str())
        .await
        .unwrap();
    assert!(
        !h.storage
            .code_in_use(handoff::CodeStage::Pickup, &pickup.code)
            .await
            .unwrap()
    );
    assert!(
        !h.storage
            .code_in_use(handoff::CodeStage::Delivery, &delivery.code)
            .await
            .unwrap()
    );
}

#[test_log::test(tokio::test)]
async fn delivery_code_cannot_be_fetched_before_transit() {
    let h = Harness::new();
    let id = h.create().await;
    h.service.accept(id, h.courier).await.unwrap();

    let err = h.service.delivery_code(id, h.requester).await.unwrap_err();
    assert!(matches!(err, HandoffError::RequestNotFound(_)));
}

#[test_log::test(tokio::test)]
async fn listings_are_scoped_per_party() {
    let h = Harness::new();
    let first = h.create().await;
    let second = h.create().await;
    let other_courier = UserId::from(Uuid::new_v4());
    h.service
        .create_request(new_request(h.requester, other_courier))
        .await
        .unwrap();

    let courier_view = h.service.requests_for_courier(h.courier).await.unwrap();
    let courier_ids: Vec<RequestId> = courier_view.iter().map(|r| r.id()).collect();
    assert_eq!(courier_view.len(), 2);
    assert!(courier_ids.contains(&first) && courier_ids.contains(&second));

    let sender_view = h.service.requests_for_requester(h.requester).await.unwrap();
    assert_eq!(sender_view.len(), 3);

    assert!(
        h.service
            .requests_for_courier(other_courier)
            .await
            .unwrap()
            .len()
            == 1
    );
}
