//! End-to-end grant lifecycle over the file backend and the offline gateway.

use paygrant::{
    FileStore, GrantBroker, GrantResult, GrantStatus, GrantStore, InvoiceStatus, MockGateway,
    PaygrantConfig, PaygrantError, RejectReason, SystemClock,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Setup {
    broker: Arc<GrantBroker>,
    gateway: Arc<MockGateway>,
    store: Arc<FileStore>,
    _dir: TempDir,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(SystemClock);
    let gateway = Arc::new(MockGateway::new(clock.clone(), false));
    let store = Arc::new(FileStore::new(dir.path().join("store.json")));
    let broker = Arc::new(GrantBroker::new(gateway.clone(), store.clone(), clock));
    Setup {
        broker,
        gateway,
        store,
        _dir: dir,
    }
}

async fn paid_grant(s: &Setup) -> String {
    let invoice = s.broker.create_invoice(Some(5000), None).await.unwrap();
    s.gateway.mark_paid(&invoice.invoice_id).await;
    s.broker
        .check(&invoice.invoice_id)
        .await
        .unwrap()
        .grant_token
        .unwrap()
}

#[tokio::test]
async fn unpaid_invoice_has_no_grant() {
    let s = setup();
    let invoice = s.broker.create_invoice(Some(5000), None).await.unwrap();
    assert_eq!(invoice.amount, 5000);

    let status = s.broker.check(&invoice.invoice_id).await.unwrap();
    assert!(!status.paid);
    assert!(status.grant_token.is_none());

    let stored = s.broker.invoice(&invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Created);
    assert!(stored.grant_token.is_none());
}

#[tokio::test]
async fn payment_issues_one_available_grant() {
    let s = setup();
    let invoice = s.broker.create_invoice(Some(5000), None).await.unwrap();
    s.gateway.mark_paid(&invoice.invoice_id).await;

    let status = s.broker.check(&invoice.invoice_id).await.unwrap();
    assert!(status.paid);
    let token = status.grant_token.unwrap();

    let grant = s.broker.grant(&token).await.unwrap().unwrap();
    assert_eq!(grant.remaining_uses, 1);
    assert_eq!(grant.status, GrantStatus::Available);
    assert_eq!(grant.invoice_id, invoice.invoice_id);

    let stored = s.broker.invoice(&invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(stored.grant_token.as_deref(), Some(token.as_str()));
}

#[tokio::test]
async fn duplicate_issuance_returns_same_token() {
    let s = setup();
    let invoice = s.broker.create_invoice(Some(5000), None).await.unwrap();

    let first = s.broker.issue_grant_for_invoice(&invoice.invoice_id).await.unwrap();
    let second = s.broker.issue_grant_for_invoice(&invoice.invoice_id).await.unwrap();
    assert_eq!(first, second);

    // A webhook racing the poller converges on the same grant too.
    s.gateway.mark_paid(&invoice.invoice_id).await;
    let via_callback = s.broker.callback(&invoice.invoice_id).await.unwrap();
    assert_eq!(via_callback.grant_token.as_deref(), Some(first.as_str()));
}

#[tokio::test]
async fn reserve_twice_second_is_used() {
    let s = setup();
    let token = paid_grant(&s).await;

    assert_eq!(s.broker.reserve(&token).await.unwrap(), GrantResult::accepted());
    let grant = s.store.get_grant(&token).await.unwrap().unwrap();
    assert_eq!(grant.remaining_uses, 0);
    assert_eq!(grant.status, GrantStatus::Processing);

    assert_eq!(
        s.broker.reserve(&token).await.unwrap(),
        GrantResult::rejected(RejectReason::Used)
    );
}

#[tokio::test]
async fn release_restores_exactly_one_reservation() {
    let s = setup();
    let token = paid_grant(&s).await;

    assert!(s.broker.reserve(&token).await.unwrap().ok);
    assert!(s.broker.release(&token).await.unwrap().ok);

    let grant = s.store.get_grant(&token).await.unwrap().unwrap();
    assert_eq!(grant.remaining_uses, 1);
    assert_eq!(grant.status, GrantStatus::Available);

    assert!(s.broker.reserve(&token).await.unwrap().ok);
    assert!(!s.broker.reserve(&token).await.unwrap().ok);
}

#[tokio::test]
async fn complete_is_terminal() {
    let s = setup();
    let token = paid_grant(&s).await;

    assert!(s.broker.reserve(&token).await.unwrap().ok);
    assert!(s.broker.complete(&token).await.unwrap().ok);

    let grant = s.store.get_grant(&token).await.unwrap().unwrap();
    assert_eq!(grant.status, GrantStatus::Used);
    assert_eq!(grant.remaining_uses, 0);

    for _ in 0..5 {
        assert_eq!(
            s.broker.reserve(&token).await.unwrap(),
            GrantResult::rejected(RejectReason::Used)
        );
    }
}

#[tokio::test]
async fn release_after_complete_is_a_logic_error() {
    let s = setup();
    let token = paid_grant(&s).await;
    s.broker.reserve(&token).await.unwrap();
    s.broker.complete(&token).await.unwrap();

    let result = s.broker.release(&token).await;
    assert!(matches!(
        result,
        Err(PaygrantError::GrantTransition {
            status: GrantStatus::Used,
            ..
        })
    ));
    assert!(!s.broker.reserve(&token).await.unwrap().ok);
}

#[tokio::test]
async fn unknown_token_is_invalid_never_error() {
    let s = setup();
    for token in ["does-not-exist", "0000", "ffffffff"] {
        assert_eq!(
            s.broker.reserve(token).await.unwrap(),
            GrantResult::rejected(RejectReason::Invalid)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_have_one_winner() {
    let s = setup();
    let token = paid_grant(&s).await;

    let handles: Vec<_> = (0..24)
        .map(|_| {
            let broker = s.broker.clone();
            let token = token.clone();
            tokio::spawn(async move { broker.reserve(&token).await.unwrap() })
        })
        .collect();

    let results: Vec<GrantResult> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.ok).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| r.reason == Some(RejectReason::Used))
            .count(),
        23
    );
}

#[tokio::test]
async fn grants_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");
    let clock = Arc::new(SystemClock);

    let token = {
        let gateway = Arc::new(MockGateway::new(clock.clone(), true));
        let broker = GrantBroker::new(gateway, Arc::new(FileStore::new(&path)), clock.clone());
        let invoice = broker.create_invoice(None, None).await.unwrap();
        let token = broker.check(&invoice.invoice_id).await.unwrap().grant_token.unwrap();
        assert!(broker.reserve(&token).await.unwrap().ok);
        token
    };

    let gateway = Arc::new(MockGateway::new(clock.clone(), true));
    let broker = GrantBroker::new(gateway, Arc::new(FileStore::new(&path)), clock);
    assert!(!broker.reserve(&token).await.unwrap().ok);
    assert!(broker.release(&token).await.unwrap().ok);
    assert!(broker.reserve(&token).await.unwrap().ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callbacks_and_polls_issue_one_grant() {
    let s = setup();
    let invoice = s.broker.create_invoice(Some(5000), None).await.unwrap();
    s.gateway.mark_paid(&invoice.invoice_id).await;

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let broker = s.broker.clone();
            let invoice_id = invoice.invoice_id.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    broker.callback(&invoice_id).await.unwrap().grant_token.unwrap()
                } else {
                    broker.issue_grant_for_invoice(&invoice_id).await.unwrap()
                }
            })
        })
        .collect();

    let tokens: Vec<String> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert!(tokens.iter().all(|t| t == &tokens[0]));

    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(s.store.path()).unwrap()).unwrap();
    let grants_for_invoice = document["grants"]
        .as_object()
        .unwrap()
        .values()
        .filter(|g| g["invoiceId"] == invoice.invoice_id.as_str())
        .count();
    assert_eq!(grants_for_invoice, 1);
}

#[tokio::test]
async fn check_after_restart_returns_the_same_grant() {
    let dir = TempDir::new().unwrap();
    let config = PaygrantConfig {
        mock_mode: true,
        store_path: Some(dir.path().join("store.json")),
        ..PaygrantConfig::default()
    };

    let (invoice_id, token) = {
        let broker = GrantBroker::from_config(&config).await.unwrap();
        let invoice = broker.create_invoice(None, None).await.unwrap();
        let status = broker.check(&invoice.invoice_id).await.unwrap();
        assert!(status.paid);
        (invoice.invoice_id, status.grant_token.unwrap())
    };

    let broker = GrantBroker::from_config(&config).await.unwrap();
    for _ in 0..2 {
        let status = broker.check(&invoice_id).await.unwrap();
        assert!(status.paid);
        assert_eq!(status.grant_token.as_deref(), Some(token.as_str()));
    }
    let via_callback = broker.callback(&invoice_id).await.unwrap();
    assert_eq!(via_callback.grant_token.as_deref(), Some(token.as_str()));
}
