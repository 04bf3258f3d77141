// tests/purchase_probe.rs
use httpmock::prelude::*;
use listing_hunter::http::HttpContext;
use listing_hunter::purchase::{Candidate, Encoding};
use listing_hunter::{Listing, PurchaseExecutor, PurchaseOutcome, Purchaser};
use serde_json::{json, Map};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn executor() -> PurchaseExecutor {
    let http = HttpContext::new(4, Duration::from_secs(2), Some("k".into())).unwrap();
    PurchaseExecutor::new(http, vec![], Some("Mazda".into())).with_retry(2, Duration::from_millis(1))
}

fn candidate(url: String) -> Candidate {
    Candidate::new(url, Map::new(), Encoding::Json)
}

fn listing(v: serde_json::Value) -> Listing {
    Listing::from_value(v).unwrap()
}

#[tokio::test]
async fn stops_at_first_success_and_never_contacts_later_candidates() {
    let server = MockServer::start_async().await;
    let a = server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(404).body("Not Found");
        })
        .await;
    let b = server
        .mock_async(|when, then| {
            when.method(POST).path("/b");
            then.status(200).body(r#"{"status":"ok"}"#);
        })
        .await;
    let c = server
        .mock_async(|when, then| {
            when.method(POST).path("/c");
            then.status(200).body(r#"{"status":"ok"}"#);
        })
        .await;

    let report = executor()
        .probe(&[
            candidate(server.url("/a")),
            candidate(server.url("/b")),
            candidate(server.url("/c")),
        ])
        .await;

    assert_eq!(report.outcome, PurchaseOutcome::Succeeded);
    assert_eq!(report.probes, 2);
    a.assert_hits_async(1).await;
    b.assert_hits_async(1).await;
    c.assert_hits_async(0).await;
}

#[tokio::test]
async fn auth_failure_stops_everything() {
    let server = MockServer::start_async().await;
    let a = server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(401).body(r#"{"error":"invalid_token"}"#);
        })
        .await;
    let b = server
        .mock_async(|when, then| {
            when.method(POST).path("/b");
            then.status(200);
        })
        .await;

    let report = executor()
        .probe(&[candidate(server.url("/a")), candidate(server.url("/b"))])
        .await;
    assert_eq!(report.outcome, PurchaseOutcome::AuthRejected);
    assert!(!report.success());
    a.assert_hits_async(1).await;
    b.assert_hits_async(0).await;
}

#[tokio::test]
async fn insufficient_funds_is_terminal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(400)
                .body(r#"{"errors":["Insufficient funds on balance"]}"#);
        })
        .await;
    let b = server
        .mock_async(|when, then| {
            when.method(POST).path("/b");
            then.status(200);
        })
        .await;

    let report = executor()
        .probe(&[candidate(server.url("/a")), candidate(server.url("/b"))])
        .await;
    assert_eq!(report.outcome, PurchaseOutcome::Terminal);
    assert!(report.detail.contains("HTTP 400"));
    assert!(report.detail.contains("Insufficient"));
    b.assert_hits_async(0).await;
}

#[tokio::test]
async fn secret_complaint_moves_on_to_next_candidate() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(400).body(r#"{"errors":["Secret answer required"]}"#);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/b");
            then.status(200).body("{}");
        })
        .await;

    let report = executor()
        .probe(&[candidate(server.url("/a")), candidate(server.url("/b"))])
        .await;
    assert!(report.success());
    assert_eq!(report.probes, 2);
}

#[tokio::test]
async fn retry_marker_resends_same_candidate_up_to_limit() {
    let server = MockServer::start_async().await;
    let a = server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(429).body(r#"{"errors":["retry_request"]}"#);
        })
        .await;

    let report = executor().probe(&[candidate(server.url("/a"))]).await;
    assert_eq!(report.outcome, PurchaseOutcome::Exhausted);
    // first send plus two retries
    a.assert_hits_async(3).await;
    assert_eq!(report.probes, 3);
}

#[tokio::test]
async fn full_candidate_walk_against_source_host() {
    let server = MockServer::start_async().await;
    let buy = server
        .mock_async(|when, then| {
            when.method(POST).path("/77/buy");
            then.status(404);
        })
        .await;
    let fast = server
        .mock_async(|when, then| {
            when.method(POST).path("/77/fast-buy");
            then.status(200).body(r#"{"success":true}"#);
        })
        .await;
    let market = server
        .mock_async(|when, then| {
            when.method(POST).path("/market/77/buy");
            then.status(200);
        })
        .await;

    let report = executor()
        .purchase(
            &server.url("/mihoyo?order_by=pdate_to_down_upload"),
            &listing(json!({"item_id": 77, "title": "x", "price": 10})),
            &CancellationToken::new(),
        )
        .await;

    assert!(report.success());
    // three payload variants, each as JSON and as form
    buy.assert_hits_async(6).await;
    fast.assert_hits_async(1).await;
    market.assert_hits_async(0).await;
    assert_eq!(report.probes, 7);
}

#[tokio::test]
async fn listing_without_id_sends_nothing() {
    let report = executor()
        .purchase(
            "https://api.lzt.market/mihoyo",
            &listing(json!({"title": "no id"})),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(report.outcome, PurchaseOutcome::InvalidListing);
    assert_eq!(report.probes, 0);
}

#[tokio::test]
async fn cancellation_ends_a_retry_wait() {
    let server = MockServer::start_async().await;
    let a = server
        .mock_async(|when, then| {
            when.method(POST).path("/a");
            then.status(429).body(r#"{"errors":["retry_request"]}"#);
        })
        .await;
    let b = server
        .mock_async(|when, then| {
            when.method(POST).path("/b");
            then.status(200);
        })
        .await;
    let http = HttpContext::new(4, Duration::from_secs(2), Some("k".into())).unwrap();
    let patient = PurchaseExecutor::new(http, vec![], None).with_retry(3, Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        patient.walk(&[candidate(server.url("/a")), candidate(server.url("/b"))], &cancel),
    )
    .await
    .expect("retry wait ignored cancellation");

    assert_eq!(report.outcome, PurchaseOutcome::Cancelled);
    assert!(report.detail.contains("HTTP 429"));
    a.assert_hits_async(1).await;
    b.assert_hits_async(0).await;
}
