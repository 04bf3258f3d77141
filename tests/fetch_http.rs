// tests/fetch_http.rs
use httpmock::prelude::*;
use listing_hunter::fetch::FetchErrorKind;
use listing_hunter::http::HttpContext;
use listing_hunter::{FetchClient, ListingFetcher, RetryPolicy};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn client(max_retries: u32) -> FetchClient {
    let http = HttpContext::new(4, Duration::from_secs(2), Some("secret-key".into())).unwrap();
    FetchClient::new(
        http,
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            jitter_ratio: 0.3,
        },
    )
}

#[tokio::test]
async fn items_are_parsed_and_bearer_is_sent() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/mihoyo")
                .header("authorization", "Bearer secret-key");
            then.status(200)
                .body(r#"{"items":[{"item_id":1,"title":"Genshin A","price":100},"junk"]}"#);
        })
        .await;

    let out = client(4).fetch(&server.url("/mihoyo")).await;
    assert!(out.is_ok());
    assert_eq!(out.items.len(), 1);
    assert_eq!(out.items[0].key().as_str(), "id:1");
    m.assert_hits_async(1).await;
}

#[tokio::test]
async fn empty_list_is_success() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/empty");
            then.status(200).body(r#"{"items":[]}"#);
        })
        .await;

    let out = client(4).fetch(&server.url("/empty")).await;
    assert!(out.is_ok());
    assert!(out.items.is_empty());
}

#[tokio::test]
async fn retry_cap_is_exact_and_failure_is_returned() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path("/broken");
            then.status(502).body("<html>bad gateway</html>");
        })
        .await;

    let out = client(4).fetch(&server.url("/broken")).await;
    assert!(!out.is_ok());
    assert!(out.items.is_empty());
    let err = out.error.unwrap();
    assert_eq!(err.kind, FetchErrorKind::Body);
    assert!(err.cause.starts_with("HTTP 502"));
    m.assert_hits_async(4).await;
}

#[tokio::test]
async fn missing_items_field_is_a_failure() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path("/shape");
            then.status(200).body(r#"{"error":"rate limited"}"#);
        })
        .await;

    let out = client(2).fetch_with_retries(&server.url("/shape"), 2).await;
    assert_eq!(out.error.unwrap().kind, FetchErrorKind::Shape);
    m.assert_hits_async(2).await;
}

#[tokio::test]
async fn unreachable_host_is_a_transport_failure() {
    let out = client(2).fetch("http://127.0.0.1:1/none").await;
    let err = out.error.unwrap();
    assert!(matches!(
        err.kind,
        FetchErrorKind::Transport | FetchErrorKind::Timeout
    ));
}

#[tokio::test]
async fn cancellation_cuts_the_backoff_short() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path("/down");
            then.status(503).body("maintenance");
        })
        .await;
    let http = HttpContext::new(4, Duration::from_secs(2), None).unwrap();
    let slow_backoff = FetchClient::new(
        http,
        RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        },
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let out = tokio::time::timeout(
        Duration::from_secs(5),
        slow_backoff.fetch_until_cancelled(&server.url("/down"), &cancel),
    )
    .await
    .expect("backoff kept sleeping after cancellation");

    assert!(!out.is_ok());
    m.assert_hits_async(1).await;
}
