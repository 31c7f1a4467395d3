use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use reqchain::adapter::test::{StubResponse, Stubs};
use reqchain::prelude::{Connection, ErrorCode, HandlerArgs, RequestBody, RetryOptions};
use reqchain::{Registries, StatusMatcher};

fn connection_with_retry(stubs: &Stubs, options: RetryOptions, raise_error: bool) -> Connection {
    let stubs = stubs.clone();
    Connection::builder("http://retry.test")
        .registries(Registries::isolated().with_default_adapter("test"))
        .no_proxy()
        .configure(move |pipeline| {
            pipeline.request("url_encoded", HandlerArgs::none())?;
            pipeline.request("retry", HandlerArgs::new(options))?;
            if raise_error {
                pipeline.response("raise_error", HandlerArgs::none())?;
            }
            pipeline.adapter("test", HandlerArgs::new(stubs))?;
            Ok(())
        })
        .expect("configure pipeline")
        .try_build()
        .expect("build connection")
}

#[test]
fn retryable_statuses_are_retried_until_success() {
    let stubs = Stubs::new();
    stubs.on(
        Method::GET,
        "/flaky",
        [
            StubResponse::status(503),
            StubResponse::status(503),
            StubResponse::ok("done"),
        ],
    );
    let connection = connection_with_retry(
        &stubs,
        RetryOptions::new()
            .max(3)
            .retry_statuses([StatusMatcher::from(500_u16..=599)]),
        false,
    );

    let response = connection.get("/flaky").expect("eventual success");
    assert_eq!(response.body(), Some(&Bytes::from_static(b"done")));
    assert_eq!(stubs.calls(&Method::GET, "/flaky"), 3);
}

#[test]
fn timeouts_are_retried_then_surface_after_exhaustion() {
    let stubs = Stubs::new();
    stubs.get("/slow", StubResponse::timeout());
    let connection = connection_with_retry(&stubs, RetryOptions::new().max(2), false);

    let error = connection.get("/slow").expect_err("always times out");
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(stubs.calls(&Method::GET, "/slow"), 3);
}

#[test]
fn post_is_not_retried_by_default() {
    let stubs = Stubs::new();
    stubs.post("/orders", StubResponse::connection_failed());
    let connection = connection_with_retry(&stubs, RetryOptions::new().max(3), false);

    let error = connection
        .post("/orders", RequestBody::params([("sku", "A-1")]))
        .expect_err("connection refused");
    assert_eq!(error.code(), ErrorCode::ConnectionFailed);
    assert_eq!(stubs.calls(&Method::POST, "/orders"), 1);
}

#[test]
fn retry_if_opts_post_in_and_resends_the_same_body() {
    let stubs = Stubs::new();
    stubs.on(
        Method::POST,
        "/orders",
        [StubResponse::connection_failed(), StubResponse::status(201)],
    );
    let connection = connection_with_retry(
        &stubs,
        RetryOptions::new()
            .max(1)
            .retry_if(|env, _| env.request_headers().contains_key("content-type")),
        false,
    );

    let response = connection
        .post("/orders", RequestBody::params([("sku", "A-1"), ("qty", "2")]))
        .expect("retried post succeeds");
    assert_eq!(response.status().map(|status| status.as_u16()), Some(201));

    let bodies: Vec<Bytes> = stubs
        .requests()
        .into_iter()
        .map(|request| request.body)
        .collect();
    assert_eq!(
        bodies,
        vec![
            Bytes::from_static(b"sku=A-1&qty=2"),
            Bytes::from_static(b"sku=A-1&qty=2"),
        ]
    );
}

#[test]
fn retry_after_zero_retries_immediately() {
    let stubs = Stubs::new();
    stubs.on(
        Method::GET,
        "/limited",
        [
            StubResponse::status(429).header("retry-after", "0"),
            StubResponse::ok("allowed"),
        ],
    );
    let connection = connection_with_retry(
        &stubs,
        RetryOptions::new()
            .max(1)
            .max_interval(Duration::from_secs(1))
            .retry_statuses([StatusMatcher::from(429_u16)]),
        false,
    );

    let response = connection.get("/limited").expect("second attempt allowed");
    assert!(response.is_success());
    assert_eq!(stubs.calls(&Method::GET, "/limited"), 2);
}

#[test]
fn http_status_errors_from_inner_middleware_are_retryable_when_listed() {
    let stubs = Stubs::new();
    stubs.on(
        Method::GET,
        "/report",
        [StubResponse::status(500), StubResponse::ok("ready")],
    );
    let exhausted = Arc::new(AtomicUsize::new(0));
    let exhausted_hits = Arc::clone(&exhausted);
    let connection = connection_with_retry(
        &stubs,
        RetryOptions::new()
            .max(1)
            .exceptions([ErrorCode::HttpStatus])
            .exhausted_retries_block(move |_, _, _| {
                exhausted_hits.fetch_add(1, Ordering::SeqCst);
            }),
        true,
    );

    connection.get("/report").expect("retried past the 500");
    assert_eq!(stubs.calls(&Method::GET, "/report"), 2);
    assert_eq!(exhausted.load(Ordering::SeqCst), 0);
}

#[test]
fn exhausted_status_retries_hand_back_the_final_response() {
    let stubs = Stubs::new();
    stubs.get("/down", StubResponse::status(502).body("bad gateway"));
    let exhausted = Arc::new(AtomicUsize::new(0));
    let exhausted_hits = Arc::clone(&exhausted);
    let connection = connection_with_retry(
        &stubs,
        RetryOptions::new()
            .max(2)
            .retry_statuses([StatusMatcher::from(502_u16)])
            .exhausted_retries_block(move |_, _, reason| {
                assert_eq!(reason.status().map(|status| status.as_u16()), Some(502));
                exhausted_hits.fetch_add(1, Ordering::SeqCst);
            }),
        false,
    );

    let response = connection.get("/down").expect("status failures are not errors");
    assert_eq!(response.status().map(|status| status.as_u16()), Some(502));
    assert_eq!(stubs.calls(&Method::GET, "/down"), 3);
    assert_eq!(exhausted.load(Ordering::SeqCst), 1);
}
