use http::{HeaderMap, Method};
use reqchain::adapter::test::{StubResponse, Stubs};
use reqchain::prelude::{Connection, Error, ErrorCode, HandlerArgs, RequestBody, Response};
use reqchain::{PipelineBuilder, Registries};

fn stub_connection(stubs: &Stubs) -> Connection {
    let stubs = stubs.clone();
    Connection::builder("http://contract.test")
        .registries(Registries::isolated().with_default_adapter("test"))
        .no_proxy()
        .configure(move |pipeline| {
            pipeline.response("json", HandlerArgs::none())?;
            pipeline.adapter("test", HandlerArgs::new(stubs))?;
            Ok(())
        })
        .expect("configure")
        .try_build()
        .expect("connection")
}

fn assert_code(result: reqchain::Result<Response>, expected: ErrorCode) -> Error {
    let error = result.expect_err("expected failure");
    assert_eq!(error.code(), expected, "unexpected error: {error}");
    error
}

#[test]
fn error_code_strings_are_stable() {
    let expected = [
        (ErrorCode::StackLocked, "stack_locked"),
        (ErrorCode::NotRegistered, "not_registered"),
        (ErrorCode::DependencyMissing, "dependency_missing"),
        (ErrorCode::AlreadyFinished, "already_finished"),
        (ErrorCode::Timeout, "timeout"),
        (ErrorCode::ConnectionFailed, "connection_failed"),
        (ErrorCode::RetriableResponse, "retriable_response"),
        (ErrorCode::HttpStatus, "http_status"),
        (ErrorCode::InvalidProxy, "invalid_proxy"),
        (ErrorCode::StubNotFound, "stub_not_found"),
        (ErrorCode::UnsupportedMethod, "unsupported_method"),
    ];
    for (code, text) in expected {
        assert_eq!(code.as_str(), text);
        assert_eq!(code.to_string(), text);
    }
}

#[test]
fn malformed_json_response_reports_deserialize_with_body() {
    let stubs = Stubs::new();
    stubs.get(
        "/broken",
        StubResponse::ok("{not json").header("content-type", "application/json"),
    );
    let connection = stub_connection(&stubs);

    let error = assert_code(connection.get("/broken"), ErrorCode::Deserialize);
    match error {
        Error::Deserialize { body, .. } => assert_eq!(body, "{not json"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn stub_failures_carry_method_and_uri() {
    let stubs = Stubs::new();
    stubs.on(Method::PUT, "/slow", [StubResponse::timeout()]);
    let connection = stub_connection(&stubs);

    let error = assert_code(connection.put("/slow", "data"), ErrorCode::Timeout);
    match error {
        Error::Timeout { method, uri, .. } => {
            assert_eq!(method, Method::PUT);
            assert!(uri.ends_with("/slow"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn invalid_inputs_fail_before_dispatch() {
    let error = Connection::builder("not a url")
        .try_build()
        .expect_err("invalid prefix");
    assert_eq!(error.code(), ErrorCode::InvalidUri);

    let error = Connection::builder("http://contract.test")
        .header("bad header", "value")
        .expect_err("invalid header name");
    assert_eq!(error.code(), ErrorCode::InvalidHeaderName);

    let mut pipeline = PipelineBuilder::with_registries(Registries::isolated());
    let error = pipeline
        .adapter("carrier_pigeon", HandlerArgs::none())
        .map(|_| ())
        .expect_err("unregistered adapter");
    assert_eq!(error.code(), ErrorCode::NotRegistered);
    assert!(error.to_string().contains("carrier_pigeon"));
}

#[test]
fn authorization_without_credentials_is_an_invalid_handler() {
    let stubs = Stubs::new();
    stubs.get("/me", StubResponse::ok("{}"));
    let connection = Connection::builder("http://contract.test")
        .registries(Registries::isolated().with_default_adapter("test"))
        .no_proxy()
        .configure(|pipeline| {
            pipeline.request("authorization", HandlerArgs::none())?;
            Ok(())
        })
        .expect("registration succeeds")
        .try_build()
        .expect("connection");

    assert_code(connection.get("/me"), ErrorCode::InvalidHandler);
    assert_eq!(stubs.total_calls(), 0);
}

#[test]
fn methods_outside_the_verb_set_are_rejected() {
    let stubs = Stubs::new();
    let connection = stub_connection(&stubs);

    for method in [Method::TRACE, Method::CONNECT] {
        let error = assert_code(
            connection.run_request(method.clone(), "/x", RequestBody::Empty, HeaderMap::new()),
            ErrorCode::UnsupportedMethod,
        );
        assert!(error.to_string().contains(method.as_str()));
    }
    assert_eq!(stubs.total_calls(), 0);
}
