use article_relay::{classify, Classifier, ErrorKind, UpstreamFailure};
use http::{HeaderMap, HeaderValue};

fn response(status: u16, body: &str) -> UpstreamFailure {
    UpstreamFailure::response(status, HeaderMap::new(), body)
}

#[test]
fn taxonomy_follows_status_and_body() {
    let cases = [
        (response(401, "{}"), ErrorKind::Unauthorized, false),
        (response(403, r#"{"message":"Forbidden"}"#), ErrorKind::Forbidden, false),
        (
            response(403, r#"{"code":"missing_scopes","message":"OAuthForbidden: missing scope cms:write"}"#),
            ErrorKind::MissingPermissions,
            false,
        ),
        (response(404, ""), ErrorKind::NotFound, false),
        (response(500, "boom"), ErrorKind::ServerError, true),
        (response(504, ""), ErrorKind::ServerError, true),
        (response(409, r#"{"message":"conflict"}"#), ErrorKind::Unknown, false),
        (response(400, "not json"), ErrorKind::Unknown, false),
        (UpstreamFailure::transport("fetch failed: ECONNREFUSED"), ErrorKind::NetworkError, true),
    ];

    for (failure, kind, retryable) in cases {
        let classification = classify(&failure);
        assert_eq!(classification.kind(), &kind, "{failure:?}");
        assert_eq!(classification.is_retryable(), retryable, "{failure:?}");
    }
}

#[test]
fn throttling_uses_retry_after_or_the_configured_default() {
    let mut headers = HeaderMap::new();
    headers.insert("retry-after", HeaderValue::from_static("12"));
    headers.insert("x-ratelimit-limit", HeaderValue::from_static("60"));
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
    let with_header = classify(&UpstreamFailure::response(429, headers, ""));
    assert_eq!(with_header.kind(), &ErrorKind::RateLimited);
    assert_eq!(with_header.retry_after_secs(), Some(12));
    let quota = with_header.context().quota.clone().unwrap();
    assert_eq!(quota.limit, Some(60));
    assert_eq!(quota.remaining, Some(0));

    assert_eq!(classify(&response(429, "")).retry_after_secs(), Some(60));
    assert_eq!(Classifier::new(5).classify(&response(429, "")).retry_after_secs(), Some(5));
}

#[test]
fn validation_bodies_in_common_shapes() {
    let shapes = [
        r#"{"message":"Validation Error","details":[{"param":"slug","description":"taken"}]}"#,
        r#"{"errors":[{"field":"slug","message":"taken"}]}"#,
        r#"[{"path":["slug"],"msg":"taken"}]"#,
        r#"{"slug":"taken"}"#,
    ];
    for body in shapes {
        let classification = classify(&response(400, body));
        assert!(matches!(classification.kind(), ErrorKind::Validation(_)), "{body}");
        let fields = classification.field_errors();
        assert_eq!(fields.len(), 1, "{body}");
        assert_eq!(fields[0].field, "slug");
        assert_eq!(fields[0].message, "taken");
    }
}

#[test]
fn classification_is_deterministic() {
    let failure = response(503, r#"{"message":"maintenance"}"#);
    assert_eq!(classify(&failure), classify(&failure));
}
