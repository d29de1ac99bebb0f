use super::*;

#[test]
fn test_kind_mapping() {
    assert_eq!(GatewayError::Security("x".into()).kind(), "security_error");
    assert_eq!(GatewayError::not_found("x").kind(), "not_found");
    assert_eq!(
        GatewayError::InvalidParameter("x".into()).kind(),
        "invalid_parameter"
    );
    assert_eq!(GatewayError::Timeout("x".into()).kind(), "timeout");
    assert_eq!(GatewayError::Conflict("x".into()).kind(), "conflict");
    assert_eq!(
        GatewayError::Internal(anyhow::anyhow!("boom")).kind(),
        "internal_error"
    );
}

#[test]
fn test_http_status_mapping() {
    assert_eq!(GatewayError::Security("x".into()).http_status(), 403);
    assert_eq!(GatewayError::not_found("x").http_status(), 404);
    assert_eq!(
        GatewayError::SecretNotFound {
            key: "K".into(),
            available: vec![]
        }
        .http_status(),
        400
    );
    assert_eq!(GatewayError::Timeout("x".into()).http_status(), 408);
    assert_eq!(GatewayError::Internal(anyhow::anyhow!("x")).http_status(), 500);
}

#[test]
fn test_secret_not_found_lists_keys_not_values() {
    let err = GatewayError::SecretNotFound {
        key: "MISSING".into(),
        available: vec!["API_KEY".into(), "TOKEN".into()],
    };
    let msg = err.to_string();
    assert!(msg.contains("MISSING"));
    assert!(msg.contains("API_KEY, TOKEN"));
}

#[test]
fn test_secret_not_found_empty_available() {
    let err = GatewayError::SecretNotFound {
        key: "K".into(),
        available: vec![],
    };
    assert!(err.to_string().contains("(none)"));
}

#[test]
fn test_anyhow_converts_via_question_mark() {
    fn inner() -> Result<(), GatewayError> {
        let _: i32 = "nope".parse().map_err(anyhow::Error::from)?;
        Ok(())
    }
    assert_eq!(inner().unwrap_err().kind(), "internal_error");
}

#[test]
fn test_not_found_suggestion() {
    let err = GatewayError::not_found_with_suggestion("no such file", "fs_list");
    match err {
        GatewayError::NotFound {
            suggestion_tool, ..
        } => assert_eq!(suggestion_tool, Some("fs_list")),
        other => panic!("unexpected variant: {other:?}"),
    }
}
