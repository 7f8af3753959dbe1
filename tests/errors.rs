//! Tests for error conversion and downcasting.

use std::sync::Arc;

use query_cache::{
    query_key, AbortReason, FetchContext, FetchOptions, Query, QueryError, QueryResultExt,
    UsageError,
};

#[derive(Debug, Clone, PartialEq)]
struct CustomError {
    code: i32,
    message: String,
}

impl std::fmt::Display for CustomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CustomError({}): {}", self.code, self.message)
    }
}

impl std::error::Error for CustomError {}

#[derive(Debug, thiserror::Error)]
#[error("other")]
struct OtherError;

// =============================================================================
// Basic Error Conversion Tests
// =============================================================================

#[test]
fn test_user_error_from_io_error() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let query_err: QueryError = io_err.into();

    assert!(matches!(query_err, QueryError::UserError(_)));
    assert!(query_err.to_string().contains("file not found"));
    assert!(query_err.is::<std::io::Error>());
}

#[test]
fn test_user_error_from_anyhow() {
    let query_err: QueryError = anyhow::anyhow!("something went wrong").into();

    assert!(query_err.user_error().is_some());
    assert!(query_err.to_string().contains("something went wrong"));
    assert!(!query_err.is_aborted());
}

#[test]
fn test_aborted_display_names_reason() {
    let err = QueryError::Aborted {
        reason: AbortReason::custom("deadline"),
    };
    assert!(err.is_aborted());
    assert!(err.user_error().is_none());
    assert!(err.to_string().contains("deadline"));
}

#[test]
fn test_usage_error_display() {
    let err = UsageError::Disposed {
        key: query_key!["users", 1],
    };
    assert_eq!(err.to_string(), r#"query ["users", 1] has been disposed"#);
    assert!(UsageError::NoRuntime.to_string().contains("tokio runtime"));
}

// =============================================================================
// Question Mark Operator Tests
// =============================================================================

fn parse(input: &str) -> Result<i32, QueryError> {
    Ok(input.parse::<i32>()?)
}

#[test]
fn test_question_mark_converts_std_errors() {
    assert_eq!(parse("42").ok(), Some(42));
    let err = parse("forty-two").unwrap_err();
    assert!(err.is::<std::num::ParseIntError>());
}

#[tokio::test]
async fn test_question_mark_inside_work_function() {
    let query = Query::new(query_key!["parse"], |_ctx: FetchContext| async {
        let value: i32 = "not a number".parse()?;
        Ok::<_, QueryError>(value)
    });

    let err = query
        .fetch(FetchOptions::default())
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is::<std::num::ParseIntError>());
}

// =============================================================================
// Downcasting Tests
// =============================================================================

#[test]
fn test_downcast_err_matches_type() {
    let result: Result<Arc<i32>, QueryError> = Err(anyhow::Error::from(CustomError {
        code: 404,
        message: "missing".to_string(),
    })
    .into());

    match result.downcast_err::<CustomError>() {
        Ok(Err(typed)) => {
            assert_eq!(typed.code, 404);
            assert_eq!(typed.get().message, "missing");
            assert_eq!(typed.to_string(), "CustomError(404): missing");
        }
        other => panic!("expected CustomError, got {:?}", other),
    }
}

#[test]
fn test_downcast_err_passes_through_other_errors() {
    let result: Result<Arc<i32>, QueryError> = Err(QueryError::from(OtherError));
    assert!(matches!(
        result.downcast_err::<CustomError>(),
        Err(QueryError::UserError(_))
    ));

    let aborted: Result<Arc<i32>, QueryError> = Err(QueryError::Aborted {
        reason: AbortReason::Cancelled,
    });
    assert!(matches!(
        aborted.downcast_err::<CustomError>(),
        Err(QueryError::Aborted { .. })
    ));

    let ok: Result<Arc<i32>, QueryError> = Ok(Arc::new(1));
    assert!(matches!(ok.downcast_err::<CustomError>(), Ok(Ok(v)) if *v == 1));
}

#[tokio::test]
async fn test_cached_error_is_shared_with_waiters() {
    let query = Query::new(query_key!["k"], |_ctx: FetchContext| async {
        Err::<(), _>(QueryError::from(CustomError {
            code: 1,
            message: "boom".to_string(),
        }))
    });

    let err = query
        .fetch(FetchOptions::default())
        .unwrap()
        .await
        .unwrap_err();
    let cached = query.state().error.unwrap();
    assert!(Arc::ptr_eq(
        err.user_error().unwrap(),
        cached.user_error().unwrap()
    ));
}
