use modbot_core::{
    ConfigError, CoreError, DatabaseError, ErrorExt, ErrorReporter, LlmError, RedditApiError,
};
use std::time::Duration;

#[test]
fn test_error_codes() {
    let reddit_error = CoreError::RedditApi(RedditApiError::InvalidToken);
    assert_eq!(reddit_error.error_code(), "REDDIT_INVALID_TOKEN");

    let db_error = CoreError::Database(DatabaseError::DatabaseLocked);
    assert_eq!(db_error.error_code(), "DB_LOCKED");

    let llm_error = CoreError::Llm(LlmError::EmptyResponse {
        provider: "openai".to_string(),
    });
    assert_eq!(llm_error.error_code(), "LLM_EMPTY_RESPONSE");

    let config_error = CoreError::Config(ConfigError::MissingField {
        field: "subreddit".to_string(),
    });
    assert_eq!(config_error.error_code(), "CONFIG_MISSING_FIELD");
}

#[test]
fn test_retryable_errors() {
    let retryable_error =
        CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 60 });
    assert!(retryable_error.is_retryable());

    let server_error = CoreError::RedditApi(RedditApiError::ServerError { status_code: 502 });
    assert!(server_error.is_retryable());

    let rejected = CoreError::RedditApi(RedditApiError::ActionRejected {
        details: "THREAD_LOCKED".to_string(),
    });
    assert!(!rejected.is_retryable());

    let non_retryable_error = CoreError::Config(ConfigError::MissingField {
        field: "api_key".to_string(),
    });
    assert!(!non_retryable_error.is_retryable());
}

#[test]
fn test_retry_after() {
    let rate_limit_error =
        CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after: 60 });
    assert_eq!(
        rate_limit_error.retry_after(),
        Some(Duration::from_secs(60))
    );

    let llm_rate_limit = CoreError::Llm(LlmError::RateLimitExceeded {
        provider: "claude".to_string(),
        retry_after: 12,
    });
    assert_eq!(llm_rate_limit.retry_after(), Some(Duration::from_secs(12)));

    let timeout_error = CoreError::Timeout { seconds: 30 };
    assert_eq!(timeout_error.retry_after(), Some(Duration::from_secs(30)));

    let invalid = CoreError::InvalidInput {
        message: "bad".to_string(),
    };
    assert_eq!(invalid.retry_after(), None);
}

#[test]
fn test_error_reporter() {
    let reporter = ErrorReporter::new()
        .with_error_reporting(true)
        .with_warning_reporting(true);
    let error = CoreError::RedditApi(RedditApiError::InvalidToken);

    // This test just ensures the methods don't panic
    reporter.report_error(&error);
    reporter.report_warning(&error);
}
