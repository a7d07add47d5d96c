use modbot_core::{CoreError, RedditApiError};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Longest server-requested wait we are willing to sleep through
    pub max_rate_limit_wait_s: u64,
    /// Consecutive failed operations before the circuit opens
    pub failure_threshold: u32,
    /// Circuit breaker recovery timeout (in seconds)
    pub recovery_timeout_s: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_rate_limit_wait_s: 60,
            failure_threshold: 5,
            recovery_timeout_s: 60,
        }
    }
}

impl RetryConfig {
    /// Tuned for a short batch run against the Reddit API.
    pub fn reddit() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 20000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_rate_limit_wait_s: 30,
            failure_threshold: 3,
            recovery_timeout_s: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops calling a failing platform so the rest of a run fails fast.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    config: RetryConfig,
}

impl CircuitBreaker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            config,
        }
    }

    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                let recovery = Duration::from_secs(self.config.recovery_timeout_s);
                match self.last_failure_time {
                    Some(last_failure) if last_failure.elapsed() >= recovery => {
                        debug!("Circuit breaker transitioning to half-open for recovery test");
                        self.state = CircuitBreakerState::HalfOpen;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitBreakerState::HalfOpen {
            info!("Circuit breaker recovery successful, returning to closed state");
            self.state = CircuitBreakerState::Closed;
            self.last_failure_time = None;
        }
        self.failure_count = 0;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        match self.state {
            CircuitBreakerState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opening due to {} consecutive failures",
                        self.failure_count
                    );
                    self.state = CircuitBreakerState::Open;
                }
            }
            CircuitBreakerState::HalfOpen => {
                warn!("Circuit breaker recovery failed, returning to open state");
                self.state = CircuitBreakerState::Open;
            }
            CircuitBreakerState::Open => {}
        }
    }

    pub fn get_state(&self) -> CircuitBreakerState {
        self.state
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff
    Retry,
    /// Retry after the delay the server asked for
    RetryWithDelay(Duration),
    NoRetry,
}

pub fn get_retry_strategy(error: &CoreError) -> RetryStrategy {
    match error {
        CoreError::RedditApi(reddit_error) => match reddit_error {
            RedditApiError::RateLimitExceeded { retry_after } => {
                RetryStrategy::RetryWithDelay(Duration::from_secs(*retry_after))
            }
            RedditApiError::ServerError { .. } => RetryStrategy::Retry,
            RedditApiError::RequestTimeout => RetryStrategy::Retry,
            // Reddit occasionally returns truncated listings under load
            RedditApiError::InvalidResponse { .. } => RetryStrategy::Retry,
            RedditApiError::AuthenticationFailed { .. }
            | RedditApiError::InvalidToken
            | RedditApiError::Forbidden { .. }
            | RedditApiError::NotFound { .. }
            | RedditApiError::ActionRejected { .. }
            | RedditApiError::CircuitOpen { .. } => RetryStrategy::NoRetry,
        },
        CoreError::Network(reqwest_error) => {
            if reqwest_error.is_timeout() || reqwest_error.is_connect() {
                RetryStrategy::Retry
            } else {
                RetryStrategy::NoRetry
            }
        }
        _ => RetryStrategy::NoRetry,
    }
}

/// Errors that say the platform itself is unhealthy, as opposed to one item
/// being unavailable. Only these count towards opening the circuit.
fn is_outage(error: &CoreError) -> bool {
    get_retry_strategy(error) != RetryStrategy::NoRetry
}

/// Exponential backoff with jitter, capped at `max_delay_ms`.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let max_delay = Duration::from_millis(config.max_delay_ms);

    let multiplier = config.backoff_multiplier.powi(attempt as i32);
    let delay_ms = (config.base_delay_ms as f64 * multiplier) as u64;
    let exponential_delay = Duration::from_millis(delay_ms.min(config.max_delay_ms));

    let jitter_range = (exponential_delay.as_millis() as f64 * config.jitter_factor) as u64;
    let jitter = fastrand::u64(0..=jitter_range);

    (exponential_delay + Duration::from_millis(jitter)).min(max_delay)
}

#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub circuit_breaker_trips: u64,
}

#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    circuit_breaker: Mutex<CircuitBreaker>,
    metrics: Mutex<RetryMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            circuit_breaker: Mutex::new(CircuitBreaker::new(config.clone())),
            metrics: Mutex::new(RetryMetrics::default()),
            config,
        }
    }

    fn check_circuit(&self, operation_name: &str) -> Result<(), CoreError> {
        if lock(&self.circuit_breaker).allow_request() {
            return Ok(());
        }
        lock(&self.metrics).circuit_breaker_trips += 1;
        warn!("Circuit breaker is open, blocking request for {}", operation_name);
        Err(RedditApiError::CircuitOpen {
            operation: operation_name.to_string(),
        }
        .into())
    }

    fn record_outcome<T>(&self, result: &Result<T, CoreError>) {
        match result {
            Ok(_) => lock(&self.circuit_breaker).record_success(),
            Err(error) => {
                lock(&self.metrics).failed_operations += 1;
                if is_outage(error) {
                    lock(&self.circuit_breaker).record_failure();
                }
            }
        }
    }

    /// Runs an idempotent operation, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.check_circuit(operation_name)?;

        let mut attempt = 0;
        let result = loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        let mut metrics = lock(&self.metrics);
                        metrics.total_retries += u64::from(attempt);
                        metrics.successful_retries += 1;
                        info!("Operation {} succeeded after {} retries", operation_name, attempt);
                    }
                    break Ok(value);
                }
                Err(error) => {
                    let attempts_left = attempt + 1 < self.config.max_attempts;
                    let delay = match get_retry_strategy(&error) {
                        RetryStrategy::Retry if attempts_left => calculate_delay(attempt, &self.config),
                        RetryStrategy::RetryWithDelay(delay)
                            if attempts_left
                                && delay <= Duration::from_secs(self.config.max_rate_limit_wait_s) =>
                        {
                            delay
                        }
                        _ => {
                            debug!("Not retrying {}: {}", operation_name, error);
                            break Err(error);
                        }
                    };

                    info!("Retrying {} in {:?} due to: {}", operation_name, delay, error);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        self.record_outcome(&result);
        if let Err(error) = &result {
            error!("Operation {} failed after {} attempts: {}", operation_name, attempt + 1, error);
        }
        result
    }

    /// Runs a non-idempotent operation exactly once, still honouring the circuit.
    pub async fn execute_once<Fut, T>(&self, operation_name: &str, operation: Fut) -> Result<T, CoreError>
    where
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.check_circuit(operation_name)?;
        let result = operation.await;
        self.record_outcome(&result);
        result
    }

    pub fn get_metrics(&self) -> RetryMetrics {
        lock(&self.metrics).clone()
    }

    pub fn get_circuit_breaker_state(&self) -> CircuitBreakerState {
        lock(&self.circuit_breaker).get_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    fn server_error() -> CoreError {
        RedditApiError::ServerError { status_code: 503 }.into()
    }

    #[test]
    fn test_circuit_breaker_failure_threshold() {
        let config = RetryConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_circuit_breaker_recovery() {
        let config = RetryConfig {
            failure_threshold: 1,
            recovery_timeout_s: 0,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Open);

        std::thread::sleep(Duration::from_millis(1));
        assert!(breaker.allow_request());
        assert_eq!(breaker.get_state(), CircuitBreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_retry_strategy_for_errors() {
        let rate_limited: CoreError = RedditApiError::RateLimitExceeded { retry_after: 60 }.into();
        assert_eq!(
            get_retry_strategy(&rate_limited),
            RetryStrategy::RetryWithDelay(Duration::from_secs(60))
        );

        let not_found: CoreError = RedditApiError::NotFound {
            resource: "/comments/abc".to_string(),
        }
        .into();
        assert_eq!(get_retry_strategy(&not_found), RetryStrategy::NoRetry);
        assert_eq!(get_retry_strategy(&server_error()), RetryStrategy::Retry);
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(8000));
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(10000));

        let jittered = RetryConfig {
            jitter_factor: 0.5,
            ..config
        };
        let delay = calculate_delay(1, &jittered);
        assert!(delay >= Duration::from_millis(2000) && delay <= Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_execute_retries_transient_failures() {
        let executor = RetryExecutor::new(fast_config());
        let attempts = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute("fetch_posts", || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(server_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = executor.get_metrics();
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.successful_retries, 1);
    }

    #[tokio::test]
    async fn test_execute_keeps_original_error() {
        let executor = RetryExecutor::new(fast_config());
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), CoreError> = executor
            .execute("fetch_moderators", || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(RedditApiError::Forbidden {
                        resource: "/r/test/about/moderators".to_string(),
                    }
                    .into())
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(CoreError::RedditApi(RedditApiError::Forbidden { .. }))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        // A refused item does not count against the platform's health.
        assert_eq!(executor.get_circuit_breaker_state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_long_rate_limit_is_not_waited_out() {
        let executor = RetryExecutor::new(RetryConfig {
            max_rate_limit_wait_s: 5,
            ..fast_config()
        });
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), CoreError> = executor
            .execute("fetch_comments", || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(RedditApiError::RateLimitExceeded { retry_after: 600 }.into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_once_and_circuit_breaker() {
        let executor = RetryExecutor::new(RetryConfig {
            failure_threshold: 2,
            ..fast_config()
        });
        let attempts = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let attempts = attempts.clone();
            let result: Result<(), CoreError> = executor
                .execute_once("post_reply", async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(server_error())
                })
                .await;
            assert!(result.is_err());
        }
        // Writes are never repeated.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(executor.get_circuit_breaker_state(), CircuitBreakerState::Open);

        let blocked = executor.execute_once("ban_user", async { Ok(()) }).await;
        assert!(matches!(
            blocked,
            Err(CoreError::RedditApi(RedditApiError::CircuitOpen { .. }))
        ));
        assert_eq!(executor.get_metrics().circuit_breaker_trips, 1);
    }
}
