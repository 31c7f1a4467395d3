use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, SystemTime};

use http::header::HeaderName;
use http::{HeaderMap, Method, StatusCode};
use rand::RngExt;
use tracing::{debug, warn};

use crate::env::Env;
use crate::error::{Error, ErrorCode};
use crate::handler::{App, Handler, HandlerArgs, HandlerClass};
use crate::util::{parse_delta_seconds, parse_retry_after, redact_url_for_logs};

const DEFAULT_RATE_LIMIT_RESET_HEADER: &str = "ratelimit-reset";

/// Why an attempt is a retry candidate.
#[derive(Clone, Copy, Debug)]
pub enum RetryReason<'a> {
    Error(&'a Error),
    /// A response whose status is in the retryable status set.
    Status(StatusCode),
}

impl RetryReason<'_> {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Error(error) => error.code(),
            Self::Status(_) => ErrorCode::RetriableResponse,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Error(_) => None,
            Self::Status(status) => Some(*status),
        }
    }
}

impl std::fmt::Display for RetryReason<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(error) => write!(formatter, "{error}"),
            Self::Status(status) => write!(formatter, "retriable response status {status}"),
        }
    }
}

/// Passed to the retry callback right before the retry sleep.
pub struct RetryContext<'a> {
    pub env: &'a Env,
    pub options: &'a RetryOptions,
    /// Retries already performed before this one.
    pub retry_count: usize,
    /// Retries left after this one.
    pub remaining: usize,
    pub reason: RetryReason<'a>,
    pub will_retry_in: Duration,
}

pub type RetryIf = Arc<dyn Fn(&Env, &RetryReason<'_>) -> bool + Send + Sync>;
pub type RetryBlock = Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>;
pub type ExhaustedRetriesBlock = Arc<dyn Fn(&Env, &RetryOptions, &RetryReason<'_>) + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    max: usize,
    interval: Duration,
    max_interval: Duration,
    interval_randomness: f64,
    backoff_factor: f64,
    exceptions: BTreeSet<ErrorCode>,
    methods: Vec<Method>,
    retry_statuses: Vec<RangeInclusive<u16>>,
    rate_limit_reset_header: HeaderName,
    retry_if: Option<RetryIf>,
    retry_block: Option<RetryBlock>,
    exhausted_retries_block: Option<ExhaustedRetriesBlock>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryOptions")
            .field("max", &self.max)
            .field("interval", &self.interval)
            .field("max_interval", &self.max_interval)
            .field("interval_randomness", &self.interval_randomness)
            .field("backoff_factor", &self.backoff_factor)
            .field("exceptions", &self.exceptions)
            .field("methods", &self.methods)
            .field("retry_statuses", &self.retry_statuses)
            .field("rate_limit_reset_header", &self.rate_limit_reset_header)
            .field("retry_if", &self.retry_if.is_some())
            .field("retry_block", &self.retry_block.is_some())
            .field(
                "exhausted_retries_block",
                &self.exhausted_retries_block.is_some(),
            )
            .finish()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max: 2,
            interval: Duration::ZERO,
            max_interval: Duration::MAX,
            interval_randomness: 0.0,
            backoff_factor: 1.0,
            exceptions: default_retryable_error_codes(),
            methods: default_idempotent_methods(),
            retry_statuses: Vec::new(),
            rate_limit_reset_header: HeaderName::from_static(DEFAULT_RATE_LIMIT_RESET_HEADER),
            retry_if: None,
            retry_block: None,
            exhausted_retries_block: None,
        }
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retries after the first attempt.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        if self.max_interval < self.interval {
            self.max_interval = self.interval;
        }
        self
    }

    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn interval_randomness(mut self, interval_randomness: f64) -> Self {
        self.interval_randomness = if interval_randomness.is_finite() {
            interval_randomness.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = if backoff_factor.is_finite() {
            backoff_factor.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn exceptions(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.exceptions = codes.into_iter().collect();
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Accepts single codes (`503`) and inclusive ranges (`500..=599`).
    pub fn retry_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StatusMatcher>,
    {
        self.retry_statuses = statuses
            .into_iter()
            .map(|status| status.into().0)
            .collect();
        self
    }

    pub fn rate_limit_reset_header(mut self, header: HeaderName) -> Self {
        self.rate_limit_reset_header = header;
        self
    }

    pub fn retry_if<F>(mut self, retry_if: F) -> Self
    where
        F: Fn(&Env, &RetryReason<'_>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(retry_if));
        self
    }

    pub fn retry_block<F>(mut self, retry_block: F) -> Self
    where
        F: Fn(&RetryContext<'_>) + Send + Sync + 'static,
    {
        self.retry_block = Some(Arc::new(retry_block));
        self
    }

    pub fn exhausted_retries_block<F>(mut self, block: F) -> Self
    where
        F: Fn(&Env, &RetryOptions, &RetryReason<'_>) + Send + Sync + 'static,
    {
        self.exhausted_retries_block = Some(Arc::new(block));
        self
    }

    pub fn configured_max(&self) -> usize {
        self.max
    }

    pub fn configured_interval(&self) -> Duration {
        self.interval
    }

    pub fn configured_max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        self.retry_statuses.iter().any(|range| range.contains(&code))
    }

    pub fn is_retryable_code(&self, code: ErrorCode) -> bool {
        self.exceptions.contains(&code)
    }

    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    fn should_retry(&self, env: &Env, reason: &RetryReason<'_>) -> bool {
        if self.is_retryable_method(env.method()) {
            return true;
        }
        self.retry_if
            .as_ref()
            .is_some_and(|retry_if| retry_if(env, reason))
    }

    /// `min(interval * backoff_factor^retries_used, max_interval)` plus up to
    /// `interval_randomness * interval` of jitter.
    pub(crate) fn retry_interval(&self, retries_used: usize) -> Duration {
        let exponent = retries_used.min(i32::MAX as usize) as i32;
        let interval_secs = self.interval.as_secs_f64();
        let current = (interval_secs * self.backoff_factor.powi(exponent))
            .min(self.max_interval.as_secs_f64());
        let jitter_span = self.interval_randomness * interval_secs;
        let jitter = if jitter_span > 0.0 {
            rand::rng().random_range(0.0..=jitter_span)
        } else {
            0.0
        };
        Duration::try_from_secs_f64(current + jitter).unwrap_or(self.max_interval)
    }

    /// Delay before the next attempt, or `None` when the server asks for a wait longer than
    /// `max_interval` or too long to represent.
    pub(crate) fn sleep_amount(
        &self,
        retries_used: usize,
        headers: &HeaderMap,
        now: SystemTime,
    ) -> Option<Duration> {
        let retry_after = [
            parse_retry_after(headers, now),
            parse_delta_seconds(headers, &self.rate_limit_reset_header),
        ]
        .into_iter()
        .flatten()
        .max();
        let retry_interval = self.retry_interval(retries_used);
        match retry_after {
            Some(retry_after) if retry_after > self.max_interval || retry_after == Duration::MAX => {
                None
            }
            Some(retry_after) if retry_after >= retry_interval => Some(retry_after),
            _ => Some(retry_interval),
        }
    }
}

/// A retryable status code or inclusive range of codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMatcher(RangeInclusive<u16>);

impl From<u16> for StatusMatcher {
    fn from(value: u16) -> Self {
        Self(value..=value)
    }
}

impl From<RangeInclusive<u16>> for StatusMatcher {
    fn from(value: RangeInclusive<u16>) -> Self {
        Self(value)
    }
}

impl From<StatusCode> for StatusMatcher {
    fn from(value: StatusCode) -> Self {
        Self::from(value.as_u16())
    }
}

fn default_retryable_error_codes() -> BTreeSet<ErrorCode> {
    [
        ErrorCode::Timeout,
        ErrorCode::ConnectionFailed,
        ErrorCode::RetriableResponse,
    ]
    .into_iter()
    .collect()
}

fn default_idempotent_methods() -> Vec<Method> {
    vec![
        Method::DELETE,
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
    ]
}

enum Failure {
    Error(Error),
    Status(StatusCode),
}

impl Failure {
    fn reason(&self) -> RetryReason<'_> {
        match self {
            Self::Error(error) => RetryReason::Error(error),
            Self::Status(status) => RetryReason::Status(*status),
        }
    }

    /// A status failure is a valid response, so giving up on it is not an error.
    fn into_result(self) -> crate::Result<()> {
        match self {
            Self::Error(error) => Err(error),
            Self::Status(_) => Ok(()),
        }
    }
}

/// Re-invokes the rest of the pipeline on retryable failures, sleeping between attempts.
pub struct Retry {
    app: App,
    options: RetryOptions,
}

impl Retry {
    pub fn new(app: App, options: RetryOptions) -> Self {
        Self { app, options }
    }

    /// Registry class; reads [`RetryOptions`] from the handler arguments.
    pub fn class() -> HandlerClass {
        HandlerClass::middleware("retry", |app, args: &HandlerArgs| {
            let options = args.get::<RetryOptions>().cloned().unwrap_or_default();
            Ok(Arc::new(Retry::new(app, options)) as App)
        })
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    fn attempt(&self, env: &mut Env) -> Option<Failure> {
        match self.app.call(env) {
            Ok(()) => env
                .status()
                .filter(|status| self.options.is_retryable_status(*status))
                .map(Failure::Status),
            Err(error) => Some(Failure::Error(error)),
        }
    }
}

impl Handler for Retry {
    fn call(&self, env: &mut Env) -> crate::Result<()> {
        let mut retries = self.options.max;
        let request_body = env.request_body().clone();

        loop {
            let Some(failure) = self.attempt(env) else {
                return Ok(());
            };
            let reason = failure.reason();
            if !self.options.is_retryable_code(reason.code()) {
                return failure.into_result();
            }

            if retries == 0 {
                if let Some(block) = &self.options.exhausted_retries_block {
                    block(env, &self.options, &reason);
                }
                debug!(
                    method = %env.method(),
                    url = %redact_url_for_logs(env.url()),
                    max = self.options.max,
                    "retries exhausted"
                );
                return failure.into_result();
            }
            if !self.options.should_retry(env, &reason) {
                return failure.into_result();
            }

            let retries_used = self.options.max - retries;
            let Some(delay) = self.options.sleep_amount(
                retries_used,
                env.response().headers(),
                SystemTime::now(),
            ) else {
                debug!(
                    max_interval_ms = self.options.max_interval.as_millis() as u64,
                    "retry-after exceeds max interval; not retrying"
                );
                return failure.into_result();
            };

            retries -= 1;
            request_body
                .rewind_files()
                .map_err(|source| Error::ReadBody { source })?;
            if let Some(block) = &self.options.retry_block {
                block(&RetryContext {
                    env,
                    options: &self.options,
                    retry_count: retries_used,
                    remaining: retries,
                    reason,
                    will_retry_in: delay,
                });
            }
            warn!(
                method = %env.method(),
                url = %redact_url_for_logs(env.url()),
                delay_ms = delay.as_millis() as u64,
                remaining = retries,
                error = %reason,
                "retrying request"
            );
            if !delay.is_zero() {
                sleep(delay);
            }

            env.reset_response();
            env.set_request_body(request_body.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::HeaderMap;
    use http::header::{HeaderValue, RETRY_AFTER};

    use super::{RetryOptions, StatusMatcher};

    #[test]
    fn retry_interval_grows_by_backoff_factor_within_jitter_bounds() {
        let options = RetryOptions::new()
            .max(4)
            .interval(Duration::from_millis(100))
            .backoff_factor(2.0)
            .interval_randomness(0.5);

        for retries_used in 0..4 {
            let base = 0.1 * 2_f64.powi(retries_used as i32);
            for _ in 0..64 {
                let interval = options.retry_interval(retries_used).as_secs_f64();
                assert!(interval >= base - 1e-9, "{interval} < {base}");
                assert!(interval <= base + 0.05 + 1e-9, "{interval} > {base} + jitter");
            }
        }
    }

    #[test]
    fn retry_interval_is_capped_by_max_interval() {
        let options = RetryOptions::new()
            .interval(Duration::from_millis(100))
            .max_interval(Duration::from_millis(250))
            .backoff_factor(2.0);

        assert_eq!(options.retry_interval(0), Duration::from_millis(100));
        assert_eq!(options.retry_interval(1), Duration::from_millis(200));
        assert_eq!(options.retry_interval(2), Duration::from_millis(250));
        assert_eq!(options.retry_interval(10), Duration::from_millis(250));
    }

    #[test]
    fn retry_after_wins_when_longer_than_backoff() {
        let options = RetryOptions::new()
            .interval(Duration::from_millis(100))
            .max_interval(Duration::from_secs(10));
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));

        let delay = options.sleep_amount(0, &headers, SystemTime::now());
        assert_eq!(delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn backoff_wins_when_longer_than_retry_after() {
        let options = RetryOptions::new()
            .interval(Duration::from_secs(3))
            .max_interval(Duration::from_secs(10));
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));

        let delay = options.sleep_amount(0, &headers, SystemTime::now());
        assert_eq!(delay, Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_after_beyond_max_interval_aborts() {
        let options = RetryOptions::new()
            .interval(Duration::from_millis(100))
            .max_interval(Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));

        assert_eq!(options.sleep_amount(0, &headers, SystemTime::now()), None);
    }

    #[test]
    fn over_range_wait_headers_abort_instead_of_panicking() {
        let options = RetryOptions::new();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        assert_eq!(options.sleep_amount(0, &headers, SystemTime::now()), None);

        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-reset", HeaderValue::from_static("1e25"));
        assert_eq!(options.sleep_amount(0, &headers, SystemTime::now()), None);
    }

    #[test]
    fn retry_after_accepts_http_date() {
        let options = RetryOptions::new().max_interval(Duration::from_secs(120));
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let later = now + Duration::from_secs(30);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(later)).expect("valid date header"),
        );

        assert_eq!(
            options.sleep_amount(0, &headers, now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn rate_limit_reset_header_counts_as_retry_after() {
        let options = RetryOptions::new().max_interval(Duration::from_secs(60));
        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-reset", HeaderValue::from_static("7"));

        assert_eq!(
            options.sleep_amount(0, &headers, SystemTime::now()),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn status_ranges_match_inclusively() {
        let options = RetryOptions::new()
            .retry_statuses([StatusMatcher::from(429_u16), StatusMatcher::from(500_u16..=503)]);
        assert!(options.is_retryable_status(http::StatusCode::TOO_MANY_REQUESTS));
        assert!(options.is_retryable_status(http::StatusCode::SERVICE_UNAVAILABLE));
        assert!(!options.is_retryable_status(http::StatusCode::GATEWAY_TIMEOUT));
    }
}
