use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::types::{
    AddDependencyRequest, AuthorizedUser, CreateTaskRequest, ErrorBody, List, Task,
    UpdateTaskRequest, UserResponse,
};
use super::RemoteTracker;
use crate::error::ApiError;

const DEFAULT_BASE_URL: &str = "https://api.clickup.com/api/v2";

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_MS: u64 = 250;
/// Transport-level cap for a single request when no run deadline is set.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// ClickUp REST client. Every call is retried on rate-limit, 5xx and
/// transport failures with exponential backoff; other failures are returned
/// to the caller immediately.
pub struct ClickUpClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    /// Once this instant passes, calls fail fast instead of retrying.
    deadline: Option<Instant>,
    /// Tag names already ensured at the space level this run.
    space_tags: Mutex<HashSet<String>>,
}

impl ClickUpClient {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: DEFAULT_BASE_URL.to_string(),
            deadline: None,
            space_tags: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        with_retry(self.deadline, || self.send(method.clone(), &url, body)).await
    }

    async fn send<B, T>(&self, method: Method, url: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self
            .http
            .request(method, url)
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", &self.token)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status.is_success() {
            debug!(%url, status = status.as_u16(), "ClickUp request succeeded");
            return serde_json::from_str(&text).map_err(|err| ApiError::Request {
                status: status.as_u16(),
                message: format!("decoding response: {err}"),
            });
        }

        Err(classify(status, &text))
    }

    fn space_tag_cached(&self, tag: &str) -> bool {
        self.space_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tag)
    }

    fn cache_space_tag(&self, tag: &str) {
        self.space_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.to_string());
    }
}

/// Maps an HTTP failure to the retry taxonomy.
fn classify(status: StatusCode, body: &str) -> ApiError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.err.is_empty() {
        body.trim().to_string()
    } else {
        parsed.err.clone()
    };

    if status == StatusCode::TOO_MANY_REQUESTS || parsed.ecode.starts_with("RATELIMIT") {
        return ApiError::RateLimited(message);
    }
    if status.is_server_error() {
        return ApiError::Server {
            status: status.as_u16(),
            message,
        };
    }
    if status == StatusCode::NOT_FOUND
        || parsed.ecode == "ITEM_013"
        || message.contains("Task not found")
    {
        return ApiError::NotFound(message);
    }
    ApiError::Request {
        status: status.as_u16(),
        message,
    }
}

/// Exponential backoff with jitter, capped at [`MAX_DELAY`].
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS));
    exp.saturating_add(jitter).min(MAX_DELAY)
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget / run deadline is exhausted. The last error is surfaced.
/// Each attempt is bounded by the time left until the deadline, so a hung
/// connection cannot outlive it.
async fn with_retry<T, F, Fut>(deadline: Option<Instant>, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ApiError::DeadlineExceeded);
            }
        }

        let outcome = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, op()).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(ApiError::DeadlineExceeded),
                }
            }
            None => op().await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        return Err(ApiError::DeadlineExceeded);
                    }
                }
                attempt += 1;
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying ClickUp request"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[async_trait]
impl RemoteTracker for ClickUpClient {
    async fn get_task(&self, task_id: &str) -> Result<Task, ApiError> {
        self.request(Method::GET, &format!("/task/{task_id}"), None::<&()>)
            .await
    }

    async fn create_task(&self, list_id: &str, req: &CreateTaskRequest) -> Result<Task, ApiError> {
        self.request(Method::POST, &format!("/list/{list_id}/task"), Some(req))
            .await
    }

    async fn update_task(&self, task_id: &str, req: &UpdateTaskRequest) -> Result<Task, ApiError> {
        self.request(Method::PUT, &format!("/task/{task_id}"), Some(req))
            .await
    }

    async fn add_tag(&self, task_id: &str, tag: &str) -> Result<(), ApiError> {
        let path = format!("/task/{task_id}/tag/{}", urlencoding::encode(tag));
        let _: Value = self.request(Method::POST, &path, None::<&()>).await?;
        Ok(())
    }

    async fn remove_tag(&self, task_id: &str, tag: &str) -> Result<(), ApiError> {
        let path = format!("/task/{task_id}/tag/{}", urlencoding::encode(tag));
        let _: Value = self.request(Method::DELETE, &path, None::<&()>).await?;
        Ok(())
    }

    async fn ensure_space_tag(&self, space_id: &str, tag: &str) -> Result<(), ApiError> {
        if self.space_tag_cached(tag) {
            return Ok(());
        }
        let body = json!({ "tag": { "name": tag } });
        let _: Value = self
            .request(Method::POST, &format!("/space/{space_id}/tag"), Some(&body))
            .await?;
        self.cache_space_tag(tag);
        Ok(())
    }

    async fn set_custom_field(
        &self,
        task_id: &str,
        field_id: &str,
        value: Value,
    ) -> Result<(), ApiError> {
        let body = json!({ "value": value });
        let _: Value = self
            .request(
                Method::POST,
                &format!("/task/{task_id}/field/{field_id}"),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<(), ApiError> {
        let body = AddDependencyRequest {
            depends_on: depends_on.to_string(),
        };
        let _: Value = self
            .request(
                Method::POST,
                &format!("/task/{task_id}/dependency"),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_list(&self, list_id: &str) -> Result<List, ApiError> {
        self.request(Method::GET, &format!("/list/{list_id}"), None::<&()>)
            .await
    }

    async fn current_user(&self) -> Result<AuthorizedUser, ApiError> {
        let resp: UserResponse = self.request(Method::GET, "/user", None::<&()>).await?;
        Ok(resp.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retryable() -> ApiError {
        ApiError::Server {
            status: 502,
            message: "bad gateway".into(),
        }
    }

    #[test]
    fn classify_rate_limit() {
        let err = classify(StatusCode::TOO_MANY_REQUESTS, r#"{"err":"slow down"}"#);
        assert!(matches!(err, ApiError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_server_error() {
        let err = classify(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, ApiError::Server { status: 502, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_not_found_by_ecode() {
        let err = classify(
            StatusCode::BAD_REQUEST,
            r#"{"err":"Task not found, deleted","ECODE":"ITEM_013"}"#,
        );
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classify_other_client_error_is_fatal() {
        let err = classify(StatusCode::UNAUTHORIZED, r#"{"err":"Token invalid"}"#);
        assert!(matches!(err, ApiError::Request { status: 401, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..40 {
            assert!(backoff_delay(attempt) <= MAX_DELAY);
        }
        // first delay is at least the base
        assert!(backoff_delay(0) >= BASE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(retryable())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(retryable()) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Server { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::Request {
                    status: 400,
                    message: "bad field".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Request { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_is_cut_at_the_deadline() {
        let deadline = Instant::now() + Duration::from_secs(5);
        // the attempt never resolves; the deadline must cut it off
        let result: Result<(), _> = with_retry(Some(deadline), || {
            std::future::pending::<Result<(), ApiError>>()
        })
        .await;

        assert!(matches!(result, Err(ApiError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_fails_fast() {
        let deadline = Instant::now() - Duration::from_secs(1);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(Some(deadline), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(retryable()) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn space_tag_cache_round_trip() {
        let client = ClickUpClient::new("token".into());
        assert!(!client.space_tag_cached("urgent"));
        client.cache_space_tag("urgent");
        assert!(client.space_tag_cached("urgent"));
    }
}
