//! Per-host request gateway.
//!
//! All traffic to one physical controller goes through a FIFO lane: at
//! most one request is in flight per host, and queued requests run in
//! submission order once the active one settles. Each execution gets a
//! hard timeout and a bounded exponential-backoff retry loop. The
//! embedded targets fall over under concurrent load, so the lane is
//! load protection, not an optimization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tokio::time::{sleep, timeout};

use super::error::ApiError;

/// Timeout and retry policy applied to every request.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retries: 10,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Per-request overrides of the gateway policy.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

enum Attempt {
    /// Try again after backoff.
    Retry(ApiError),
    /// Surface immediately, no retry.
    Fatal(ApiError),
}

/// Serializing, retrying HTTP gateway for a fleet of embedded hosts.
///
/// Host keys are bare addresses (`10.0.0.7` or `10.0.0.7:8080`);
/// requests go out as plain HTTP with no authentication, which is all
/// the controllers speak.
pub struct HostGateway {
    http: reqwest::Client,
    policy: GatewayPolicy,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HostGateway {
    pub fn new(policy: GatewayPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    /// GET with default options.
    pub async fn get(&self, host: &str, path: &str) -> Result<Value, ApiError> {
        self.execute(host, Method::GET, path, None, &RequestOptions::default())
            .await
    }

    /// POST a JSON body with default options.
    pub async fn post(&self, host: &str, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.execute(host, Method::POST, path, Some(body), &RequestOptions::default())
            .await
    }

    /// Runs one request through the host's lane with retry and timeout
    /// applied. Queued callers resolve in submission order; the lane is
    /// released only after the retry loop settles.
    pub async fn execute(
        &self,
        host: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        opts: &RequestOptions,
    ) -> Result<Value, ApiError> {
        let lane = self.lane(host);
        let _slot = lane.lock().await;
        self.run_with_retries(host, method, path, body, opts).await
    }

    fn lane(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn run_with_retries(
        &self,
        host: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        opts: &RequestOptions,
    ) -> Result<Value, ApiError> {
        let per_try = opts.timeout.unwrap_or(self.policy.request_timeout);
        let max_retries = opts.max_retries.unwrap_or(self.policy.max_retries);
        let url = format!("http://{}/{}", host, path);

        let mut last_err = ApiError::Network("no attempt made".to_string());
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.policy.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(%url, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                sleep(delay).await;
            }

            match self.attempt(&url, &method, body, per_try).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(err)) => {
                    tracing::debug!(%url, %err, "request failed, not retryable");
                    return Err(err);
                }
                Err(Attempt::Retry(err)) => {
                    tracing::debug!(%url, attempt, %err, "request attempt failed");
                    last_err = err;
                }
            }
        }

        tracing::warn!(%url, retries = max_retries, %last_err, "giving up after retries");
        // A host that answered 429 to the very last attempt gets a
        // distinguished error; callers must not hammer it further.
        Err(match last_err {
            ApiError::Http { status: 429, .. } => ApiError::RateLimited,
            other => other,
        })
    }

    /// One attempt under one deadline covering send and body read.
    async fn attempt(
        &self,
        url: &str,
        method: &Method,
        body: Option<&Value>,
        per_try: Duration,
    ) -> Result<Value, Attempt> {
        let fut = async {
            let mut req = self.http.request(method.clone(), url);
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = req
                .send()
                .await
                .map_err(|e| Attempt::Retry(ApiError::Network(e.to_string())))?;

            let status = response.status().as_u16();
            match status {
                429 => Err(Attempt::Retry(ApiError::Http {
                    status,
                    body: String::new(),
                })),
                404 => Err(Attempt::Fatal(ApiError::EndpointNotFound)),
                s if (200..300).contains(&s) => {
                    let text = response
                        .text()
                        .await
                        .map_err(|e| Attempt::Retry(ApiError::Network(e.to_string())))?;
                    // Some firmwares answer writes with a bare "OK"; a
                    // 2xx with a non-JSON body is success with no data.
                    Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
                }
                _ => {
                    let text = response.text().await.unwrap_or_default();
                    Err(Attempt::Retry(ApiError::Http { status, body: text }))
                }
            }
        };

        match timeout(per_try, fut).await {
            Ok(result) => result,
            Err(_) => Err(Attempt::Retry(ApiError::Timeout {
                ms: per_try.as_millis() as u64,
            })),
        }
    }
}
