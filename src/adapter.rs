//! Middleware adapter between an inbound request and the limiter.
//!
//! Transport-agnostic: callers hand over the peer address and headers, and
//! get back a [`Verdict`] carrying the status code, headers and JSON body to
//! send. The limiter is called exactly once per request and never retried.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::{AdapterConfig, FailurePolicy};
use crate::ratelimit::{Decision, RateLimiterBackend};

/// The parts of an inbound request the adapter looks at.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// Address of the connected peer
    pub peer_addr: Option<SocketAddr>,
    /// Request headers, keyed by lowercase name
    pub headers: HashMap<String, String>,
}

impl ClientRequest {
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            peer_addr,
            headers: HashMap::new(),
        }
    }

    /// Add a header; names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Derive the client identifier: `X-Real-IP`, then the first
/// `X-Forwarded-For` hop, then the peer IP.
pub fn client_identifier(request: &ClientRequest, trust_forwarded: bool) -> Option<String> {
    if trust_forwarded {
        if let Some(real_ip) = request.header("x-real-ip") {
            return Some(real_ip.to_string());
        }
        if let Some(first_hop) = request
            .header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
        {
            return Some(first_hop.to_string());
        }
    }
    request.peer_addr.map(|addr| addr.ip().to_string())
}

/// What the transport should answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict {
    /// Within quota
    Allowed {
        limit: u64,
        remaining: u64,
        reset_after_ms: u64,
    },
    /// Over quota
    Denied {
        limit: u64,
        reset_after_ms: u64,
    },
    /// Store failed and the failure policy lets the request through
    FailedOpen { error: String },
    /// Store failed and the failure policy denies
    StoreError { error: String },
    /// No identifier could be derived from the request
    Unidentified,
}

impl Verdict {
    fn from_decision(decision: &Decision) -> Self {
        let reset_after_ms = duration_millis(decision.reset_after);
        if decision.allowed {
            Verdict::Allowed {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_after_ms,
            }
        } else {
            Verdict::Denied {
                limit: decision.limit,
                reset_after_ms,
            }
        }
    }

    /// Whether the request should be passed on to the handler.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. } | Verdict::FailedOpen { .. })
    }

    /// HTTP-style status code for the response.
    pub fn status_code(&self) -> u16 {
        match self {
            Verdict::Allowed { .. } | Verdict::FailedOpen { .. } => 200,
            Verdict::Denied { .. } => 429,
            Verdict::StoreError { .. } => 503,
            Verdict::Unidentified => 403,
        }
    }

    /// Rate limit headers to attach to the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Verdict::Allowed {
                limit,
                remaining,
                reset_after_ms,
            } => vec![
                ("x-ratelimit-limit", limit.to_string()),
                ("x-ratelimit-remaining", remaining.to_string()),
                ("x-ratelimit-reset", ceil_secs(*reset_after_ms).to_string()),
            ],
            Verdict::Denied {
                limit,
                reset_after_ms,
            } => vec![
                ("x-ratelimit-limit", limit.to_string()),
                ("x-ratelimit-remaining", "0".to_string()),
                ("x-ratelimit-reset", ceil_secs(*reset_after_ms).to_string()),
                ("retry-after", ceil_secs(*reset_after_ms).to_string()),
            ],
            _ => Vec::new(),
        }
    }

    /// JSON error body for rejected requests; `None` when the request passes.
    pub fn error_body(&self) -> Option<serde_json::Value> {
        let message = match self {
            Verdict::Allowed { .. } | Verdict::FailedOpen { .. } => return None,
            Verdict::Denied { .. } => "rate limit exceeded",
            Verdict::StoreError { .. } => "rate limiter unavailable",
            Verdict::Unidentified => "error while extracting identifier",
        };
        Some(serde_json::json!({
            "error": message,
            "status": self.status_code(),
        }))
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ceil_secs(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

/// Calls the limiter once per request and turns the outcome into a verdict.
pub struct RateLimitGuard<R: RateLimiterBackend> {
    limiter: Arc<R>,
    failure_policy: FailurePolicy,
    trust_forwarded: bool,
}

impl<R: RateLimiterBackend> RateLimitGuard<R> {
    /// Create a fail-closed guard that trusts forwarding headers.
    pub fn new(limiter: Arc<R>) -> Self {
        Self::with_config(limiter, &AdapterConfig::default())
    }

    pub fn with_config(limiter: Arc<R>, config: &AdapterConfig) -> Self {
        Self {
            limiter,
            failure_policy: config.failure_policy,
            trust_forwarded: config.trust_forwarded_headers,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Evaluate an inbound request.
    #[instrument(skip(self, request), fields(peer = ?request.peer_addr))]
    pub async fn evaluate(&self, request: &ClientRequest) -> Verdict {
        let Some(identifier) = client_identifier(request, self.trust_forwarded) else {
            warn!("Could not extract client identifier");
            return Verdict::Unidentified;
        };
        self.evaluate_identifier(&identifier).await
    }

    /// Evaluate a request whose identifier the caller already knows.
    pub async fn evaluate_identifier(&self, identifier: &str) -> Verdict {
        match self.limiter.check(identifier).await {
            Ok(decision) => {
                let verdict = Verdict::from_decision(&decision);
                debug!(
                    identifier = %identifier,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate limit decision made"
                );
                verdict
            }
            Err(err) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(identifier = %identifier, error = %err, "Rate limiter failed, letting request through");
                    Verdict::FailedOpen {
                        error: err.to_string(),
                    }
                }
                FailurePolicy::Closed => {
                    warn!(identifier = %identifier, error = %err, "Rate limiter failed, denying request");
                    Verdict::StoreError {
                        error: err.to_string(),
                    }
                }
            },
        }
    }
}
