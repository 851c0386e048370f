//! Endpoint failover
//!
//! One client per configured cluster URL, tried in order until one answers.
//! Each endpoint sits behind a circuit breaker so an endpoint that just failed
//! is skipped by the following requests of the same run.
//!
//! Only endpoint faults (transport errors, 5xx) move on to the next endpoint. A
//! request the cluster answered and rejected is returned as is and never resent.
//!
//! Breaker transitions:
//! - Closed → Open: after `failure_threshold` consecutive failures
//! - Open → HalfOpen: once `recovery_timeout` has elapsed
//! - HalfOpen → Closed: on success
//! - HalfOpen → Open: on failure

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Failover errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailoverError {
    #[error("No cluster endpoints configured")]
    NoEndpoints,

    #[error("All endpoints failed for {operation}: {}", .failures.join("; "))]
    AllEndpointsFailed {
        operation: String,
        failures: Vec<String>,
    },

    #[error("{url} rejected {operation}: {message}")]
    Rejected {
        operation: String,
        url: String,
        message: String,
    },
}

/// Tells endpoint faults apart from requests the endpoint answered and refused
pub trait EndpointFault: fmt::Display {
    /// Whether the next endpoint should be tried and this one's breaker charged
    fn is_endpoint_fault(&self) -> bool;
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before an endpoint is skipped
    pub failure_threshold: u32,
    /// Time before a skipped endpoint is tried again
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Per-endpoint circuit breaker
pub struct Breaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a request may go to this endpoint now
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                }
                recovered
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
            }
            BreakerState::HalfOpen => inner.state = BreakerState::Open,
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

struct Endpoint<C: ?Sized> {
    url: String,
    client: Arc<C>,
    breaker: Breaker,
}

/// Ordered set of cluster endpoints sharing one client type
pub struct EndpointPool<C: ?Sized> {
    endpoints: Vec<Endpoint<C>>,
}

impl<C: ?Sized> fmt::Debug for EndpointPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("urls", &self.urls())
            .finish()
    }
}

impl<C: ?Sized> EndpointPool<C> {
    pub fn urls(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.url.as_str()).collect()
    }

    /// Breaker state of the endpoint at `url`
    pub fn state_of(&self, url: &str) -> Option<BreakerState> {
        self.endpoints
            .iter()
            .find(|e| e.url == url)
            .map(|e| e.breaker.state())
    }
}

impl<C: ?Sized + Send + Sync> EndpointPool<C> {
    /// Create a pool; the first endpoint is preferred
    pub fn new(
        endpoints: Vec<(String, Arc<C>)>,
        config: BreakerConfig,
    ) -> Result<Self, FailoverError> {
        if endpoints.is_empty() {
            return Err(FailoverError::NoEndpoints);
        }
        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|(url, client)| Endpoint {
                    url,
                    client,
                    breaker: Breaker::new(config.clone()),
                })
                .collect(),
        })
    }

    /// Run `op` against each endpoint in order and return the first success
    ///
    /// A rejection from an answering endpoint ends the call without failover.
    pub async fn call<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, FailoverError>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: EndpointFault,
    {
        let mut failures = Vec::new();

        for endpoint in &self.endpoints {
            if !endpoint.breaker.allow_request() {
                debug!(url = %endpoint.url, operation, "Endpoint breaker open, skipping");
                failures.push(format!("{}: circuit open", endpoint.url));
                continue;
            }

            match op(endpoint.client.clone()).await {
                Ok(value) => {
                    endpoint.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if !e.is_endpoint_fault() => {
                    endpoint.breaker.record_success();
                    warn!(url = %endpoint.url, operation, error = %e, "Request rejected");
                    return Err(FailoverError::Rejected {
                        operation: operation.to_string(),
                        url: endpoint.url.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    endpoint.breaker.record_failure();
                    warn!(url = %endpoint.url, operation, error = %e, "Endpoint request failed");
                    failures.push(format!("{}: {}", endpoint.url, e));
                }
            }
        }

        Err(FailoverError::AllEndpointsFailed {
            operation: operation.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with a fixed HTTP status
    struct Fake {
        status: u16,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status,
                calls: AtomicUsize::new(0),
            })
        }

        async fn ping(&self) -> Result<&'static str, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.status < 300 {
                Ok("pong")
            } else {
                Err(ClientError::Api {
                    status: self.status,
                    message: "master_not_discovered_exception".to_string(),
                })
            }
        }
    }

    fn config(threshold: u32, recovery: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = Breaker::new(config(2, Duration::from_secs(60)));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_breaker_success_resets() {
        let breaker = Breaker::new(config(2, Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_breaker_half_open() {
        let breaker = Breaker::new(config(1, Duration::from_millis(10)));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_empty_pool_rejected() {
        let pool = EndpointPool::<Fake>::new(Vec::new(), BreakerConfig::default());
        assert_eq!(pool.unwrap_err(), FailoverError::NoEndpoints);
    }

    #[tokio::test]
    async fn test_fails_over_to_next_endpoint() {
        let down = Fake::new(503);
        let up = Fake::new(200);
        let pool = EndpointPool::new(
            vec![("http://a".to_string(), down.clone()), ("http://b".to_string(), up.clone())],
            config(1, Duration::from_secs(60)),
        )
        .unwrap();

        let answer = pool.call("ping", |c| async move { c.ping().await }).await.unwrap();
        assert_eq!(answer, "pong");
        assert_eq!(pool.state_of("http://a"), Some(BreakerState::Open));

        // the open endpoint is skipped on the next request
        pool.call("ping", |c| async move { c.ping().await }).await.unwrap();
        assert_eq!(down.calls.load(Ordering::SeqCst), 1);
        assert_eq!(up.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_endpoints_failed() {
        let pool = EndpointPool::new(
            vec![
                ("http://a".to_string(), Fake::new(503)),
                ("http://b".to_string(), Fake::new(502)),
            ],
            BreakerConfig::default(),
        )
        .unwrap();

        let err = pool
            .call("ping", |c| async move { c.ping().await })
            .await
            .unwrap_err();
        match &err {
            FailoverError::AllEndpointsFailed { operation, failures } => {
                assert_eq!(operation, "ping");
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("http://a"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("master_not_discovered_exception"));
    }

    #[tokio::test]
    async fn test_rejection_is_not_resent() {
        let rejecting = Fake::new(400);
        let spare = Fake::new(200);
        let pool = EndpointPool::new(
            vec![
                ("http://a".to_string(), rejecting.clone()),
                ("http://b".to_string(), spare.clone()),
            ],
            config(1, Duration::from_secs(60)),
        )
        .unwrap();

        for _ in 0..3 {
            let err = pool
                .call("ping", |c| async move { c.ping().await })
                .await
                .unwrap_err();
            assert!(matches!(&err, FailoverError::Rejected { url, .. } if url == "http://a"));
        }
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 3);
        assert_eq!(spare.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pool.state_of("http://a"), Some(BreakerState::Closed));
    }

    #[test]
    fn test_pool_debug_lists_urls() {
        let pool = EndpointPool::new(
            vec![("http://a".to_string(), Fake::new(200))],
            BreakerConfig::default(),
        )
        .unwrap();
        assert!(format!("{:?}", pool).contains("http://a"));
    }
}
