//! Resilient remote calls.
//!
//! Every remote call in the crate goes through [`Remote`]: throttling is
//! retried with decorrelated-jitter backoff, paginated describes are
//! collected in one place, and state waits fail fast on terminal states.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ec2::{Ec2Api, Page};
use crate::error::{RemoteError, Result, VpcError};

/// States a waited-on resource never leaves.
const TERMINAL_STATES: &[&str] = &["failed", "terminated"];

/// Default bound for state waits and keep-trying loops.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Backoff schedule shared by retries and polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Lower bound of every wait.
    pub min_wait: Duration,
    /// Upper bound of every wait.
    pub max_interval: Duration,
    /// Total time a throttled call keeps retrying.
    pub throttle_ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(3),
            max_interval: Duration::from_secs(60),
            throttle_ceiling: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    /// Next wait after `previous`, drawn from `[min_wait, min(max_interval, previous * 3)]`.
    #[must_use]
    pub fn next_interval(&self, previous: Duration) -> Duration {
        self.next_interval_with(&mut rand::thread_rng(), previous)
    }

    /// [`next_interval`](Self::next_interval) with a caller-supplied source of randomness.
    pub fn next_interval_with<R: Rng + ?Sized>(&self, rng: &mut R, previous: Duration) -> Duration {
        let low = self.min_wait;
        let high = previous.saturating_mul(3).min(self.max_interval).max(low);
        let low_ms = u64::try_from(low.as_millis()).unwrap_or(u64::MAX);
        let high_ms = u64::try_from(high.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(low_ms..=high_ms))
    }
}

/// Handle on the remote API with retry, pagination and wait helpers.
#[derive(Clone)]
pub struct Remote {
    api: Arc<dyn Ec2Api>,
    policy: BackoffPolicy,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Remote {
    pub fn new(api: Arc<dyn Ec2Api>) -> Self {
        Self {
            api,
            policy: BackoffPolicy::default(),
        }
    }

    /// Use a different backoff schedule.
    #[must_use]
    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Issue one remote call, retrying while it is throttled.
    ///
    /// # Errors
    /// `RemoteUnavailable` once throttling outlasts the ceiling; `Remote` for
    /// any other remote error, without retrying.
    pub async fn call<'a, T, F, Fut>(&'a self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&'a dyn Ec2Api) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let start = Instant::now();
        let mut interval = self.policy.min_wait;

        loop {
            match f(self.api.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(source) if source.is_throttling() => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.policy.throttle_ceiling {
                        warn!(
                            operation,
                            elapsed_secs = elapsed.as_secs(),
                            "Giving up on throttled call"
                        );
                        return Err(VpcError::RemoteUnavailable {
                            operation: operation.to_string(),
                            elapsed_secs: elapsed.as_secs(),
                            source,
                        });
                    }

                    interval = self.policy.next_interval(interval);
                    debug!(
                        operation,
                        wait_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                        "Throttled, backing off"
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(source) => {
                    return Err(VpcError::Remote {
                        operation: operation.to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Collect every page of a describe call.
    ///
    /// # Errors
    /// As [`call`](Self::call), for any page.
    pub async fn call_paged<'a, T, F, Fut>(&'a self, operation: &str, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&'a dyn Ec2Api, Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Page<T>, RemoteError>>,
    {
        let mut items = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let token = next_token.take();
            let page = self
                .call(operation, |api| f(api, token.clone()))
                .await?;
            items.extend(page.items);

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(items),
            }
        }
    }

    /// Poll `describe` until every returned resource reports `expected`.
    ///
    /// Remote errors while polling are treated as not-yet-visible and polled
    /// through. An empty result counts as done.
    ///
    /// # Errors
    /// `TerminalState` as soon as a resource reports `failed`/`terminated`;
    /// `Timeout` once `timeout` has passed.
    pub async fn wait_for_state<'a, R, F, Fut>(
        &'a self,
        what: &str,
        mut describe: F,
        state_of: impl Fn(&R) -> &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Vec<R>>
    where
        F: FnMut(&'a dyn Ec2Api) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<R>, RemoteError>>,
    {
        let start = Instant::now();
        let mut interval = self.policy.min_wait;

        loop {
            match self.call(what, &mut describe).await {
                Ok(resources) => {
                    if resources.iter().all(|r| state_of(r) == expected) {
                        debug!(what, expected, "Reached expected state");
                        return Ok(resources);
                    }
                    if let Some(state) = resources
                        .iter()
                        .map(&state_of)
                        .find(|state| TERMINAL_STATES.contains(state))
                    {
                        return Err(VpcError::TerminalState {
                            what: what.to_string(),
                            state: state.to_string(),
                        });
                    }
                    debug!(what, expected, "Still waiting");
                }
                Err(VpcError::Remote { source, .. }) => {
                    debug!(what, error = %source, "Not visible yet");
                }
                Err(err) => return Err(err),
            }

            if start.elapsed() >= timeout {
                return Err(VpcError::Timeout {
                    what: what.to_string(),
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
            interval = self.policy.next_interval(interval);
            tokio::time::sleep(interval).await;
        }
    }

    /// Retry a call through transient remote errors (typically a resource
    /// that was just created and is not visible yet).
    ///
    /// # Errors
    /// `Timeout` if the call still fails once `timeout` has passed.
    pub async fn keep_trying<'a, T, F, Fut>(
        &'a self,
        what: &str,
        timeout: Duration,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(&'a dyn Ec2Api) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let start = Instant::now();
        let mut interval = self.policy.min_wait;

        loop {
            match self.call(what, &mut f).await {
                Ok(value) => return Ok(value),
                Err(VpcError::Remote { source, .. }) => {
                    if start.elapsed() >= timeout {
                        warn!(what, error = %source, "Giving up after repeated failures");
                        return Err(VpcError::Timeout {
                            what: what.to_string(),
                            elapsed_secs: start.elapsed().as_secs(),
                        });
                    }
                    debug!(what, error = %source, "Retrying");
                }
                Err(err) => return Err(err),
            }

            interval = self.policy.next_interval(interval);
            tokio::time::sleep(interval).await;
        }
    }
}

/// Swallow a remote "not found" on a teardown path.
///
/// # Errors
/// Any error other than not-found.
pub fn tolerate_missing<T>(result: Result<T>, what: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => {
            warn!(what, error = %err, "Already gone");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::ec2::{Filter, InMemoryEc2};

    fn remote(api: &Arc<InMemoryEc2>) -> Remote {
        Remote::new(api.clone())
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = policy.min_wait;

        for _ in 0..200 {
            let next = policy.next_interval_with(&mut rng, previous);
            assert!(next >= policy.min_wait);
            assert!(next <= policy.max_interval);
            assert!(next <= (previous * 3).max(policy.min_wait));
            previous = next;
        }

        // a zero previous interval clamps to the minimum
        assert_eq!(
            policy.next_interval_with(&mut rng, Duration::ZERO),
            policy.min_wait
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_throttling() {
        let api = Arc::new(InMemoryEc2::new());
        api.throttle_next("CreateVpc", 3);

        let vpc = remote(&api)
            .call("CreateVpc", |ec2| ec2.create_vpc("10.0.0.0/16"))
            .await
            .unwrap();
        assert_eq!(vpc.cidr_block, "10.0.0.0/16");
        assert_eq!(api.operations(), vec!["CreateVpc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_gives_up_after_ceiling() {
        let api = Arc::new(InMemoryEc2::new());
        api.throttle_next("CreateVpc", 10_000);

        let err = remote(&api)
            .call("CreateVpc", |ec2| ec2.create_vpc("10.0.0.0/16"))
            .await
            .unwrap_err();
        match err {
            VpcError::RemoteUnavailable { elapsed_secs, .. } => assert!(elapsed_secs >= 600),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_does_not_retry_other_errors() {
        let api = Arc::new(InMemoryEc2::new());
        api.fail_next("CreateVpc", "VpcLimitExceeded");

        let err = remote(&api)
            .call("CreateVpc", |ec2| ec2.create_vpc("10.0.0.0/16"))
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some("VpcLimitExceeded"));
        assert!(api.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_paged_collects_every_page() {
        let api = Arc::new(InMemoryEc2::new().with_page_size(2));
        for i in 0..5 {
            api.create_vpc(&format!("10.{i}.0.0/16")).await.unwrap();
        }
        api.throttle_next("DescribeVpcs", 1);

        let filters: Vec<Filter> = Vec::new();
        let vpcs = remote(&api)
            .call_paged("DescribeVpcs", |ec2, token| ec2.describe_vpcs(&filters, token))
            .await
            .unwrap();
        assert_eq!(vpcs.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_fails_fast_on_terminal_state() {
        let api = Arc::new(InMemoryEc2::new());
        let started = Instant::now();

        let err = remote(&api)
            .wait_for_state(
                "instance",
                |_| async { Ok::<_, RemoteError>(vec!["pending".to_string(), "failed".to_string()]) },
                |s: &String| s.as_str(),
                "running",
                DEFAULT_TIMEOUT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VpcError::TerminalState { ref state, .. } if state == "failed"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let api = Arc::new(InMemoryEc2::new());

        let err = remote(&api)
            .wait_for_state(
                "gateway",
                |_| async { Ok::<_, RemoteError>(vec!["pending".to_string()]) },
                |s: &String| s.as_str(),
                "available",
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VpcError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sees_state_transition() {
        let api = Arc::new(InMemoryEc2::new());
        let vpc = api.create_vpc("10.0.0.0/16").await.unwrap();
        let filters = [Filter::vpc(&vpc.vpc_id)];
        let filters = &filters[..];

        let vpcs = remote(&api)
            .wait_for_state(
                "vpc",
                |ec2| async move {
                    ec2.describe_vpcs(filters, None).await.map(|page| page.items)
                },
                |v: &crate::ec2::Vpc| v.state.as_str(),
                "available",
                DEFAULT_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(vpcs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_trying_through_not_found() {
        let api = Arc::new(InMemoryEc2::new());
        let vpc = api.create_vpc("10.0.0.0/16").await.unwrap();
        api.fail_next("CreateTags", "InvalidVpcID.NotFound");
        api.fail_next("CreateTags", "InvalidVpcID.NotFound");

        let ids = [vpc.vpc_id.clone()];
        let tags = [crate::ec2::Tag::new("Name", "ci")];
        remote(&api)
            .keep_trying("tag vpc", DEFAULT_TIMEOUT, |ec2| ec2.create_tags(&ids, &tags))
            .await
            .unwrap();
        assert!(api.operations().contains(&"CreateTags".to_string()));
    }

    #[test]
    fn test_tolerate_missing() {
        let gone: Result<()> = Err(VpcError::Remote {
            operation: "DeleteSubnet".into(),
            source: RemoteError::from_code("InvalidSubnetID.NotFound", "gone"),
        });
        assert!(tolerate_missing(gone, "subnet").unwrap().is_none());

        let busy: Result<()> = Err(VpcError::Remote {
            operation: "DeleteSubnet".into(),
            source: RemoteError::from_code("DependencyViolation", "busy"),
        });
        assert!(tolerate_missing(busy, "subnet").is_err());
    }
}
