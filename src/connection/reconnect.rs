//! Reconnection controller.
//!
//! One task per device whose link dropped outside an operator disconnect.
//! Attempts follow a bounded exponential backoff with uniform jitter; on
//! success every subscription that was live at drop time is re-installed
//! before control is yielded. Exhausting the budget leaves the device in
//! terminal `ERROR` until the orchestrator re-arms the controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::{ConnectionPool, PoolError};
use crate::transport::NotificationHandler;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Uniform jitter, as a fraction of the computed delay.
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Delay before retry number `attempt` (zero-based):
/// `min(max_delay, initial * multiplier^attempt)` plus uniform jitter of
/// `±jitter_factor` of the computed delay.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt as i32);
    let capped = base.min(policy.max_delay.as_secs_f64());
    let jittered = if policy.jitter_factor > 0.0 {
        let spread = capped * policy.jitter_factor;
        capped + rand::thread_rng().gen_range(-spread..=spread)
    } else {
        capped
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Per-fleet reconnection controller.
#[derive(Clone)]
pub struct ReconnectController {
    pool: ConnectionPool,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ReconnectController {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether an episode is running for `address`.
    pub fn is_armed(&self, address: &str) -> bool {
        self.active.lock().unwrap().contains_key(address)
    }

    /// Start a reconnection episode. A no-op when one is already running.
    ///
    /// `subscriptions` are re-installed on success; callers usually pass
    /// [`ConnectionPool::take_orphaned_subscriptions`].
    pub fn arm(
        &self,
        address: &str,
        policy: ReconnectPolicy,
        subscriptions: HashMap<Uuid, NotificationHandler>,
        parent: &CancellationToken,
    ) {
        let token = {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(address) {
                debug!("{}: reconnection already armed", address);
                return;
            }
            let token = parent.child_token();
            active.insert(address.to_string(), token.clone());
            token
        };

        let controller = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            controller
                .run_episode(&address, policy, subscriptions, token)
                .await;
            controller.active.lock().unwrap().remove(&address);
        });
    }

    /// Cancel the episode for `address`, if any. Used on device removal and
    /// operator disconnect.
    pub fn cancel(&self, address: &str) {
        if let Some(token) = self.active.lock().unwrap().remove(address) {
            debug!("{}: reconnection cancelled", address);
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let mut active = self.active.lock().unwrap();
        for (_, token) in active.drain() {
            token.cancel();
        }
    }

    async fn run_episode(
        &self,
        address: &str,
        policy: ReconnectPolicy,
        subscriptions: HashMap<Uuid, NotificationHandler>,
        token: CancellationToken,
    ) {
        info!(
            "{}: reconnecting (max {} attempts)",
            address, policy.max_attempts
        );
        self.pool.mark_reconnecting(address, "reconnection armed");

        for attempt in 0..policy.max_attempts {
            if token.is_cancelled() {
                return;
            }

            // A connect by another path ends the episode early.
            if self.pool.is_active(address) {
                debug!("{}: already connected by another path", address);
                self.reinstall(address, &subscriptions).await;
                return;
            }

            match self.pool.get_or_connect(address).await {
                Ok(_) => {
                    info!("{}: reconnected on attempt {}", address, attempt + 1);
                    self.reinstall(address, &subscriptions).await;
                    return;
                }
                Err(PoolError::Transport(e)) if e.is_fatal() => {
                    // Not a retryable condition; wait for the operator.
                    warn!("{}: fatal transport error, giving up: {}", address, e);
                    self.pool.mark_error(address, "fatal transport error");
                    return;
                }
                Err(e) => {
                    warn!(
                        "{}: reconnect attempt {}/{} failed: {}",
                        address,
                        attempt + 1,
                        policy.max_attempts,
                        e
                    );
                }
            }

            if attempt + 1 < policy.max_attempts {
                let delay = backoff_delay(&policy, attempt);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(
            "{}: reconnection budget of {} attempts exhausted",
            address, policy.max_attempts
        );
        self.pool
            .mark_error(address, "reconnection attempts exhausted");
    }

    async fn reinstall(&self, address: &str, subscriptions: &HashMap<Uuid, NotificationHandler>) {
        for (characteristic, handler) in subscriptions {
            if let Err(e) = self
                .pool
                .start_notify(address, *characteristic, handler.clone())
                .await
            {
                warn!(
                    "{}: failed to re-install subscription {}: {}",
                    address, characteristic, e
                );
            }
        }
    }
}
