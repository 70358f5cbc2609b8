//! Bounded reconnect with exponential backoff.

use super::SinkError;
use crate::shutdown::ShutdownFlag;
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry schedule for a lost connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            backoff: 1.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): `initial_delay * backoff^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.initial_delay.mul_f64(self.backoff.powi(exponent))
    }

    /// Delays of every attempt in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

/// A connection that can be re-established.
pub trait Reconnect: Send {
    fn reconnect(&mut self) -> BoxFuture<'_, Result<(), SinkError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected { attempts: u32 },
    /// Shutdown was in progress; nothing was attempted past that point.
    Suppressed,
    /// Every attempt failed.
    Exhausted,
}

/// Try to re-establish `connection`, sleeping before each attempt.
///
/// Returns immediately, without sleeping or attempting, once `shutdown` is set.
/// The flag is checked again after every sleep, so an orderly shutdown stops a
/// retry loop that is already running at its next attempt.
pub async fn reconnect_with_backoff<C>(
    shutdown: &ShutdownFlag,
    policy: &ReconnectPolicy,
    connection: &mut C,
) -> ReconnectOutcome
where
    C: Reconnect + ?Sized,
{
    if shutdown.is_set() {
        info!("Shutdown in progress, will not reconnect");
        return ReconnectOutcome::Suppressed;
    }

    for (attempt, delay) in (1..).zip(policy.delays()) {
        info!(attempt, delay_secs = delay.as_secs_f64(), "Reconnecting");
        tokio::time::sleep(delay).await;

        if shutdown.is_set() {
            info!("Shutdown in progress, will not reconnect");
            return ReconnectOutcome::Suppressed;
        }

        match connection.reconnect().await {
            Ok(()) => {
                info!(attempt, "Successful reconnect");
                return ReconnectOutcome::Reconnected { attempts: attempt };
            }
            Err(error) => warn!(attempt, %error, "Reconnect failed"),
        }
    }

    error!(
        attempts = policy.max_attempts,
        "Giving up reconnecting until the next disconnect"
    );
    ReconnectOutcome::Exhausted
}
