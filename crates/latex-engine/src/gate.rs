//! Concurrency gate bounding simultaneous compilations
//!
//! The gate is the only state shared between requests. It is a counting
//! semaphore; a [`GatePermit`] returns its slot when dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::compiler::EngineError;

/// Admission policy once every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Wait for a slot, optionally giving up after `max_wait`
    Queue { max_wait: Option<Duration> },
    /// Fail immediately with [`EngineError::Overloaded`]
    Reject,
}

impl Default for GatePolicy {
    fn default() -> Self {
        GatePolicy::Queue {
            max_wait: Some(Duration::from_secs(30)),
        }
    }
}

/// A held compilation slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Counting gate shared by all requests of one [`Compiler`](crate::Compiler)
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: GatePolicy,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, policy: GatePolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
        }
    }

    /// Acquire a slot according to the configured policy
    pub async fn admit(&self) -> Result<GatePermit, EngineError> {
        let permit = match self.policy {
            GatePolicy::Reject => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    debug!(capacity = self.capacity, "Gate full, rejecting");
                    return Err(EngineError::Overloaded);
                }
            },
            GatePolicy::Queue { max_wait: None } => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Overloaded)?,
            GatePolicy::Queue {
                max_wait: Some(max_wait),
            } => {
                match tokio::time::timeout(max_wait, self.semaphore.clone().acquire_owned()).await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => return Err(EngineError::Overloaded),
                    Err(_elapsed) => {
                        debug!(?max_wait, "Gate wait expired");
                        return Err(EngineError::Overloaded);
                    }
                }
            }
        };

        Ok(GatePermit { _permit: permit })
    }

    /// Configured number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_policy_fails_when_full() {
        let gate = ConcurrencyGate::new(2, GatePolicy::Reject);

        let first = gate.admit().await.unwrap();
        let _second = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        assert_eq!(gate.admit().await.unwrap_err(), EngineError::Overloaded);

        drop(first);
        assert_eq!(gate.available(), 1);
        assert!(gate.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_policy_times_out() {
        let gate = ConcurrencyGate::new(
            1,
            GatePolicy::Queue {
                max_wait: Some(Duration::from_millis(50)),
            },
        );

        let _held = gate.admit().await.unwrap();
        assert_eq!(gate.admit().await.unwrap_err(), EngineError::Overloaded);
    }

    #[tokio::test]
    async fn test_queue_policy_waits_for_release() {
        let gate = ConcurrencyGate::new(1, GatePolicy::Queue { max_wait: None });

        let held = gate.admit().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_slots() {
        let gate = ConcurrencyGate::new(1, GatePolicy::Reject);
        let other = gate.clone();

        let _held = gate.admit().await.unwrap();
        assert_eq!(other.in_flight(), 1);
        assert!(other.admit().await.is_err());
    }
}
