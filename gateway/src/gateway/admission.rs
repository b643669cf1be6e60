//! Bounded concurrency for backend calls.
//!
//! Every in-flight backend call holds one [`AdmissionPermit`]. The permit
//! returns its slot when dropped, so each acquisition is released exactly
//! once on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::{AdmissionConfig, AdmissionPolicyKind};

/// Behavior when all slots are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Fail immediately with `CapacityExceeded`.
    Reject,
    /// Wait in FIFO order for up to `max_wait`, then fail with `CapacityExceeded`.
    Queue { max_wait: Duration },
}

impl From<&AdmissionConfig> for AdmissionPolicy {
    fn from(config: &AdmissionConfig) -> Self {
        match config.policy {
            AdmissionPolicyKind::Reject => AdmissionPolicy::Reject,
            AdmissionPolicyKind::Queue => AdmissionPolicy::Queue {
                max_wait: Duration::from_millis(config.queue_timeout_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("All {capacity} backend slots are in use")]
pub struct AdmissionRejected {
    pub capacity: usize,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
}

impl AdmissionControl {
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
        }
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionRejected> {
        let rejected = AdmissionRejected {
            capacity: self.capacity,
        };

        let permit = match self.policy {
            AdmissionPolicy::Reject => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    return Err(rejected)
                }
            },
            AdmissionPolicy::Queue { max_wait } => {
                match tokio::time::timeout(max_wait, self.semaphore.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) | Err(_) => return Err(rejected),
                }
            }
        };

        Ok(AdmissionPermit { _permit: permit })
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_counted_and_released() {
        let admission = AdmissionControl::new(2, AdmissionPolicy::Reject);
        assert_eq!(admission.in_flight(), 0);

        let a = admission.acquire().await.unwrap();
        let b = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);

        drop(a);
        assert_eq!(admission.in_flight(), 1);
        drop(b);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reject_policy_fails_immediately_at_capacity() {
        let admission = AdmissionControl::new(1, AdmissionPolicy::Reject);
        let _held = admission.acquire().await.unwrap();

        let result = admission.acquire().await;
        assert_eq!(result.unwrap_err(), AdmissionRejected { capacity: 1 });
        assert_eq!(admission.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_policy_times_out() {
        let admission = AdmissionControl::new(
            1,
            AdmissionPolicy::Queue {
                max_wait: Duration::from_millis(100),
            },
        );
        let _held = admission.acquire().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(admission.acquire().await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(admission.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_queue_policy_admits_when_slot_frees() {
        let admission = Arc::new(AdmissionControl::new(
            1,
            AdmissionPolicy::Queue {
                max_wait: Duration::from_secs(5),
            },
        ));
        let held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(|_permit| ()) })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = AdmissionConfig::default();
        assert_eq!(
            AdmissionPolicy::from(&config),
            AdmissionPolicy::Queue {
                max_wait: Duration::from_millis(2000)
            }
        );
        config.policy = AdmissionPolicyKind::Reject;
        assert_eq!(AdmissionPolicy::from(&config), AdmissionPolicy::Reject);
    }
}
