//! Flow-control credit for one direction of a channel.
//!
//! The counter starts at zero and grows with every grant, saturating at [`MAX_DEMAND`]. Once a
//! tracker reaches `MAX_DEMAND` it is unbounded: consuming no longer decrements it. Consuming
//! from an empty tracker fails, it never goes below zero.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

use crate::channel::errors::CreditError;
use crate::frame::MAX_U31;

/// Demand value meaning "effectively unbounded".
pub const MAX_DEMAND: u32 = MAX_U31;

#[derive(Debug, Default)]
pub struct CreditTracker {
    demand: AtomicU32,
    notify: Notify
}

impl CreditTracker {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(&self) -> u32 {
        self.demand.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.available() == MAX_DEMAND
    }

    /// Adds `n` to the demand and returns the new balance.
    pub fn grant(&self, n: u32) -> u32 {
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(MAX_DEMAND);
            match self.demand.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if next > 0 {
                        self.notify.notify_waiters();
                    }
                    return next;
                }
                Err(actual) => current = actual
            }
        }
    }

    /// Takes one unit of demand before emitting one payload and returns the balance left.
    pub fn consume(&self) -> Result<u32, CreditError> {
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(CreditError::InsufficientCredit);
            }
            if current == MAX_DEMAND {
                return Ok(MAX_DEMAND);
            }
            match self.demand.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual
            }
        }
    }

    /// Resolves once there is demand to spend.
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            if self.available() > 0 {
                return;
            }
            notified.await;
        }
    }
}
