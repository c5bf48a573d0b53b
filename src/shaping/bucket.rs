//! Token Bucket
//!
//! Byte-denominated token bucket with lazy refill. Used both for the pod-wide
//! aggregate bucket and for per-flow buckets.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::clock::Timestamp;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Outcome of a consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// Tokens were taken
    Admitted,

    /// Not enough tokens; `available_in` is the wait until the request would fit,
    /// assuming nothing else consumes in the meantime
    Rejected {
        /// Time until enough tokens have accrued
        available_in: Duration,
    },
}

impl Consume {
    /// Whether the request was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Consume::Admitted)
    }
}

/// Token bucket for rate limiting
///
/// Tokens are an atomic counter consumed with compare-and-swap. Refill is
/// serialized on a small mutex taken with `try_lock`: when another caller is
/// already refilling, this caller skips the refill instead of waiting, so the
/// data path never blocks.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst)
    capacity: u64,

    /// Tokens added per second; 0 disables the bucket
    rate: u64,

    /// Current tokens
    tokens: AtomicU64,

    /// Time up to which elapsed time has been converted into tokens
    last_refill: Mutex<Timestamp>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u64, rate: u64) -> Self {
        Self::new_at(capacity, rate, Timestamp::ZERO)
    }

    /// Create a full bucket whose refill clock starts at `now`
    pub fn new_at(capacity: u64, rate: u64, now: Timestamp) -> Self {
        Self {
            capacity,
            rate,
            tokens: AtomicU64::new(capacity),
            last_refill: Mutex::new(now),
        }
    }

    /// Bucket that admits everything
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Whether this bucket never rejects
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Refill rate in tokens per second
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Current tokens, without refilling
    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Current tokens after refilling up to `now`
    pub fn available_at(&self, now: Timestamp) -> u64 {
        if !self.is_unlimited() {
            self.refill(now);
        }
        self.available()
    }

    /// Try to take `n` tokens at `now`
    pub fn try_consume(&self, n: u64, now: Timestamp) -> Consume {
        if self.is_unlimited() {
            return Consume::Admitted;
        }

        self.refill(now);

        let mut current = self.tokens.load(Ordering::SeqCst);
        loop {
            if current < n {
                return Consume::Rejected {
                    available_in: self.time_until_available(n, current, now),
                };
            }

            match self.tokens.compare_exchange_weak(
                current,
                current - n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Consume::Admitted,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back up to `n` tokens, never exceeding capacity
    pub fn refund(&self, n: u64) {
        if self.is_unlimited() {
            return;
        }
        self.add_capped(n);
    }

    /// Convert elapsed time into tokens
    ///
    /// Only whole tokens are credited and the refill clock advances by exactly
    /// the time they represent, so fractional credit carries over to the next
    /// refill. A full bucket discards the surplus. Timestamps that go backwards
    /// credit nothing. Any out-of-range token count is clamped here.
    fn refill(&self, now: Timestamp) {
        let Some(mut last_refill) = self.last_refill.try_lock() else {
            return;
        };

        let elapsed = u128::from(now.as_nanos().saturating_sub(last_refill.as_nanos()));
        let earned = u64::try_from(elapsed * u128::from(self.rate) / NANOS_PER_SEC)
            .unwrap_or(u64::MAX);

        let filled = self.add_capped(earned);

        if filled {
            *last_refill = (*last_refill).max(now);
        } else if earned > 0 {
            let spent = (u128::from(earned) * NANOS_PER_SEC).div_ceil(u128::from(self.rate));
            let spent = u64::try_from(spent).unwrap_or(u64::MAX);
            *last_refill = Timestamp::from_nanos(last_refill.as_nanos().saturating_add(spent));
        }
    }

    /// Add tokens up to capacity; returns whether the bucket ended up full
    fn add_capped(&self, amount: u64) -> bool {
        let mut current = self.tokens.load(Ordering::SeqCst);
        loop {
            let new_value = current.saturating_add(amount).min(self.capacity);
            if new_value == current {
                return new_value == self.capacity;
            }
            match self.tokens.compare_exchange_weak(
                current,
                new_value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return new_value == self.capacity,
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait until `n` tokens exist given `current` tokens at `now`
    ///
    /// Credit already accrued towards the next token is subtracted and the
    /// result is rounded up to the nanosecond, so retrying after the returned
    /// duration succeeds whenever `n <= capacity`.
    fn time_until_available(&self, n: u64, current: u64, now: Timestamp) -> Duration {
        let needed = u128::from(n.saturating_sub(current));
        let full = (needed * NANOS_PER_SEC).div_ceil(u128::from(self.rate));

        let accrued = self
            .last_refill
            .try_lock()
            .map(|last| u128::from(now.as_nanos().saturating_sub(last.as_nanos())))
            .unwrap_or(0);

        let wait = full.saturating_sub(accrued);
        Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
    }
}
