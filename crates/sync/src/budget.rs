use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Local model of the exchange's leaky-bucket call allowance.
///
/// A pool of tokens drains one per call decision and gains one back each
/// time a full refill interval has elapsed. When the pool is empty the
/// caller sits out a full-bucket refill rather than computing a partial
/// wait; that wastes a little throughput but can never run ahead of the
/// server-side counter.
///
/// Held by value by whoever owns the call loop. Never errors.
#[derive(Debug)]
pub struct RateBudget {
    max_tokens: u32,
    refill_interval: Duration,
    tokens: u32,
    last_refill: Instant,
}

impl RateBudget {
    pub const MAX_TOKENS: u32 = 15;

    const PUBLIC_REFILL: Duration = Duration::from_secs(3);
    const PRIVATE_REFILL: Duration = Duration::from_secs(4);

    pub fn new(max_tokens: u32, refill_interval: Duration) -> Self {
        Self {
            max_tokens,
            refill_interval,
            // The first decision point consumes one immediately.
            tokens: max_tokens.saturating_sub(1),
            last_refill: Instant::now(),
        }
    }

    /// Budget for public market-data endpoints (one token back per 3s).
    pub fn public_endpoint() -> Self {
        Self::new(Self::MAX_TOKENS, Self::PUBLIC_REFILL)
    }

    /// Budget for authenticated endpoints (one token back per 4s).
    pub fn private_endpoint() -> Self {
        Self::new(Self::MAX_TOKENS, Self::PRIVATE_REFILL)
    }

    /// Decide whether a call may proceed right now.
    ///
    /// If a refill interval has elapsed since the last refill check, one
    /// token is restored (capped at the maximum) and the refill clock
    /// resets; otherwise one token is consumed for the call about to be
    /// made. Returns `true` while tokens remain, `false` when the caller
    /// must `wait_for_refill` first.
    pub fn can_call(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= self.refill_interval {
            self.tokens = (self.tokens + 1).min(self.max_tokens);
            self.last_refill = now;
        } else {
            self.tokens = self.tokens.saturating_sub(1);
        }
        self.tokens > 0
    }

    /// Hand back a token for a call that yielded nothing usable
    /// (a transient server failure is not charged against the budget).
    pub fn refund(&mut self) {
        self.tokens = (self.tokens + 1).min(self.max_tokens);
    }

    /// Sleep long enough for the server-side bucket to fully drain,
    /// then treat the local pool as full minus the call about to be made.
    pub async fn wait_for_refill(&mut self) {
        let pause = self.refill_interval * self.max_tokens;
        debug!(pause = ?pause, "Call budget exhausted, waiting for full refill");
        tokio::time::sleep(pause).await;
        self.tokens = self.max_tokens.saturating_sub(1);
        self.last_refill = Instant::now();
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }
}
