//! Search tickets and the retry policy that drives them.
//!
//! A [`SearchTicket`] is one outstanding name lookup.  It never reads a clock
//! itself: the driver passes `now` in, asks for the current deadline, and
//! feeds the outcome back.
//!
//! ```text
//!            deadline, attempt < max
//!           ┌──────────────────────┐
//!           ▼                      │
//! start ─► Pending ────────────────┘
//!           │  │
//!           │  └─ deadline, attempt == max ─► Failed
//!           └──── response matched ─────────► Resolved(addr)
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::protocol::CorrelationId;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every attempt waits `initial_delay`.
    Fixed,
    /// Attempt *n* waits `initial_delay * factor^(n-1)`, capped at `max_delay`.
    Exponential { factor: u32, max_delay: Duration },
}

/// Retransmission schedule for a request awaiting a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff: Backoff,
    /// Total number of transmissions, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// A policy that waits `delay` after every attempt.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            backoff: Backoff::Fixed,
            max_attempts,
        }
    }

    /// A policy that doubles the wait after each attempt, up to `max_delay`.
    pub fn doubling(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            backoff: Backoff::Exponential {
                factor: 2,
                max_delay,
            },
            max_attempts,
        }
    }

    /// The same schedule shape starting from a different first delay.
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// How long attempt number `attempt` (1-based) waits for a response.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = factor.checked_pow(exponent).unwrap_or(u32::MAX);
                self.initial_delay
                    .checked_mul(multiplier)
                    .unwrap_or(max_delay)
                    .min(max_delay)
            }
        }
    }

    /// Sum of every attempt's delay: the longest a request can stay pending.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts.max(1)).map(|n| self.delay_for(n)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::doubling(Duration::from_millis(500), Duration::from_secs(5), 4)
    }
}

/// Where a ticket is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Pending,
    Resolved(SocketAddr),
    Failed,
}

/// What the driver must do after a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStep {
    /// The deadline has not been reached yet.
    Wait,
    /// Send the identical request again; a new deadline is set.
    Retransmit { attempt: u32 },
    /// The retry ceiling is exhausted; the ticket has failed.
    Exhausted,
}

/// One outstanding search, owned by whoever drives the retries.
#[derive(Debug, Clone)]
pub struct SearchTicket {
    pub name: String,
    pub correlation_id: CorrelationId,
    pub deadline: Instant,
    /// 1-based number of transmissions so far.
    pub attempt: u32,
    pub matched_address: Option<SocketAddr>,
    policy: RetryPolicy,
    state: TicketState,
}

impl SearchTicket {
    /// Starts a ticket whose first transmission happens at `now`.
    pub fn start(
        name: impl Into<String>,
        correlation_id: CorrelationId,
        policy: RetryPolicy,
        now: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            correlation_id,
            deadline: now + policy.delay_for(1),
            attempt: 1,
            matched_address: None,
            policy,
            state: TicketState::Pending,
        }
    }

    pub fn state(&self) -> TicketState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == TicketState::Pending
    }

    /// Advances the ticket once `now` has reached its deadline.
    pub fn on_deadline(&mut self, now: Instant) -> TicketStep {
        if !self.is_pending() || now < self.deadline {
            return TicketStep::Wait;
        }
        if self.attempt >= self.policy.max_attempts {
            self.state = TicketState::Failed;
            return TicketStep::Exhausted;
        }
        self.attempt += 1;
        self.deadline = now + self.policy.delay_for(self.attempt);
        TicketStep::Retransmit {
            attempt: self.attempt,
        }
    }

    /// Records a matching response.  Later matches are ignored.
    pub fn resolve(&mut self, address: SocketAddr) {
        if self.is_pending() {
            self.matched_address = Some(address);
            self.state = TicketState::Resolved(address);
        }
    }
}
