//! Pending host operations (timers) and their completions.
//!
//! Tokens are handed to the module when an operation is scheduled. A driver
//! turns each request into a real or virtual timer and reports completions
//! back; completed tokens queue up in completion order until the module
//! polls them.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tracing::trace;

pub type Token = u32;

/// A timer the driver must start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub token: Token,
    pub delay: Duration,
}

/// Signal that the operation behind `token` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
}

#[derive(Debug, Default)]
pub struct Continuations {
    next_token: Token,
    /// Pending token -> virtual due time in milliseconds.
    pending: BTreeMap<Token, u64>,
    requests: Vec<TimerRequest>,
    ready: VecDeque<Token>,
    virtual_now_ms: u64,
    /// Completions accepted so far.
    completed: u64,
}

impl Continuations {
    pub fn new() -> Self {
        Self { next_token: 1, ..Self::default() }
    }

    /// Register a timer firing after `delay_ms` and return its token.
    pub fn schedule(&mut self, delay_ms: u64) -> Token {
        let token = self.next_token.max(1);
        self.next_token = token.wrapping_add(1);
        self.pending.insert(token, self.virtual_now_ms.saturating_add(delay_ms));
        self.requests.push(TimerRequest { token, delay: Duration::from_millis(delay_ms) });
        trace!(token, delay_ms, "timer scheduled");
        token
    }

    /// Cancel a pending or not yet polled token. Returns whether it existed.
    pub fn clear(&mut self, token: Token) -> bool {
        let was_pending = self.pending.remove(&token).is_some();
        self.requests.retain(|r| r.token != token);
        let before = self.ready.len();
        self.ready.retain(|&t| t != token);
        was_pending || self.ready.len() != before
    }

    /// Timers scheduled since the last call.
    pub fn take_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Move `token` to the ready queue. Completions for unknown or cleared
    /// tokens are dropped and `false` is returned.
    pub fn complete(&mut self, token: Token) -> bool {
        if self.pending.remove(&token).is_none() {
            trace!(token, "dropping completion for cleared token");
            return false;
        }
        self.ready.push_back(token);
        self.completed += 1;
        true
    }

    /// Running count of accepted completions.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Oldest ready completion.
    pub fn pop_ready(&mut self) -> Option<Token> {
        self.ready.pop_front()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pending operations or unpolled completions remain.
    pub fn has_work(&self) -> bool {
        self.has_pending() || !self.ready.is_empty()
    }

    /// Complete the pending timer with the earliest virtual due time (ties by
    /// token) and advance virtual time to it.
    pub fn fire_next_virtual(&mut self) -> Option<Token> {
        let (&token, &due) = self.pending.iter().min_by_key(|&(&t, &due)| (due, t))?;
        self.virtual_now_ms = self.virtual_now_ms.max(due);
        self.complete(token);
        Some(token)
    }

    /// Drop everything that is still outstanding. Returns how many operations
    /// were discarded.
    pub fn discard_all(&mut self) -> usize {
        let n = self.pending.len() + self.ready.len();
        self.pending.clear();
        self.requests.clear();
        self.ready.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_order_is_arrival_order() {
        let mut c = Continuations::new();
        let a = c.schedule(30);
        let b = c.schedule(10);
        assert_eq!(c.take_requests().len(), 2);
        assert!(c.take_requests().is_empty());

        assert!(c.complete(b));
        assert!(c.complete(a));
        assert_eq!(c.completed(), 2);
        assert_eq!(c.pop_ready(), Some(b));
        assert_eq!(c.pop_ready(), Some(a));
        assert_eq!(c.pop_ready(), None);
        assert!(!c.has_work());
    }

    #[test]
    fn cleared_tokens_drop_late_completions() {
        let mut c = Continuations::new();
        let a = c.schedule(5);
        assert!(c.clear(a));
        assert!(!c.complete(a));
        assert_eq!(c.pop_ready(), None);
        assert!(!c.clear(a));
    }

    #[test]
    fn virtual_firing_uses_due_time_then_token() {
        let mut c = Continuations::new();
        let a = c.schedule(20);
        let b = c.schedule(10);
        let d = c.schedule(10);
        assert_eq!(c.fire_next_virtual(), Some(b));
        assert_eq!(c.fire_next_virtual(), Some(d));
        // a timer scheduled now is due at 10 + 5, before a
        let e = c.schedule(5);
        assert_eq!(c.fire_next_virtual(), Some(e));
        assert_eq!(c.fire_next_virtual(), Some(a));
        assert_eq!(c.fire_next_virtual(), None);
        assert_eq!(c.ready_len(), 4);
    }
}
