//! Resume values delivered to fibers at their suspension points.
//!
//! A suspended fiber is resumed with exactly one `Resume`. Plain wakes carry
//! `Unit` or an integer payload; interruptions (cancellation, timeouts) carry
//! an `Interrupt` which every await site converts into an `Err` before user
//! code runs again.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// Identifies one timeout scope. Tokens are process-unique so a sentinel
/// raised by an inner timeout is never consumed by an outer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    /// Allocate a fresh token.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Token(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

/// An exception-carrying resume value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// Deliver an error at the suspension point (cancellation and friends).
    Raise(Error),
    /// A timeout scope's sentinel fired.
    Timeout(Token),
}

/// Value delivered to a fiber when it is switched back in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Plain wake with no payload (snooze, completion of a void op).
    Unit,
    /// Wake carrying an integer payload (op results, tick counts).
    Value(i64),
    /// Wake carrying an interruption; re-raised by the await site.
    Interrupt(Interrupt),
}

impl Resume {
    /// Convert into the await-site result: interrupts become errors,
    /// everything else is a normal wake.
    #[inline]
    pub fn check(self) -> Result<Resume, Error> {
        match self {
            Resume::Interrupt(Interrupt::Raise(e)) => Err(e),
            Resume::Interrupt(Interrupt::Timeout(t)) => Err(Error::Timeout(t)),
            other => Ok(other),
        }
    }

    #[inline]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Resume::Interrupt(_))
    }
}

impl Default for Resume {
    fn default() -> Self {
        Resume::Unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_uniqueness() {
        let tokens: Vec<_> = (0..1000).map(|_| Token::new()).collect();
        let unique: std::collections::HashSet<_> = tokens.iter().collect();
        assert_eq!(tokens.len(), unique.len());
    }

    #[test]
    fn test_check_passes_values() {
        assert_eq!(Resume::Unit.check(), Ok(Resume::Unit));
        assert_eq!(Resume::Value(42).check(), Ok(Resume::Value(42)));
    }

    #[test]
    fn test_check_raises_interrupts() {
        let r = Resume::Interrupt(Interrupt::Raise(Error::Cancelled));
        assert_eq!(r.check(), Err(Error::Cancelled));

        let t = Token::new();
        let r = Resume::Interrupt(Interrupt::Timeout(t));
        assert_eq!(r.check(), Err(Error::Timeout(t)));
    }
}
