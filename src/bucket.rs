//! Token bucket with burst tolerance and a lossless wire format.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at `refill_rate` tokens per
//! second. Buckets are plain data: the limiter loads one, calls [`TokenBucket::consume`], and
//! writes it back, so a persisted-and-reloaded bucket must behave exactly like one that never
//! left memory.
//!
//! Wire format (JSON):
//!
//! ```json
//! {"capacity":7.0,"refill_rate":0.08333333333333333,"tokens":6.0,"last_refill":1700000000.25}
//! ```

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Token bucket state. Mutated only by [`consume`](Self::consume) and [`reshape`](Self::reshape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: f64,
}

impl TokenBucket {
    /// A full bucket stamped at `now` (epoch seconds). Negative inputs are clamped to zero.
    pub fn new(capacity: f64, refill_rate: f64, now: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self { capacity, refill_rate: refill_rate.max(0.0), tokens: capacity, last_refill: now }
    }

    /// Bucket for a per-minute `limit` with `burst` extra tokens of headroom.
    pub fn for_rule(limit: u32, burst: u32, now: f64) -> Self {
        Self::new(f64::from(limit) + f64::from(burst), f64::from(limit) / 60.0, now)
    }

    /// Refill for the time elapsed since the last refill, then take `n` tokens if available.
    ///
    /// A clock that moved backwards refills nothing and leaves `last_refill` where it was.
    pub fn consume(&mut self, n: f64, now: f64) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens = (self.tokens - n).max(0.0);
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Apply new rule parameters to an existing bucket, keeping its fill level within the new
    /// capacity.
    pub fn reshape(&mut self, capacity: f64, refill_rate: f64) {
        self.capacity = capacity.max(0.0);
        self.refill_rate = refill_rate.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Seconds until the bucket is full again at the current refill rate.
    ///
    /// `None` when the bucket is not full and never refills.
    pub fn seconds_until_full(&self) -> Option<f64> {
        let missing = self.capacity - self.tokens;
        if missing <= 0.0 {
            Some(0.0)
        } else if self.refill_rate > 0.0 {
            Some(missing / self.refill_rate)
        } else {
            None
        }
    }

    /// Whole tokens left.
    pub fn remaining(&self) -> u32 {
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Epoch seconds of the last refill.
    pub fn last_refill(&self) -> f64 {
        self.last_refill
    }

    /// Encode for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing four finite f64 fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a persisted bucket, rejecting documents that violate bucket invariants.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let bucket: Self = serde_json::from_slice(bytes)?;
        bucket.validate()?;
        Ok(bucket)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let fields = [
            ("capacity", self.capacity),
            ("refill_rate", self.refill_rate),
            ("tokens", self.tokens),
            ("last_refill", self.last_refill),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(DecodeError::InvalidField { field, value });
            }
        }
        if self.tokens > self.capacity {
            return Err(DecodeError::InvalidField { field: "tokens", value: self.tokens });
        }
        Ok(())
    }
}
