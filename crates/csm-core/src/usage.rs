//! Token counting and usage accounting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Represents a count of tokens.
///
/// Used for input tokens, output tokens, cache tokens.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TokenCount(u64);

impl TokenCount {
    /// Creates a new TokenCount.
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    /// Returns the raw count.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if count is zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Formats the token count for display.
    ///
    /// Uses K/M suffixes for large numbers.
    pub fn format(&self) -> String {
        if self.0 < 1_000 {
            format!("{}", self.0)
        } else if self.0 < 1_000_000 {
            format!("{:.1}K", self.0 as f64 / 1_000.0)
        } else {
            format!("{:.1}M", self.0 as f64 / 1_000_000.0)
        }
    }
}

impl Add for TokenCount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl AddAssign for TokenCount {
    fn add_assign(&mut self, other: Self) {
        self.0 = self.0.saturating_add(other.0);
    }
}

impl From<u64> for TokenCount {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for TokenCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Token usage as reported by the agent.
///
/// Assistant messages carry per-message usage that must be summed;
/// result events carry the cumulative usage of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: TokenCount,
    #[serde(default)]
    pub output_tokens: TokenCount,
    #[serde(default)]
    pub cache_creation_input_tokens: TokenCount,
    #[serde(default)]
    pub cache_read_input_tokens: TokenCount,
}

impl Usage {
    /// Creates usage from plain input/output counts.
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: TokenCount::new(input),
            output_tokens: TokenCount::new(output),
            ..Self::default()
        }
    }

    /// Returns true if every counter is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.input_tokens.is_zero()
            && self.output_tokens.is_zero()
            && self.cache_creation_input_tokens.is_zero()
            && self.cache_read_input_tokens.is_zero()
    }

    /// Tokens sent to the model including both cache buckets.
    pub fn total_input(&self) -> TokenCount {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in / {} out", self.total_input(), self.output_tokens)
    }
}
