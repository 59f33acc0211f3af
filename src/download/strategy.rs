//!
//! # Traversal strategies
//! The order in which a worker visits the entries of one folder listing.
//!

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Forward,
    Reverse,
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Forward => "forward",
            Strategy::Reverse => "reverse",
            Strategy::Random => "random",
        }
    }

    /// Only random workers take part in concurrency scaling.
    pub fn is_scalable(&self) -> bool {
        matches!(self, Strategy::Random)
    }

    /// Reorder one folder listing in place.
    pub fn arrange<T>(&self, entries: &mut [T]) {
        match self {
            Strategy::Forward => {}
            Strategy::Reverse => entries.reverse(),
            // Not seeded: every random worker should walk the tree differently.
            Strategy::Random => entries.shuffle(&mut rand::thread_rng()),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown traversal strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Strategy::Forward),
            "reverse" => Ok(Strategy::Reverse),
            "random" => Ok(Strategy::Random),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// The strategy mix a fresh session starts with: one forward, one reverse,
/// then `random_count` random workers.
pub fn default_mix(random_count: usize) -> Vec<Strategy> {
    let mut mix = Vec::with_capacity(random_count + 2);
    mix.push(Strategy::Forward);
    mix.push(Strategy::Reverse);
    mix.extend(std::iter::repeat(Strategy::Random).take(random_count));
    mix
}
