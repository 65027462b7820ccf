//! Core type definitions shared by every rank

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Training step counter
pub type Step = u64;

/// Zero-based index of a worker process within a group
pub type Rank = usize;

/// How multiple contributions to one metric combine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReduceMode {
    /// Keep the raw accumulated value, never reduced across ranks
    #[default]
    None,

    /// Plain sum
    Sum,

    /// Count-weighted mean, rank-local
    Mean,

    /// Count-weighted mean that must be reduced across ranks before reading
    GlobalMean,
}

impl ReduceMode {
    /// Returns true for the count-weighted modes
    pub fn is_mean(&self) -> bool {
        matches!(self, ReduceMode::Mean | ReduceMode::GlobalMean)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReduceMode::None => "none",
            ReduceMode::Sum => "sum",
            ReduceMode::Mean => "mean",
            ReduceMode::GlobalMean => "global_mean",
        }
    }
}

impl fmt::Display for ReduceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReduceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ReduceMode::None),
            "sum" => Ok(ReduceMode::Sum),
            "mean" => Ok(ReduceMode::Mean),
            "global_mean" => Ok(ReduceMode::GlobalMean),
            other => Err(Error::InvalidConfig {
                message: format!("unexpected reduction mode {:?}", other),
            }),
        }
    }
}

/// Whether a metric is a persistent scalar series or a transient value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Scalar series, e.g. a loss curve
    #[default]
    Scalar,

    /// Short-lived value, e.g. an ETA estimate
    Transient,
}
