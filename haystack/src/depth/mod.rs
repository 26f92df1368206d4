//! Depth bins, scheduling modes, and the depth/length scheduler.
//!
//! A depth is the relative position of the evidence window inside a test
//! context: `0.0` puts it at the very start, `1.0` at the very end. Results
//! are aggregated over a fixed set of five bins.

mod sampling;
mod scheduler;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use sampling::balanced_sample;
pub use scheduler::{DepthAssignment, DepthScheduler};

/// Number of discrete depth bins.
pub const DEPTH_BIN_COUNT: usize = 5;

/// Discrete depth label used for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepthBin {
    #[serde(rename = "0%")]
    D0,
    #[serde(rename = "25%")]
    D25,
    #[serde(rename = "50%")]
    D50,
    #[serde(rename = "75%")]
    D75,
    #[serde(rename = "100%")]
    D100,
}

impl DepthBin {
    /// All bins in ascending depth order.
    pub const ALL: [DepthBin; DEPTH_BIN_COUNT] = [
        DepthBin::D0,
        DepthBin::D25,
        DepthBin::D50,
        DepthBin::D75,
        DepthBin::D100,
    ];

    /// Depth this bin stands for.
    pub fn value(self) -> f64 {
        match self {
            Self::D0 => 0.0,
            Self::D25 => 0.25,
            Self::D50 => 0.5,
            Self::D75 => 0.75,
            Self::D100 => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::D0 => "0%",
            Self::D25 => "25%",
            Self::D50 => "50%",
            Self::D75 => "75%",
            Self::D100 => "100%",
        }
    }

    /// Nearest bin by absolute distance; on a tie the lower bin wins.
    pub fn nearest(depth: f64) -> DepthBin {
        let mut best = DepthBin::D0;
        let mut best_dist = f64::INFINITY;
        for bin in Self::ALL {
            let dist = (bin.value() - depth).abs();
            if dist < best_dist {
                best = bin;
                best_dist = dist;
            }
        }
        best
    }

    /// Exact bin for `depth`, if it is one of the five bin values.
    pub fn exact(depth: f64) -> Option<DepthBin> {
        Self::ALL
            .into_iter()
            .find(|bin| (bin.value() - depth).abs() < f64::EPSILON)
    }
}

impl fmt::Display for DepthBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How questions are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthMode {
    /// Sweep the full depth × length grid.
    #[default]
    Uniform,
    /// One caller-chosen depth, lengths cycled.
    Fixed,
    /// No depth control: every question is tested against the source prefix.
    Legacy,
}

impl DepthMode {
    pub fn is_depth_aware(self) -> bool {
        !matches!(self, Self::Legacy)
    }
}

impl fmt::Display for DepthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => write!(f, "uniform"),
            Self::Fixed => write!(f, "fixed"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

impl FromStr for DepthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "fixed" => Ok(Self::Fixed),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!(
                "unknown depth mode '{other}' (expected uniform, fixed or legacy)"
            )),
        }
    }
}
