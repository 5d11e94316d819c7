//! Restricting a request to a subset of its discovered targets.

use crate::error::{Result, RpcError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// How targets are picked when a limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitMethod {
    /// Keep the first targets in discovery order.
    #[default]
    First,
    /// Keep a random selection.
    Random,
}

impl FromStr for LimitMethod {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(LimitMethod::First),
            "random" => Ok(LimitMethod::Random),
            other => Err(RpcError::Limit {
                reason: format!(
                    "limit method '{}' is not valid, only 'random' or 'first' supported",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for LimitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitMethod::First => write!(f, "first"),
            LimitMethod::Random => write!(f, "random"),
        }
    }
}

/// Applies a limit of `size` targets, either a count like `10` or a
/// percentage like `25%`. An empty size keeps every target.
///
/// A negative `seed` shuffles with entropy instead of a fixed seed.
pub fn limit_targets(
    targets: &[String],
    method: LimitMethod,
    size: &str,
    seed: i64,
) -> Result<Vec<String>> {
    if size.is_empty() {
        return Ok(targets.to_vec());
    }

    let percent_re = Regex::new(r"^(\d+)%$").map_err(regex_error)?;
    let count_re = Regex::new(r"^(\d+)$").map_err(regex_error)?;

    let count = if let Some(caps) = percent_re.captures(size) {
        let pct: u64 = caps[1].parse().map_err(|_| parse_error())?;
        let count = (targets.len() as u64).saturating_mul(pct) / 100;
        usize::try_from(count).unwrap_or(usize::MAX)
    } else if count_re.is_match(size) {
        size.parse::<usize>().map_err(|_| parse_error())?
    } else {
        return Err(parse_error());
    };

    if count == 0 {
        return Err(RpcError::Limit {
            reason: format!("no targets left after applying target limits of '{}'", size),
        });
    }

    let count = count.min(targets.len());
    let mut limited = targets.to_vec();

    if method == LimitMethod::Random {
        let mut rng = if seed < 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed as u64)
        };
        limited.shuffle(&mut rng);
    }

    limited.truncate(count);
    Ok(limited)
}

fn parse_error() -> RpcError {
    RpcError::Limit {
        reason: "could not parse limit as either number or percent".to_string(),
    }
}

fn regex_error(e: regex::Error) -> RpcError {
    RpcError::Limit {
        reason: e.to_string(),
    }
}
