//! Capture-recapture population estimate.
//!
//! Drawing `s` samples uniformly with replacement from a population of `N`
//! is expected to yield `f(s, N) = N * (1 - e^(-s / N))` distinct values.
//! Given the observed distinct count we invert `f` for `N`.

use std::fmt;

/// Fewer repeats than this carry too little information for an estimate
const MIN_REPEATS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeEstimate {
    Estimated(u64),
    Undetermined,
}

impl SizeEstimate {
    pub fn value(self) -> Option<u64> {
        match self {
            SizeEstimate::Estimated(size) => Some(size),
            SizeEstimate::Undetermined => None,
        }
    }
}

impl fmt::Display for SizeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeEstimate::Estimated(size) => write!(f, "{size}"),
            SizeEstimate::Undetermined => f.write_str("undetermined"),
        }
    }
}

/// Expected number of distinct values among `samples` draws from `population`
pub fn model(samples: f64, population: f64) -> f64 {
    population * (1.0 - (-samples / population).exp())
}

/// Estimate the population that explains `distinct` values among `total` samples
pub fn estimate(distinct: u64, total: u64) -> SizeEstimate {
    if distinct == 0 || distinct > total || total - distinct < MIN_REPEATS {
        return SizeEstimate::Undetermined;
    }

    let target = distinct as f64;
    let samples = total as f64;
    let at = |population: u64| model(samples, population as f64);

    // f(lower) <= target <= f(upper) from here on.
    let mut lower = distinct;
    let Some(mut upper) = distinct.checked_mul(2) else {
        return SizeEstimate::Undetermined;
    };
    while at(upper) < target {
        lower = upper;
        upper = match upper.checked_mul(2) {
            Some(upper) => upper,
            None => return SizeEstimate::Undetermined,
        };
    }

    while upper - lower > 1 {
        let mid = lower + (upper - lower) / 2;
        let current = at(mid);
        if current == target {
            return SizeEstimate::Estimated(mid);
        }
        if current < target {
            lower = mid;
        } else {
            upper = mid;
        }
    }

    // `upper` is the smallest population reaching the target; its predecessor
    // may still be the closer fit.
    if target - at(lower) <= at(upper) - target {
        SizeEstimate::Estimated(lower)
    } else {
        SizeEstimate::Estimated(upper)
    }
}
