//! Rate thresholds written as `<rate>/<per-seconds>`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// At most `rate` events per `per` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub rate: u32,
    pub per: f64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("threshold is empty")]
    Empty,

    #[error("threshold `{0}` is missing a `/`")]
    MissingSlash(String),

    #[error("`{0}` is not a valid rate")]
    InvalidRate(String),

    #[error("`{0}` is not a valid number of seconds")]
    InvalidPer(String),

    #[error("rate must be at least 1")]
    ZeroRate,

    #[error("period must be a positive number of seconds")]
    NonPositivePer,

    #[error("`{0}` seconds is outside the supported range")]
    PerOutOfRange(String),
}

impl Threshold {
    /// Parse a threshold such as `5/10` (five events per ten seconds).
    pub fn parse(input: &str) -> Result<Self, ThresholdError> {
        if input.is_empty() {
            return Err(ThresholdError::Empty);
        }

        let (rate, per) = input
            .split_once('/')
            .ok_or_else(|| ThresholdError::MissingSlash(input.to_string()))?;

        if !is_plain_number(rate) || rate.contains('.') {
            return Err(ThresholdError::InvalidRate(rate.to_string()));
        }
        let rate: u32 = rate
            .parse()
            .map_err(|_| ThresholdError::InvalidRate(rate.to_string()))?;

        if !is_plain_number(per) {
            return Err(ThresholdError::InvalidPer(per.to_string()));
        }
        let per: f64 = per
            .parse()
            .map_err(|_| ThresholdError::InvalidPer(per.to_string()))?;

        if rate == 0 {
            return Err(ThresholdError::ZeroRate);
        }
        if !per.is_finite() || per <= 0.0 {
            return Err(ThresholdError::NonPositivePer);
        }
        match Duration::try_from_secs_f64(per) {
            Ok(window) if !window.is_zero() => {}
            _ => return Err(ThresholdError::PerOutOfRange(per.to_string())),
        }

        Ok(Self { rate, per })
    }

    /// The window as a [`Duration`]. Periods too long to represent saturate.
    pub fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.per).unwrap_or(Duration::MAX)
    }
}

/// Digits with at most one decimal point. Rejects signs, exponents, whitespace and
/// the `inf`/`nan` spellings `f64::from_str` would otherwise accept.
fn is_plain_number(s: &str) -> bool {
    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in s.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

impl FromStr for Threshold {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rate, self.per)
    }
}
