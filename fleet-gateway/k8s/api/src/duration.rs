//! Durations in Go's `time.ParseDuration` syntax, as used by Kubernetes
//! tooling and by the gateway's command line and environment.

use std::{fmt, str::FromStr, time::Duration};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("duration is too large")]
    Overflow,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl GoDuration ===

impl GoDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Reads a duration from the environment, returning `default` when the
    /// variable is unset and logging when it cannot be parsed.
    pub fn from_env_or(var: &str, default: Duration) -> Duration {
        match std::env::var(var) {
            Ok(value) => match value.parse::<Self>() {
                Ok(d) => d.into(),
                Err(error) => {
                    tracing::warn!(%var, %value, %error, "Ignoring invalid duration");
                    default
                }
            },
            Err(_) => default,
        }
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if self.0.subsec_nanos() != 0 || secs == 0 {
            return fmt::Debug::fmt(&self.0, f);
        }
        let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
        if h > 0 {
            write!(f, "{h}h{m}m{s}s")
        } else if m > 0 {
            write!(f, "{m}m{s}s")
        } else {
            write!(f, "{s}s")
        }
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.strip_prefix('+').unwrap_or(s);
        if rest.starts_with('-') {
            let magnitude = rest[1..].parse::<Self>()?;
            if magnitude.0.is_zero() {
                return Ok(magnitude);
            }
            return Err(ParseError::Negative);
        }
        if rest == "0" {
            return Ok(Self::default());
        }
        if rest.is_empty() {
            return Err(ParseError::NoUnit);
        }

        let is_numeric = |c: char| c.is_ascii_digit() || c == '.';
        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| !is_numeric(c))
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let value = value.parse::<f64>()?;
            let unit_end = tail.find(is_numeric).unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            let term = Duration::try_from_secs_f64(unit_duration(unit)?.as_secs_f64() * value)
                .map_err(|_| ParseError::Overflow)?;
            total = total.checked_add(term).ok_or(ParseError::Overflow)?;
            rest = tail;
        }
        Ok(Self(total))
    }
}

fn unit_duration(unit: &str) -> Result<Duration, ParseError> {
    const MINUTE: Duration = Duration::from_secs(60);
    match unit {
        "ns" => Ok(Duration::from_nanos(1)),
        // U+00B5 is the micro sign and U+03BC is the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
        "ms" => Ok(Duration::from_millis(1)),
        "s" => Ok(Duration::from_secs(1)),
        "m" => Ok(MINUTE),
        "h" => Ok(MINUTE * 60),
        _ => Err(ParseError::InvalidUnit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn parses_go_durations() {
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::ZERO),
            ("-0", Duration::ZERO),
            ("+5s", Duration::from_secs(5)),
            ("30s", Duration::from_secs(30)),
            ("5.6s", Duration::from_secs(5) + Duration::from_millis(600)),
            (".5s", Duration::from_millis(500)),
            ("10ns", Duration::from_nanos(10)),
            ("12\u{00b5}s", Duration::from_micros(12)),
            ("13ms", Duration::from_millis(13)),
            ("30m", 30 * MINUTE),
            ("3h30m", 3 * HOUR + 30 * MINUTE),
            ("1m30s", MINUTE + Duration::from_secs(30)),
        ];
        for (input, expected) in cases {
            let parsed = input
                .parse::<GoDuration>()
                .unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(Duration::from(parsed), *expected, "{input}");
        }
    }

    #[test]
    fn rejects_invalid() {
        assert_eq!("".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("5".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("5d".parse::<GoDuration>(), Err(ParseError::InvalidUnit));
        assert_eq!("-5s".parse::<GoDuration>(), Err(ParseError::Negative));
        assert!(matches!(
            "xs".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_))
        ));
        assert!(matches!(
            "1.2.3s".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_))
        ));
        assert_eq!(
            "99999999999999999999h".parse::<GoDuration>(),
            Err(ParseError::Overflow)
        );
        assert_eq!(
            "10000000000000000000s10000000000000000000s".parse::<GoDuration>(),
            Err(ParseError::Overflow)
        );
    }

    #[test]
    fn env_falls_back_on_invalid_values() {
        const VAR: &str = "FLEET_GATEWAY_TEST_DURATION_FALLBACK";
        let default = Duration::from_secs(30);

        std::env::remove_var(VAR);
        assert_eq!(GoDuration::from_env_or(VAR, default), default);

        std::env::set_var(VAR, "45s");
        assert_eq!(
            GoDuration::from_env_or(VAR, default),
            Duration::from_secs(45)
        );

        std::env::set_var(VAR, "99999999999999999999h");
        assert_eq!(GoDuration::from_env_or(VAR, default), default);

        std::env::set_var(VAR, "soon");
        assert_eq!(GoDuration::from_env_or(VAR, default), default);
        std::env::remove_var(VAR);
    }

    #[test]
    fn displays_like_go() {
        assert_eq!(GoDuration::from_secs(30).to_string(), "30s");
        assert_eq!(GoDuration::from_secs(90).to_string(), "1m30s");
        assert_eq!(GoDuration::from_secs(1800).to_string(), "30m0s");
        assert_eq!(GoDuration::from_secs(3600).to_string(), "1h0m0s");
    }
}
