// tado_exporter - Prometheus metrics exporter for tado° thermostats
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::convert::Infallible;
use std::str::FromStr;

/// Name of the response header the tado API uses for quota accounting.
pub const RATELIMIT_HEADER: &str = "ratelimit";

const KEY_REMAINING: &str = "r";
const KEY_REFILL: &str = "t";

/// Quota accounting parsed from a `ratelimit` response header.
///
/// The header looks like `"perday";r=99,t=3600` where the quoted part names the
/// limit policy, `r` is the number of requests remaining and `t` is the refill
/// window. Parsing never fails: missing or malformed counters are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub label: String,
    pub remaining: u64,
    pub refill: u64,
}

impl RateLimit {
    pub fn from_header(value: &str) -> Self {
        let (label, fields) = match value.split_once(';') {
            Some((label, fields)) => (label, fields),
            None => (value, ""),
        };

        let mut limit = RateLimit {
            label: label.trim().trim_matches('"').to_owned(),
            ..Default::default()
        };

        for field in fields.split(',') {
            let Some((key, val)) = field.split_once('=') else {
                continue;
            };

            match key.trim() {
                KEY_REMAINING => limit.remaining = parse_counter(val),
                KEY_REFILL => limit.refill = parse_counter(val),
                _ => {}
            }
        }

        limit
    }
}

impl FromStr for RateLimit {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_header(s))
    }
}

fn parse_counter(val: &str) -> u64 {
    val.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::RateLimit;

    #[test]
    fn test_remaining_only() {
        let limit = RateLimit::from_header("\"perday\";r=123");
        assert_eq!("perday", limit.label);
        assert_eq!(123, limit.remaining);
        assert_eq!(0, limit.refill);
    }

    #[test]
    fn test_remaining_and_refill() {
        let limit = RateLimit::from_header("\"perday\";r=0,t=123");
        assert_eq!(
            RateLimit {
                label: "perday".to_owned(),
                remaining: 0,
                refill: 123,
            },
            limit
        );
    }

    #[test]
    fn test_fields_any_order() {
        let limit = RateLimit::from_header("\"perday\";t=60,r=42");
        assert_eq!(42, limit.remaining);
        assert_eq!(60, limit.refill);
    }

    #[test]
    fn test_refill_only() {
        let limit = RateLimit::from_header("\"perday\";t=3600");
        assert_eq!(0, limit.remaining);
        assert_eq!(3600, limit.refill);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let limit = RateLimit::from_header("\"perday\";q=7, r=5 ,w=1,t=9");
        assert_eq!(5, limit.remaining);
        assert_eq!(9, limit.refill);
    }

    #[test]
    fn test_malformed_counter_is_zero() {
        let limit = RateLimit::from_header("\"perday\";r=lots,t=-4");
        assert_eq!("perday", limit.label);
        assert_eq!(0, limit.remaining);
        assert_eq!(0, limit.refill);
    }

    #[test]
    fn test_no_fields() {
        let limit = RateLimit::from_header("\"perday\"");
        assert_eq!("perday", limit.label);
        assert_eq!(0, limit.remaining);
        assert_eq!(0, limit.refill);
    }

    #[test]
    fn test_garbage() {
        let limit: RateLimit = ";;==,,".parse().unwrap();
        assert_eq!("", limit.label);
        assert_eq!(0, limit.remaining);
        assert_eq!(0, limit.refill);
    }
}
