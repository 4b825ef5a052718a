//! Tiered expiry rules for the compactor. A tier pairs a minimum value
//! size with an age in days; a record matches the largest tier its size
//! reaches, and that tier's age alone decides whether it has expired.

use crate::errinput;
use crate::error::{Error, Result};

const SECONDS_PER_DAY: i64 = 86400;

/// A single expiry tier.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Tier {
    /// Minimum stored value size in bytes for this tier to apply.
    size: u64,
    /// Age in days after which a matching record expires.
    days: u32,
}

/// An expiry policy: tiers sorted by size descending. Records smaller than
/// every tier never expire.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpiryPolicy {
    tiers: Vec<Tier>,
}

impl ExpiryPolicy {
    /// Parses a comma-separated list of SIZE:DAYS tiers, e.g.
    /// "10K:30,10M:11". Sizes take an optional case-insensitive K or M
    /// suffix. Any malformed entry fails the whole parse.
    pub fn parse(ranges: &str) -> Result<Self> {
        let mut tiers = Vec::new();
        for part in ranges.split(',') {
            let Some((size, days)) = part.split_once(':') else {
                return errinput!("expiry range {part} is not SIZE:DAYS");
            };
            tiers.push(Tier { size: parse_size(size)?, days: parse_days(days)? });
        }
        Ok(Self::from_tiers(tiers))
    }

    /// Builds a policy from CLI options: optional SIZE:DAYS ranges plus the
    /// legacy expire-days/size shorthand, which injects one more tier.
    /// Returns None when no expiry options were given.
    pub fn from_options(
        ranges: Option<&str>,
        expire_days: Option<u32>,
        size_limit: Option<&str>,
    ) -> Result<Option<Self>> {
        let mut tiers = match ranges {
            Some(ranges) => Self::parse(ranges)?.tiers,
            None => Vec::new(),
        };
        match (expire_days, size_limit) {
            (Some(days), size) => {
                let size = size.map(parse_size).transpose()?.unwrap_or(0);
                tiers.push(Tier { size, days });
            }
            (None, Some(_)) => return errinput!("an expiry size limit requires expire days"),
            (None, None) => {}
        }
        if tiers.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::from_tiers(tiers)))
    }

    fn from_tiers(mut tiers: Vec<Tier>) -> Self {
        // Stable sort: equal sizes keep their given order, first one wins.
        tiers.sort_by_key(|tier| std::cmp::Reverse(tier.size));
        Self { tiers }
    }

    /// Decides whether a record with the given write time and stored value
    /// size has expired at `now`. The largest tier the size reaches is
    /// authoritative; later tiers are not consulted.
    pub fn expired(&self, tstamp: i32, vsz: u32, now: i64) -> bool {
        for tier in &self.tiers {
            if vsz as u64 >= tier.size {
                return (tstamp as i64) <= now - tier.days as i64 * SECONDS_PER_DAY;
            }
        }
        false
    }
}

/// Parses a size as a decimal integer with an optional case-insensitive
/// K or M suffix. No suffix means bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, unit) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let size: u64 =
        digits.parse().map_err(|_| Error::InvalidInput(format!("invalid expiry size {s}")))?;
    Ok(size * unit)
}

fn parse_days(s: &str) -> Result<u32> {
    s.trim().parse().map_err(|_| Error::InvalidInput(format!("invalid expiry days {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const NOW: i64 = 1_700_000_000;
    const DAY: i64 = SECONDS_PER_DAY;

    fn at(days_ago: i64) -> i32 {
        (NOW - days_ago * DAY) as i32
    }

    #[test_case("10k" => 10 * 1024; "lowercase k suffix")]
    #[test_case("10K" => 10 * 1024; "uppercase k suffix")]
    #[test_case("3M" => 3 * 1024 * 1024)]
    #[test_case("4096" => 4096)]
    #[test_case("0" => 0)]
    fn sizes(s: &str) -> u64 {
        parse_size(s).expect("parse failed")
    }

    #[test_case(""; "empty")]
    #[test_case("10KB"; "two letter suffix")]
    #[test_case("-1"; "negative")]
    #[test_case("1.5K"; "fractional")]
    #[test_case("K"; "suffix only")]
    fn bad_sizes(s: &str) {
        assert!(parse_size(s).is_err());
    }

    #[test]
    fn bad_ranges_fail_whole_parse() {
        assert!(ExpiryPolicy::parse("10K:30,nope").is_err());
        assert!(ExpiryPolicy::parse("10K:30,10M:-1").is_err());
        assert!(ExpiryPolicy::parse("10K").is_err());
        assert!(ExpiryPolicy::from_options(None, None, Some("10K")).is_err());
    }

    #[test]
    fn no_options_no_policy() {
        assert_eq!(ExpiryPolicy::from_options(None, None, None).expect("parse failed"), None);
    }

    /// Expiry decisions against the "10K:30,10M:11" policy.
    #[test_case(at(10), 9 * 1024 => false; "small and fresh")]
    #[test_case(at(40), 6 * 1024 => false; "below all tiers")]
    #[test_case(at(10), 11 * 1024 => false; "10K tier fresh")]
    #[test_case(at(40), 9 * 1024 * 1024 => true; "10K tier old")]
    #[test_case(at(10), 11 * 1024 * 1024 => false; "10M tier fresh")]
    #[test_case(at(40), 12 * 1024 * 1024 => true; "10M tier old")]
    fn tiered(tstamp: i32, vsz: u32) -> bool {
        let policy = ExpiryPolicy::parse("10K:30,10M:11").expect("parse failed");
        policy.expired(tstamp, vsz, NOW)
    }

    /// The same table with the legacy expire_days=9 shorthand added: small
    /// records now fall through to the catch-all tier.
    #[test_case(at(10), 9 * 1024 => true; "small but older than nine days")]
    #[test_case(at(8), 6 * 1024 => false; "small and under nine days")]
    fn tiered_with_shorthand(tstamp: i32, vsz: u32) -> bool {
        let policy = ExpiryPolicy::from_options(Some("10K:30,10M:11"), Some(9), None)
            .expect("parse failed")
            .expect("no policy");
        policy.expired(tstamp, vsz, NOW)
    }

    /// A record exactly at the age threshold is expired (tstamp <= now - days).
    #[test]
    fn boundary_is_inclusive() {
        let policy = ExpiryPolicy::parse("1K:10").expect("parse failed");
        assert!(policy.expired(at(10), 1024, NOW));
        assert!(!policy.expired(at(10) + 1, 1024, NOW));
        // Size boundary: vsz >= size matches the tier.
        assert!(!policy.expired(at(10), 1023, NOW));
    }

    #[test]
    fn largest_matching_tier_wins() {
        // A 10M-sized record is fresh per the 10M tier even though the 10K
        // tier's 30 days have long passed.
        let policy = ExpiryPolicy::parse("10K:30,10M:365").expect("parse failed");
        assert!(!policy.expired(at(40), 20 * 1024 * 1024, NOW));
        assert!(policy.expired(at(40), 20 * 1024, NOW));
    }
}
