//! Partition time algebra.
//!
//! Time-partitioned raw data lives under paths rendered from a
//! date-pattern string using the conversion specifiers `%Y %m %d %H`
//! (plus literal `%%`), in descending significance. This module
//! answers the two questions the scanners need: does a candidate path
//! prefix's implied time range overlap a query's `[start, end)` bounds
//! (so whole out-of-range subtrees can be pruned without descending),
//! and what are all the partition strings between two instants (so a
//! builder can enumerate its inputs).
//!
//! A repeated specifier is a back-reference: the second occurrence
//! must render the same value as the first. The regex crate has no
//! back-references, so repeats compile to a second capture group that
//! is checked for equality after the match.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use regex::Regex;

use crate::error::PatternError;

/// One date component, in descending significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Unit {
    Year,
    Month,
    Day,
    Hour,
}

const UNITS: [Unit; 4] = [Unit::Year, Unit::Month, Unit::Day, Unit::Hour];

impl Unit {
    fn from_spec(c: char) -> Option<Unit> {
        match c {
            'Y' => Some(Unit::Year),
            'm' => Some(Unit::Month),
            'd' => Some(Unit::Day),
            'H' => Some(Unit::Hour),
            _ => None,
        }
    }

    fn spec(&self) -> char {
        match self {
            Unit::Year => 'Y',
            Unit::Month => 'm',
            Unit::Day => 'd',
            Unit::Hour => 'H',
        }
    }

    fn digits(&self) -> usize {
        match self {
            Unit::Year => 4,
            _ => 2,
        }
    }

    fn render(&self, t: &DateTime<Utc>) -> String {
        match self {
            Unit::Year => format!("{:04}", t.year()),
            Unit::Month => format!("{:02}", t.month()),
            Unit::Day => format!("{:02}", t.day()),
            Unit::Hour => format!("{:02}", t.hour()),
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    Field(Unit),
    Backref(Unit),
}

#[derive(Debug)]
struct CaptureSpec {
    unit: Unit,
    backref: bool,
}

/// One prefix of the specifier list compiled to an anchored regex.
#[derive(Debug)]
struct PrefixMatcher {
    re: Regex,
    captures: Vec<CaptureSpec>,
}

/// A tokenized date pattern.
#[derive(Debug)]
pub struct Pattern {
    tokens: Vec<Token>,
    /// Prefix matchers, most specific first.
    prefixes: Vec<PrefixMatcher>,
    smallest: Option<Unit>,
}

impl Pattern {
    /// Tokenizes a pattern string. Specifiers must appear
    /// large-to-small; a repeat becomes a back-reference.
    pub fn parse(pattern: &str) -> Result<Pattern, PatternError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut seen = [false; 4];
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let spec = chars.next().ok_or(PatternError::TrailingPercent)?;
            if spec == '%' {
                literal.push('%');
                continue;
            }
            let unit = Unit::from_spec(spec).ok_or(PatternError::UnknownSpecifier(spec))?;
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            if seen[unit as usize] {
                tokens.push(Token::Backref(unit));
                continue;
            }
            for larger in UNITS.iter().take(unit as usize) {
                if !seen[*larger as usize] {
                    return Err(PatternError::OutOfOrder {
                        found: spec,
                        missing: larger.spec(),
                    });
                }
            }
            seen[unit as usize] = true;
            tokens.push(Token::Field(unit));
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        let prefixes = build_prefixes(&tokens)?;
        let smallest = UNITS.iter().rev().find(|u| seen[**u as usize]).copied();
        Ok(Pattern {
            tokens,
            prefixes,
            smallest,
        })
    }

    /// Whether the pattern carries any time specifier at all.
    pub fn has_time(&self) -> bool {
        self.smallest.is_some()
    }

    /// Renders the pattern at one instant.
    pub fn render(&self, t: &DateTime<Utc>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Field(unit) | Token::Backref(unit) => out.push_str(&unit.render(t)),
            }
        }
        out
    }

    /// Does the candidate path's implied time range overlap
    /// `[start, end)`? Prefix matchers are tried most specific first;
    /// a path matching none carries no date information and is always
    /// contained. `None` bounds are unbounded.
    pub fn range_contains(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        path: &str,
    ) -> bool {
        for prefix in &self.prefixes {
            let Some((min, max)) = prefix.implied_range(path) else {
                continue;
            };
            if let Some(end) = end {
                if min >= end {
                    return false;
                }
            }
            if let Some(start) = start {
                if max <= start {
                    return false;
                }
            }
            return true;
        }
        true
    }

    /// Lazily enumerates every distinct rendering of the pattern
    /// between `start` (inclusive, rounded down to the smallest
    /// unit's alignment) and `end` (exclusive), in increasing order.
    pub fn enumerate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PartitionIter<'_> {
        let cursor = if start >= end {
            None
        } else {
            match self.smallest {
                Some(unit) => floor_to(&start, unit),
                // No time specifiers: a single rendering.
                None => Some(start),
            }
        };
        PartitionIter {
            pattern: self,
            cursor,
            end,
        }
    }
}

fn build_prefixes(tokens: &[Token]) -> Result<Vec<PrefixMatcher>, PatternError> {
    let field_count = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Literal(_)))
        .count();
    let mut prefixes = Vec::with_capacity(field_count);

    for want in (1..=field_count).rev() {
        let mut source = String::from("^");
        let mut captures = Vec::new();
        for token in tokens {
            if captures.len() == want {
                break;
            }
            match token {
                Token::Literal(s) => source.push_str(&regex::escape(s)),
                Token::Field(unit) | Token::Backref(unit) => {
                    source.push_str(&format!(r"(\d{{{}}})", unit.digits()));
                    captures.push(CaptureSpec {
                        unit: *unit,
                        backref: matches!(token, Token::Backref(_)),
                    });
                }
            }
        }
        prefixes.push(PrefixMatcher {
            re: Regex::new(&source)?,
            captures,
        });
    }
    Ok(prefixes)
}

impl PrefixMatcher {
    /// The `[min, max)` instant range a matching path prefix implies,
    /// or `None` when this prefix does not match (including back-
    /// reference mismatches and impossible calendar values, which fall
    /// through to a less specific prefix).
    fn implied_range(&self, path: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let caps = self.re.captures(path)?;
        let mut values: [Option<u32>; 4] = [None; 4];
        for (i, spec) in self.captures.iter().enumerate() {
            let digits: u32 = caps.get(i + 1)?.as_str().parse().ok()?;
            let slot = &mut values[spec.unit as usize];
            match slot {
                Some(prior) if spec.backref => {
                    if *prior != digits {
                        return None;
                    }
                }
                _ => *slot = Some(digits),
            }
        }

        let least = *UNITS
            .iter()
            .rev()
            .find(|u| values[**u as usize].is_some())?;
        let year = values[Unit::Year as usize]? as i32;
        let month = values[Unit::Month as usize].unwrap_or(1);
        let day = values[Unit::Day as usize].unwrap_or(1);
        let hour = values[Unit::Hour as usize].unwrap_or(0);

        let min = Utc
            .with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()?;
        let max = advance(&min, least)?;
        Some((min, max))
    }
}

/// Truncates an instant to the start of its unit, cascading the
/// smaller fields.
fn floor_to(t: &DateTime<Utc>, unit: Unit) -> Option<DateTime<Utc>> {
    let (month, day, hour) = match unit {
        Unit::Year => (1, 1, 0),
        Unit::Month => (t.month(), 1, 0),
        Unit::Day => (t.month(), t.day(), 0),
        Unit::Hour => (t.month(), t.day(), t.hour()),
    };
    Utc.with_ymd_and_hms(t.year(), month, day, hour, 0, 0).single()
}

/// One calendar step of `unit`. Month and year steps mutate the
/// month/year fields directly so variable-length months cannot drift;
/// day and hour steps are fixed durations.
fn advance(t: &DateTime<Utc>, unit: Unit) -> Option<DateTime<Utc>> {
    match unit {
        Unit::Year => Utc
            .with_ymd_and_hms(t.year() + 1, 1, 1, 0, 0, 0)
            .single(),
        Unit::Month => {
            let (year, month) = if t.month() == 12 {
                (t.year() + 1, 1)
            } else {
                (t.year(), t.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
        }
        Unit::Day => t.checked_add_signed(Duration::days(1)),
        Unit::Hour => t.checked_add_signed(Duration::hours(1)),
    }
}

/// Finite, restartable enumerator over partition renderings.
#[derive(Debug)]
pub struct PartitionIter<'a> {
    pattern: &'a Pattern,
    cursor: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
}

impl Iterator for PartitionIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let cursor = self.cursor.take()?;
        let rendered = self.pattern.render(&cursor);
        if let Some(unit) = self.pattern.smallest {
            self.cursor = advance(&cursor, unit).filter(|next| *next < self.end);
        }
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parse_rejects_malformed_patterns() {
        assert!(matches!(
            Pattern::parse("%Y/%m/%"),
            Err(PatternError::TrailingPercent)
        ));
        assert!(matches!(
            Pattern::parse("%Y/%q"),
            Err(PatternError::UnknownSpecifier('q'))
        ));
        assert!(matches!(
            Pattern::parse("%m/%d"),
            Err(PatternError::OutOfOrder {
                found: 'm',
                missing: 'Y'
            })
        ));
        assert!(matches!(
            Pattern::parse("%Y/%d"),
            Err(PatternError::OutOfOrder {
                found: 'd',
                missing: 'm'
            })
        ));
    }

    #[test]
    fn literal_percent_is_not_a_specifier() {
        let pattern = Pattern::parse("%%Y/%Y").unwrap();
        assert_eq!(pattern.render(&ts(2014, 5, 2, 0, 0, 0)), "%Y/2014");
    }

    #[test]
    fn range_contains_daily_partitions() {
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        let start = Some(ts(2014, 5, 2, 12, 34, 56));
        let end = Some(ts(2014, 5, 5, 17, 34, 56));

        assert!(!pattern.range_contains(start, end, "2014/05/01"));
        for day in 2..=5 {
            let path = format!("2014/05/{:02}", day);
            assert!(pattern.range_contains(start, end, &path), "{}", path);
        }
        assert!(!pattern.range_contains(start, end, "2014/05/06"));
    }

    #[test]
    fn range_contains_literal_prefixes() {
        let pattern = Pattern::parse("year-%Y/month-%m/day-%d").unwrap();
        let start = Some(ts(2014, 5, 2, 12, 34, 56));
        let end = Some(ts(2014, 5, 5, 17, 34, 56));
        assert!(!pattern.range_contains(start, end, "year-2014/month-05/day-01"));
        assert!(pattern.range_contains(start, end, "year-2014/month-05/day-02"));
    }

    #[test]
    fn range_contains_prunes_whole_subtrees() {
        // A bare year directory is rejected without looking deeper.
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        let start = Some(ts(2014, 5, 2, 0, 0, 0));
        let end = Some(ts(2014, 5, 5, 0, 0, 0));
        assert!(!pattern.range_contains(start, end, "2013"));
        assert!(pattern.range_contains(start, end, "2014"));
        assert!(pattern.range_contains(start, end, "2014/05"));
        assert!(!pattern.range_contains(start, end, "2014/06"));
    }

    #[test]
    fn unrecognizable_path_is_always_contained() {
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        let start = Some(ts(2014, 5, 2, 0, 0, 0));
        let end = Some(ts(2014, 5, 5, 0, 0, 0));
        assert!(pattern.range_contains(start, end, "catalog.json"));
        assert!(pattern.range_contains(None, None, "catalog.json"));
    }

    #[test]
    fn unbounded_sides_are_unconstrained() {
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        assert!(pattern.range_contains(None, Some(ts(2014, 5, 5, 0, 0, 0)), "2013/01/01"));
        assert!(!pattern.range_contains(Some(ts(2014, 5, 5, 0, 0, 0)), None, "2013/01/01"));
    }

    #[test]
    fn rendered_midpoint_is_always_contained() {
        let pattern = Pattern::parse("%Y/%m/%d/%H").unwrap();
        let start = ts(2014, 1, 31, 23, 0, 0);
        let mid = ts(2014, 2, 28, 6, 30, 0);
        let end = ts(2014, 3, 1, 0, 0, 0);
        let path = pattern.render(&mid);
        assert!(pattern.range_contains(Some(start), Some(end), &path));
    }

    #[test]
    fn backref_mismatch_falls_back_to_shorter_prefix() {
        let pattern = Pattern::parse("%Y/%m/%Y-archive").unwrap();
        let start = Some(ts(2014, 5, 1, 0, 0, 0));
        let end = Some(ts(2014, 6, 1, 0, 0, 0));
        assert!(pattern.range_contains(start, end, "2014/05/2014-archive"));
        // The mismatched repeat falls back to the %Y/%m prefix, which
        // still excludes the wrong month.
        assert!(!pattern.range_contains(start, end, "2014/04/1999-archive"));
    }

    #[test]
    fn enumerate_empty_and_epsilon_ranges() {
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        let t = ts(2014, 5, 2, 12, 34, 56);
        assert_eq!(pattern.enumerate(t, t).count(), 0);
        let values: Vec<_> = pattern
            .enumerate(t, t + Duration::seconds(1))
            .collect();
        assert_eq!(values, vec!["2014/05/02".to_string()]);
    }

    #[test]
    fn enumerate_days_across_month_boundary() {
        let pattern = Pattern::parse("%Y/%m/%d").unwrap();
        let values: Vec<_> = pattern
            .enumerate(ts(2014, 4, 29, 7, 0, 0), ts(2014, 5, 2, 0, 0, 1))
            .collect();
        assert_eq!(
            values,
            vec!["2014/04/29", "2014/04/30", "2014/05/01", "2014/05/02"]
        );
    }

    #[test]
    fn enumerate_months_uses_calendar_arithmetic() {
        let pattern = Pattern::parse("%Y-%m").unwrap();
        let values: Vec<_> = pattern
            .enumerate(ts(2013, 11, 15, 0, 0, 0), ts(2014, 3, 1, 0, 0, 0))
            .collect();
        assert_eq!(values, vec!["2013-11", "2013-12", "2014-01", "2014-02"]);
    }

    #[test]
    fn enumerate_without_specifiers_yields_one_value() {
        let pattern = Pattern::parse("logs/current").unwrap();
        let values: Vec<_> = pattern
            .enumerate(ts(2014, 1, 1, 0, 0, 0), ts(2015, 1, 1, 0, 0, 0))
            .collect();
        assert_eq!(values, vec!["logs/current".to_string()]);
    }

    #[test]
    fn enumerate_is_restartable() {
        let pattern = Pattern::parse("%Y/%m/%d/%H").unwrap();
        let start = ts(2014, 5, 2, 3, 30, 0);
        let end = ts(2014, 5, 2, 6, 0, 0);
        let first: Vec<_> = pattern.enumerate(start, end).collect();
        let second: Vec<_> = pattern.enumerate(start, end).collect();
        assert_eq!(first, vec!["2014/05/02/03", "2014/05/02/04", "2014/05/02/05"]);
        assert_eq!(first, second);
    }
}
