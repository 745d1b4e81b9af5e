//! Host-range expressions
//!
//! A range expression is a compact spelling of a host set: `kn[1-5,20]`
//! expands to `kn1..kn5` plus `kn20`, and `foo[0-1].bar[1-2]` expands to
//! the cartesian product of both brackets. [`split_list`] expands an
//! expression into concrete names, [`unsplit_list`] folds names back into
//! the shortest deterministic expression, and [`host_cmp`] provides the
//! natural ordering used when rendering fan-out results.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty range expression")]
    Empty,

    #[error("unterminated '[' in range expression: {0}")]
    UnterminatedBracket(String),

    #[error("unexpected ']' in range expression: {0}")]
    UnexpectedClose(String),

    #[error("malformed numeric range: {0}")]
    MalformedRange(String),
}

/// One parsed piece of a term: either literal text or an expanded bracket
enum Segment {
    Literal(String),
    Numbers(Vec<String>),
}

/// Expand a range expression into the concrete host names it denotes.
///
/// Top-level commas separate independent terms; commas inside brackets
/// separate sub-ranges. Numeric padding is preserved when the low end of
/// a range is written with leading zeros.
pub fn split_list(spec: &str) -> Result<Vec<String>, Error> {
    if spec.trim().is_empty() {
        return Err(Error::Empty);
    }

    let mut out = Vec::new();

    for term in split_top_level(spec)? {
        out.extend(expand_term(&term)?);
    }

    Ok(out)
}

/// Split on commas that sit outside any bracket pair
fn split_top_level(spec: &str) -> Result<Vec<String>, Error> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in spec.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnexpectedClose(spec.to_string()))?;
                current.push(c);
            }
            ',' if depth == 0 => {
                terms.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if depth != 0 {
        return Err(Error::UnterminatedBracket(spec.to_string()));
    }

    terms.push(current);

    Ok(terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

/// Expand one term, taking the cartesian product of every bracket in it
fn expand_term(term: &str) -> Result<Vec<String>, Error> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = term.chars();

    while let Some(c) = chars.next() {
        match c {
            '[' => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }

                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => inner.push(c),
                        None => return Err(Error::UnterminatedBracket(term.to_string())),
                    }
                }

                segments.push(Segment::Numbers(expand_bracket(&inner)?));
            }
            ']' => return Err(Error::UnexpectedClose(term.to_string())),
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    let mut names = vec![String::new()];

    for segment in segments {
        match segment {
            Segment::Literal(text) => {
                for name in names.iter_mut() {
                    name.push_str(&text);
                }
            }
            Segment::Numbers(nums) => {
                names = names
                    .iter()
                    .cartesian_product(nums.iter())
                    .map(|(name, num)| format!("{name}{num}"))
                    .collect();
            }
        }
    }

    Ok(names)
}

/// Expand the inside of one bracket pair into formatted numbers
fn expand_bracket(inner: &str) -> Result<Vec<String>, Error> {
    let mut nums = Vec::new();

    for piece in inner.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(Error::MalformedRange(inner.to_string()));
        }

        match piece.split_once('-') {
            None => {
                parse_num(piece).ok_or_else(|| Error::MalformedRange(piece.to_string()))?;
                nums.push(piece.to_string());
            }
            Some((lo, hi)) => {
                let (lo, hi) = (lo.trim(), hi.trim());
                let lo_val =
                    parse_num(lo).ok_or_else(|| Error::MalformedRange(piece.to_string()))?;
                let hi_val =
                    parse_num(hi).ok_or_else(|| Error::MalformedRange(piece.to_string()))?;

                if lo_val > hi_val {
                    return Err(Error::MalformedRange(piece.to_string()));
                }

                // leading zeros on the low end fix the padding width
                let width = if lo.starts_with('0') && lo.len() > 1 {
                    lo.len()
                } else {
                    0
                };

                for val in lo_val..=hi_val {
                    nums.push(format!("{val:0width$}"));
                }
            }
        }
    }

    Ok(nums)
}

fn parse_num(s: &str) -> Option<u64> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    s.parse().ok()
}

/// Split a host into (prefix, digits, suffix) around its last digit run
fn decompose(host: &str) -> Option<(&str, &str, &str)> {
    let bytes = host.as_bytes();

    let end = bytes.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);

    Some((&host[..start], &host[start..end], &host[end..]))
}

/// Fold a list of host names into its compact range expression.
///
/// Hosts sharing a prefix and suffix around a numeric component collapse
/// into one bracketed term; the largest group prints first, ties broken
/// lexicographically, so the output is deterministic for any input
/// ordering. Duplicate names survive the round trip.
pub fn unsplit_list<S: AsRef<str>>(hosts: &[S]) -> String {
    let mut groups: BTreeMap<(String, String), Vec<(u64, String)>> = BTreeMap::new();
    let mut plain: Vec<String> = Vec::new();

    for host in hosts {
        let host = host.as_ref();
        match decompose(host) {
            Some((prefix, digits, suffix)) => {
                let val = digits.parse::<u64>().unwrap_or(0);
                groups
                    .entry((prefix.to_string(), suffix.to_string()))
                    .or_default()
                    .push((val, digits.to_string()));
            }
            None => plain.push(host.to_string()),
        }
    }

    struct Unit {
        count: usize,
        key: (String, String),
        text: String,
    }

    let mut units: Vec<Unit> = Vec::new();

    for ((prefix, suffix), mut nums) in groups {
        nums.sort();

        let count = nums.len();
        let text = if count == 1 {
            format!("{prefix}{}{suffix}", nums[0].1)
        } else {
            format!("{prefix}[{}]{suffix}", collapse_runs(&nums))
        };

        units.push(Unit {
            count,
            key: (prefix, suffix),
            text,
        });
    }

    plain.sort();
    for name in plain {
        units.push(Unit {
            count: 1,
            key: (name.clone(), String::new()),
            text: name,
        });
    }

    // most members first, then lexicographic on (prefix, suffix)
    units.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

    units.into_iter().map(|u| u.text).join(",")
}

/// Collapse sorted numbers into `lo-hi` runs. Equal neighbors break a
/// run so duplicates are preserved, and a run only admits spellings the
/// expansion of its low end would regenerate (padding stays intact).
fn collapse_runs(nums: &[(u64, String)]) -> String {
    let mut pieces: Vec<String> = Vec::new();
    let mut i = 0usize;

    while i < nums.len() {
        let (_, start_digits) = &nums[i];
        let width = if start_digits.len() > 1 && start_digits.starts_with('0') {
            start_digits.len()
        } else {
            0
        };

        let mut j = i + 1;
        while j < nums.len()
            && nums[j].0 == nums[j - 1].0 + 1
            && spelled_with_width(nums[j].0, &nums[j].1, width)
        {
            j += 1;
        }

        if j - i == 1 {
            pieces.push(start_digits.clone());
        } else {
            pieces.push(format!("{}-{}", start_digits, nums[j - 1].1));
        }

        i = j;
    }

    pieces.join(",")
}

fn spelled_with_width(val: u64, digits: &str, width: usize) -> bool {
    digits == format!("{val:0width$}")
}

/// Natural host ordering: digit runs compare numerically, text runs
/// lexicographically
pub fn host_cmp(a: &str, b: &str) -> Ordering {
    let mut a_runs = runs(a).into_iter();
    let mut b_runs = runs(b).into_iter();

    loop {
        match (a_runs.next(), b_runs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xv), Ok(yv)) => xv.cmp(&yv).then_with(|| x.cmp(&y)),
                    _ => x.cmp(&y),
                };

                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Sort hosts in place using [`host_cmp`]
pub fn sort_hosts<S: AsRef<str>>(hosts: &mut [S]) {
    hosts.sort_by(|a, b| host_cmp(a.as_ref(), b.as_ref()));
}

fn runs(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    for c in s.chars() {
        let is_digit = c.is_ascii_digit();
        match out.last_mut() {
            Some(last) if last.chars().next().map(|f| f.is_ascii_digit()) == Some(is_digit) => {
                last.push(c)
            }
            _ => out.push(c.to_string()),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_simple_range() {
        let hosts = split_list("kn[1-3,100]").unwrap();
        assert_eq!(hosts, vec!["kn1", "kn2", "kn3", "kn100"]);
    }

    #[test]
    fn split_plain_list() {
        let hosts = split_list("a,b,kn[1-2]").unwrap();
        assert_eq!(hosts, vec!["a", "b", "kn1", "kn2"]);
    }

    #[test]
    fn split_cartesian_brackets() {
        let hosts = split_list("foo[0-1].bar[1-2]").unwrap();
        assert_eq!(
            hosts,
            vec!["foo0.bar1", "foo0.bar2", "foo1.bar1", "foo1.bar2"]
        );
    }

    #[test]
    fn split_preserves_padding() {
        let hosts = split_list("kn[08-10]").unwrap();
        assert_eq!(hosts, vec!["kn08", "kn09", "kn10"]);
    }

    #[test]
    fn split_rejects_malformed() {
        assert_eq!(split_list(""), Err(Error::Empty));
        assert!(matches!(
            split_list("kn[1-3"),
            Err(Error::UnterminatedBracket(_))
        ));
        assert!(matches!(split_list("kn]1["), Err(Error::UnexpectedClose(_))));
        assert!(matches!(
            split_list("kn[3-1]"),
            Err(Error::MalformedRange(_))
        ));
        assert!(matches!(
            split_list("kn[a-b]"),
            Err(Error::MalformedRange(_))
        ));
    }

    #[test]
    fn unsplit_collapses_runs() {
        let hosts = ["kn1", "kn2", "kn3", "kn4", "kn5", "kn20"];
        assert_eq!(unsplit_list(&hosts), "kn[1-5,20]");
    }

    #[test]
    fn unsplit_single_host_stays_plain() {
        assert_eq!(unsplit_list(&["kn7"]), "kn7");
        assert_eq!(unsplit_list(&["gateway"]), "gateway");
    }

    #[test]
    fn unsplit_orders_largest_group_first() {
        let hosts = ["ra1", "kn1", "kn2", "kn3"];
        assert_eq!(unsplit_list(&hosts), "kn[1-3],ra1");
    }

    #[test]
    fn unsplit_is_input_order_independent() {
        let a = ["kn3", "kn1", "kn2"];
        let b = ["kn1", "kn2", "kn3"];
        assert_eq!(unsplit_list(&a), unsplit_list(&b));
    }

    #[test]
    fn unsplit_keeps_duplicates() {
        let hosts = ["kn1", "kn1", "kn2"];
        let expr = unsplit_list(&hosts);

        let mut expanded = split_list(&expr).unwrap();
        expanded.sort();
        assert_eq!(expanded, vec!["kn1", "kn1", "kn2"]);
    }

    #[test]
    fn natural_order_compares_numerically() {
        assert_eq!(host_cmp("kn2", "kn10"), Ordering::Less);
        assert_eq!(host_cmp("kn10", "kn2"), Ordering::Greater);
        assert_eq!(host_cmp("kn1", "kn1"), Ordering::Equal);
        assert_eq!(host_cmp("abc", "abd"), Ordering::Less);
        assert_eq!(host_cmp("kn1.a", "kn1.b"), Ordering::Less);
    }

    #[test]
    fn sort_hosts_is_natural() {
        let mut hosts = vec!["kn10", "kn2", "kn1"];
        sort_hosts(&mut hosts);
        assert_eq!(hosts, vec!["kn1", "kn2", "kn10"]);
    }
}
