//! Name patterns used to pick the clients a relay message is forwarded to.
//!
//! A classifier is a list of tokens separated by commas or whitespace. A
//! name matches when any token matches it:
//!
//! - `render07` matches exactly that name
//! - `render*` / `node-?` are shell-style wildcards
//! - `render[01-12]` matches `render01` through `render12`; a zero-padded
//!   start fixes the digit width
//! - `*` on its own matches every client

use regex::Regex;

use crate::error::{FarmError, Result};

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Wildcard(Regex),
    Range {
        prefix: String,
        suffix: String,
        start: u64,
        end: u64,
        width: Option<usize>,
    },
}

impl Pattern {
    fn parse(token: &str) -> Result<Self> {
        if let Some(open) = token.find('[') {
            let close = token[open..]
                .find(']')
                .map(|i| open + i)
                .ok_or_else(|| invalid(token, "unclosed `[`"))?;
            let (lo, hi) = token[open + 1..close]
                .split_once('-')
                .ok_or_else(|| invalid(token, "range must be `[start-end]`"))?;
            let start: u64 = lo.parse().map_err(|_| invalid(token, "bad range start"))?;
            let end: u64 = hi.parse().map_err(|_| invalid(token, "bad range end"))?;
            if end < start {
                return Err(invalid(token, "range end before start"));
            }
            let width = (lo.len() > 1 && lo.starts_with('0')).then_some(lo.len());
            return Ok(Pattern::Range {
                prefix: token[..open].to_string(),
                suffix: token[close + 1..].to_string(),
                start,
                end,
                width,
            });
        }

        if token.contains(['*', '?']) {
            let mut expr = String::from("^");
            for ch in token.chars() {
                match ch {
                    '*' => expr.push_str(".*"),
                    '?' => expr.push('.'),
                    other => expr.push_str(&regex::escape(&other.to_string())),
                }
            }
            expr.push('$');
            let re = Regex::new(&expr).map_err(|e| invalid(token, &e.to_string()))?;
            return Ok(Pattern::Wildcard(re));
        }

        Ok(Pattern::Exact(token.to_string()))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == name,
            Pattern::Wildcard(re) => re.is_match(name),
            Pattern::Range {
                prefix,
                suffix,
                start,
                end,
                width,
            } => {
                let Some(digits) = name
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_suffix(suffix.as_str()))
                else {
                    return false;
                };
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return false;
                }
                if width.is_some_and(|w| w != digits.len()) {
                    return false;
                }
                digits
                    .parse::<u64>()
                    .is_ok_and(|n| (*start..=*end).contains(&n))
            }
        }
    }
}

fn invalid(token: &str, reason: &str) -> FarmError {
    FarmError::Internal(format!("invalid classifier token `{token}`: {reason}"))
}

#[derive(Debug, Clone)]
pub struct Classifier {
    patterns: Vec<Pattern>,
}

impl Classifier {
    pub fn parse(expr: &str) -> Result<Self> {
        let patterns = expr
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(Pattern::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Filter `names` down to the ones this classifier selects.
    pub fn select<'a, I>(&self, names: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().filter(|n| self.matches(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let c = Classifier::parse("render07").unwrap();
        assert!(c.matches("render07"));
        assert!(!c.matches("render070"));
        assert!(!c.matches("render7"));
    }

    #[test]
    fn wildcard_match() {
        let c = Classifier::parse("render*").unwrap();
        assert!(c.matches("render07"));
        assert!(c.matches("render"));
        assert!(!c.matches("sim01"));

        let c = Classifier::parse("node-?").unwrap();
        assert!(c.matches("node-a"));
        assert!(!c.matches("node-ab"));

        let c = Classifier::parse("*").unwrap();
        assert!(c.matches("anything.at.all"));
    }

    #[test]
    fn wildcard_escapes_regex_characters() {
        let c = Classifier::parse("gpu.box*").unwrap();
        assert!(c.matches("gpu.box1"));
        assert!(!c.matches("gpuxbox1"));
    }

    #[test]
    fn numeric_range_match() {
        let c = Classifier::parse("render[01-12]").unwrap();
        assert!(c.matches("render01"));
        assert!(c.matches("render12"));
        assert!(!c.matches("render13"));
        assert!(!c.matches("render1"));
        assert!(!c.matches("render001"));

        let c = Classifier::parse("rack[5-10]-gpu").unwrap();
        assert!(c.matches("rack5-gpu"));
        assert!(c.matches("rack10-gpu"));
        assert!(!c.matches("rack4-gpu"));
        assert!(!c.matches("rack7-cpu"));
    }

    #[test]
    fn multiple_tokens() {
        let c = Classifier::parse("sim01, render[1-3] cache*").unwrap();
        let names = ["sim01", "sim02", "render2", "render4", "cache-big"];
        assert_eq!(
            c.select(names.iter().copied()),
            vec!["sim01", "render2", "cache-big"]
        );
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(Classifier::parse("render[01-").is_err());
        assert!(Classifier::parse("render[a-b]").is_err());
        assert!(Classifier::parse("render[9-3]").is_err());
        assert!(Classifier::parse("render[7]").is_err());
    }
}
