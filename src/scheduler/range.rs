use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{FarmError, Result};

/// Largest number of frames one range may name.
pub const MAX_FRAMES: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: i64,
    end: i64,
    step: i64,
}

impl Span {
    fn parse(token: &str) -> Result<Self> {
        let bad = || FarmError::InvalidRange(token.to_string());

        let (bounds, step) = match token.split_once(':') {
            Some((bounds, step)) => (bounds, step.parse::<i64>().map_err(|_| bad())?),
            None => (token, 1),
        };
        if step < 1 {
            return Err(bad());
        }

        // Skip a leading sign so "-5--1" splits on the separating dash.
        let sep = bounds
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '-')
            .map(|(i, _)| i);
        let (start, end) = match sep {
            Some(i) => (
                bounds[..i].parse::<i64>().map_err(|_| bad())?,
                bounds[i + 1..].parse::<i64>().map_err(|_| bad())?,
            ),
            None => {
                let frame = bounds.parse::<i64>().map_err(|_| bad())?;
                (frame, frame)
            }
        };
        if end < start {
            return Err(bad());
        }

        Ok(Self { start, end, step })
    }

    fn len(&self) -> u64 {
        let distance = (self.end as i128 - self.start as i128) / self.step as i128;
        u64::try_from(distance + 1).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}:{}", self.start, self.end, self.step)
    }
}

/// Frame-range spec: space separated `<start>-<end>:<step>` tokens,
/// inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRange {
    spans: Vec<Span>,
}

impl FrameRange {
    pub fn parse(spec: &str) -> Result<Self> {
        let spans = spec
            .split_whitespace()
            .map(Span::parse)
            .collect::<Result<Vec<_>>>()?;
        if spans.is_empty() {
            return Err(FarmError::InvalidRange(spec.to_string()));
        }
        let total = spans.iter().fold(0u64, |total, span| total.saturating_add(span.len()));
        if total > MAX_FRAMES {
            return Err(FarmError::InvalidRange(format!(
                "{spec} names {total} frames, more than {MAX_FRAMES}"
            )));
        }
        Ok(Self { spans })
    }

    /// Every frame the spec names, in order, each frame once.
    pub fn frames(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        let mut frames = Vec::new();
        for span in &self.spans {
            let mut next = Some(span.start);
            while let Some(frame) = next.filter(|f| *f <= span.end) {
                if seen.insert(frame) {
                    frames.push(frame);
                }
                next = frame.checked_add(span.step);
            }
        }
        frames
    }
}

impl FromStr for FrameRange {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for FrameRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{span}")?;
        }
        Ok(())
    }
}
