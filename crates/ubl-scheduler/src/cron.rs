// SPDX-License-Identifier: MIT OR Apache-2.0

//! A compact five-field cron expression parser.
//!
//! Supports `minute hour day-of-month month day-of-week` with `*`, lists,
//! ranges, and steps (`*/5`, `1-10/2`). Day-of-week runs 0–7 where both 0
//! and 7 are Sunday. When both day fields are restricted the match is
//! either-or, per classic cron.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use ubl_core::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    /// Sorted allowed values; `None` means unrestricted (`*`).
    allowed: Option<Vec<u32>>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match &self.allowed {
            None => true,
            Some(values) => values.binary_search(&value).is_ok(),
        }
    }

    fn is_unrestricted(&self) -> bool {
        self.allowed.is_none()
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    source: String,
}

/// Search horizon for the next match, in minutes (a leap cycle).
const SEARCH_HORIZON_MINUTES: i64 = 366 * 24 * 60 * 4;

impl CronExpr {
    /// Parse a five-field expression.
    ///
    /// # Errors
    ///
    /// Returns [`ubl_core::ErrorKind::InvalidEvent`] for malformed
    /// expressions or out-of-range values.
    pub fn parse(expr: &str) -> LedgerResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(LedgerError::invalid_event(format!(
                "cron expression needs 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_dow(fields[4])?,
            source: expr.to_string(),
        })
    }

    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.matches(at.minute())
            || !self.hour.matches(at.hour())
            || !self.month.matches(at.month())
        {
            return false;
        }
        let dom = self.day_of_month.matches(at.day());
        let dow = self.day_of_week.matches(at.weekday().num_days_from_sunday());
        // Classic cron: both day fields restricted means either may match.
        if self.day_of_month.is_unrestricted() || self.day_of_week.is_unrestricted() {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// The first matching instant strictly after `after`, if any within
    /// the search horizon.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        for _ in 0..SEARCH_HORIZON_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(text: &str, min: u32, max: u32) -> LedgerResult<Field> {
    if text == "*" {
        return Ok(Field { allowed: None });
    }
    let mut allowed = Vec::new();
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| {
                    LedgerError::invalid_event(format!("bad cron step in {part:?}"))
                })?;
                if step == 0 {
                    return Err(LedgerError::invalid_event("cron step must be nonzero"));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else {
            match range.split_once('-') {
                Some((a, b)) => {
                    let lo = parse_value(a, min, max)?;
                    let hi = parse_value(b, min, max)?;
                    if lo > hi {
                        return Err(LedgerError::invalid_event(format!(
                            "inverted cron range {range:?}"
                        )));
                    }
                    (lo, hi)
                }
                None => {
                    let v = parse_value(range, min, max)?;
                    (v, v)
                }
            }
        };
        let mut v = lo;
        while v <= hi {
            allowed.push(v);
            v += step;
        }
    }
    allowed.sort_unstable();
    allowed.dedup();
    Ok(Field {
        allowed: Some(allowed),
    })
}

fn parse_value(text: &str, min: u32, max: u32) -> LedgerResult<u32> {
    let value: u32 = text
        .parse()
        .map_err(|_| LedgerError::invalid_event(format!("bad cron value {text:?}")))?;
    if value < min || value > max {
        return Err(LedgerError::invalid_event(format!(
            "cron value {value} outside {min}..={max}"
        )));
    }
    Ok(value)
}

fn parse_dow(text: &str) -> LedgerResult<Field> {
    let field = parse_field(text, 0, 7)?;
    // Normalize 7 to 0 (both are Sunday).
    Ok(match field.allowed {
        None => field,
        Some(values) => {
            let mut normalized: Vec<u32> =
                values.into_iter().map(|v| if v == 7 { 0 } else { v }).collect();
            normalized.sort_unstable();
            normalized.dedup();
            Field {
                allowed: Some(normalized),
            }
        }
    })
}
