//! Type-aware ordering for client-side reconstruction.
//!
//! Values come out of list items as JSON, so the comparator has to order
//! numbers, date strings, plain strings, booleans, and nulls against each
//! other. Direction is applied as a final sign flip over the natural order,
//! which keeps ascending and descending exact inverses.

use crate::query::filters::{Sort, SortDirection};
use crate::query::ListEntity;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// Natural ascending order. Nulls sort first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(dx), Some(dy)) => dx.cmp(&dy),
            _ => x.to_lowercase().cmp(&y.to_lowercase()),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => text_of(a).cmp(&text_of(b)),
    }
}

pub fn compare<T: ListEntity>(field: &str, direction: SortDirection, a: &T, b: &T) -> Ordering {
    let natural = compare_values(&a.sort_value(field), &b.sort_value(field));
    match direction {
        SortDirection::Asc => natural,
        SortDirection::Desc => natural.reverse(),
    }
}

pub fn sort_entities<T: ListEntity>(items: &mut [T], sort: &Sort) {
    items.sort_by(|a, b| compare(&sort.field, sort.direction, a, b));
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}
