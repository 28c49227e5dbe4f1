//! Composable `select` over the executions table.
//!
//! A [`QuerySpec`] is a plain value: conditions, ordering, limit and offset
//! are collected functionally and rendered once. Due-execution fetch, dead
//! execution detection and administrative listing are all variations of the
//! same filtered scan.

use chrono::{DateTime, SecondsFormat, Utc};

/// Positional parameter bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        SqlParam::Text(value.into())
    }

    pub fn opt_timestamp(value: Option<DateTime<Utc>>) -> Self {
        value.map(SqlParam::Timestamp).unwrap_or(SqlParam::Null)
    }

    pub fn opt_text(value: Option<&str>) -> Self {
        value.map(SqlParam::text).unwrap_or(SqlParam::Null)
    }
}

/// 0000-01-01T00:00:00Z in microseconds since the epoch.
pub const EARLIEST_STORABLE_MICROS: i64 = -62_167_219_200_000_000;

/// 9999-12-31T23:59:59.999999Z in microseconds since the epoch.
pub const LATEST_STORABLE_MICROS: i64 = 253_402_300_799_999_999;

/// Fixed-width UTC text so lexical order equals chronological order.
///
/// Only holds for [`is_storable`] instants: outside years 0..=9999 the year
/// gains a sign and extra digits.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// True when `instant` survives a [`format_instant`] round trip.
pub fn is_storable(instant: DateTime<Utc>) -> bool {
    (EARLIEST_STORABLE_MICROS..=LATEST_STORABLE_MICROS).contains(&instant.timestamp_micros())
}

/// Last instant the executions table can hold.
pub fn latest_storable_instant() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(LATEST_STORABLE_MICROS).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One `and`-joined predicate together with the values for its placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    fragment: String,
    params: Vec<SqlParam>,
}

impl Condition {
    pub fn new(fragment: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            fragment: fragment.into(),
            params,
        }
    }

    /// `<column> = ?`
    pub fn eq(column: &str, value: SqlParam) -> Self {
        Self::new(format!("{column} = ?"), vec![value])
    }

    /// `<column> <= ?`
    pub fn at_most(column: &str, value: SqlParam) -> Self {
        Self::new(format!("{column} <= ?"), vec![value])
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    table: String,
    conditions: Vec<Condition>,
    order_by: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    skip_locked: bool,
}

impl QuerySpec {
    pub fn select_from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            skip_locked: false,
        }
    }

    pub fn and_where(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Append `for update skip locked` so concurrent pollers on a store with
    /// row locks skip each other's candidates.
    pub fn skip_locked(mut self, enabled: bool) -> Self {
        self.skip_locked = enabled;
        self
    }

    pub fn render(&self) -> String {
        let mut sql = format!("select * from {}", self.table);
        if !self.conditions.is_empty() {
            let parts: Vec<&str> = self.conditions.iter().map(Condition::fragment).collect();
            sql.push_str(" where ");
            sql.push_str(&parts.join(" and "));
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(" order by ");
            sql.push_str(order_by);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" limit {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" offset {offset}"));
        }
        if self.skip_locked {
            sql.push_str(" for update skip locked");
        }
        sql
    }

    /// Parameters in placeholder order.
    pub fn params(&self) -> Vec<SqlParam> {
        self.conditions
            .iter()
            .flat_map(|c| c.params().iter().cloned())
            .collect()
    }
}
