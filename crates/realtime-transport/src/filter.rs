use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

/// Row filter in `column=op.value` form, e.g. `user_id=eq.42` or `status=in.(draft,done)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    column: String,
    op: FilterOp,
    operand: String,
}

impl RowFilter {
    pub fn parse(expr: &str) -> TransportResult<Self> {
        let invalid = || TransportError::InvalidFilter(expr.to_string());
        let (column, rest) = expr.trim().split_once('=').ok_or_else(invalid)?;
        let (op, operand) = rest.split_once('.').ok_or_else(invalid)?;
        let column = column.trim();
        if column.is_empty() {
            return Err(invalid());
        }
        let op = FilterOp::parse(op.trim()).ok_or_else(invalid)?;
        if op == FilterOp::In && !(operand.starts_with('(') && operand.ends_with(')')) {
            return Err(invalid());
        }
        Ok(Self {
            column: column.to_string(),
            op,
            operand: operand.to_string(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> FilterOp {
        self.op
    }

    pub fn matches(&self, record: &Value) -> bool {
        let Some(value) = record.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => compare(value, &self.operand) == Some(Ordering::Equal),
            FilterOp::Neq => compare(value, &self.operand) != Some(Ordering::Equal),
            FilterOp::Gt => compare(value, &self.operand) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(value, &self.operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(value, &self.operand) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(value, &self.operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => self.operand[1..self.operand.len() - 1]
                .split(',')
                .any(|candidate| compare(value, candidate.trim()) == Some(Ordering::Equal)),
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.operand)
    }
}

fn compare(value: &Value, operand: &str) -> Option<Ordering> {
    match value {
        Value::Number(number) => {
            let lhs = number.as_f64()?;
            let rhs: f64 = operand.parse().ok()?;
            lhs.partial_cmp(&rhs)
        }
        Value::String(text) => Some(text.as_str().cmp(operand)),
        Value::Bool(flag) => operand.parse::<bool>().ok().map(|rhs| flag.cmp(&rhs)),
        Value::Null => (operand == "null").then_some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["user_id", "user_id=42", "=eq.1", "user_id=like.%a%", "id=in.1,2"] {
            assert!(RowFilter::parse(expr).is_err(), "{expr} should be rejected");
        }
    }

    #[test]
    fn numeric_and_string_comparisons() {
        let record = json!({"user_id": 42, "status": "done", "reps": 8});
        assert!(RowFilter::parse("user_id=eq.42").unwrap().matches(&record));
        assert!(!RowFilter::parse("user_id=eq.7").unwrap().matches(&record));
        assert!(RowFilter::parse("reps=gte.8").unwrap().matches(&record));
        assert!(RowFilter::parse("reps=lt.10").unwrap().matches(&record));
        assert!(RowFilter::parse("status=neq.draft").unwrap().matches(&record));
        assert!(RowFilter::parse("status=in.(draft, done)").unwrap().matches(&record));
    }

    #[test]
    fn missing_column_never_matches() {
        let filter = RowFilter::parse("user_id=eq.42").unwrap();
        assert!(!filter.matches(&json!({"id": 1})));
    }

    #[test]
    fn display_round_trips_expression() {
        let filter = RowFilter::parse(" user_id=eq.42").unwrap();
        assert_eq!(filter.to_string(), "user_id=eq.42");
    }
}
