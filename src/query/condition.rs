//! Condition model
//!
//! A condition is an immutable `field op value` predicate tagged AND or OR.
//! Queries hold a flat sequence of them; there is no nested boolean tree,
//! each compiler groups the sequence according to the per-item tags.

use crate::query::error::{CompileResult, QueryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Regex,
    NotRegex,
}

impl Operator {
    /// Canonical token for this operator
    pub fn token(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Between => "BETWEEN",
            Self::Regex => "REGEX",
            Self::NotRegex => "NOT REGEX",
        }
    }

    /// Operators whose value must be an array
    pub fn requires_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::Between)
    }

    /// Plain binary comparison operators
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Neq | Self::Gt | Self::Gte | Self::Lt | Self::Lte
        )
    }
}

impl std::str::FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('_', " ");
        let normalized: Vec<&str> = normalized.split_whitespace().collect();

        match normalized.join(" ").as_str() {
            "=" | "==" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Neq),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            "IN" => Ok(Self::In),
            "NOT IN" => Ok(Self::NotIn),
            "BETWEEN" => Ok(Self::Between),
            "REGEX" | "=~" => Ok(Self::Regex),
            "NOT REGEX" | "!~" => Ok(Self::NotRegex),
            _ => Err(QueryError::InvalidOperator(s.to_string())),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Anything the builder accepts as an operator: the enum itself or its token.
pub trait IntoOperator {
    fn into_operator(self) -> CompileResult<Operator>;
}

impl IntoOperator for Operator {
    fn into_operator(self) -> CompileResult<Operator> {
        Ok(self)
    }
}

impl IntoOperator for &str {
    fn into_operator(self) -> CompileResult<Operator> {
        self.parse()
    }
}

impl IntoOperator for String {
    fn into_operator(self) -> CompileResult<Operator> {
        self.parse()
    }
}

/// How a condition joins the one before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalType {
    And,
    Or,
}

/// A single literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    String(String),
}

impl Scalar {
    /// Value as used inside path- and label-based backends
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339(),
            Self::String(s) => s.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident via $conv:expr),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(v: $ty) -> Self {
                    Scalar::$variant($conv(v))
                }
            }

            impl From<$ty> for ConditionValue {
                fn from(v: $ty) -> Self {
                    ConditionValue::Scalar(Scalar::from(v))
                }
            }
        )*
    };
}

scalar_from! {
    &str => String via |v: &str| v.to_string(),
    String => String via |v: String| v,
    bool => Bool via |v: bool| v,
    i32 => Integer via |v: i32| v as i64,
    i64 => Integer via |v: i64| v,
    u32 => Integer via |v: u32| v as i64,
    f64 => Float via |v: f64| v,
    DateTime<Utc> => Timestamp via |v: DateTime<Utc>| v,
}

/// Scalar or array value of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl ConditionValue {
    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Scalar]> {
        match self {
            Self::Scalar(_) => None,
            Self::List(items) => Some(items),
        }
    }
}

impl From<Scalar> for ConditionValue {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl<T: Into<Scalar>> From<Vec<T>> for ConditionValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Scalar>, const N: usize> From<[T; N]> for ConditionValue {
    fn from(items: [T; N]) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

/// A filter predicate in the WHERE clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    field: String,
    operator: Operator,
    value: ConditionValue,
    logical: LogicalType,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<ConditionValue>,
        logical: LogicalType,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            logical,
        }
    }

    /// AND-tagged condition
    pub fn and(field: impl Into<String>, operator: Operator, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, operator, value, LogicalType::And)
    }

    /// OR-tagged condition
    pub fn or(field: impl Into<String>, operator: Operator, value: impl Into<ConditionValue>) -> Self {
        Self::new(field, operator, value, LogicalType::Or)
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn value(&self) -> &ConditionValue {
        &self.value
    }

    pub fn logical(&self) -> LogicalType {
        self.logical
    }

    /// Conditions on the reserved `time` field
    pub fn is_time(&self) -> bool {
        self.field == "time"
    }

    /// Check that the value shape matches the operator.
    ///
    /// `IN`/`NOT IN` need an array, `BETWEEN` exactly two bounds, regex
    /// operators a string pattern, everything else a scalar.
    pub fn check_shape(&self) -> CompileResult<()> {
        let unsupported = |reason: &str| QueryError::UnsupportedValue {
            field: self.field.clone(),
            reason: reason.to_string(),
        };

        match (self.operator, &self.value) {
            (Operator::Between, ConditionValue::List(items)) if items.len() != 2 => Err(unsupported(
                &format!("BETWEEN needs exactly two bounds, got {}", items.len()),
            )),
            (op, ConditionValue::Scalar(_)) if op.requires_list() => {
                Err(unsupported(&format!("{} needs an array value", op)))
            }
            (op, ConditionValue::List(_)) if !op.requires_list() => {
                Err(unsupported(&format!("{} needs a scalar value", op)))
            }
            (Operator::Regex | Operator::NotRegex, ConditionValue::Scalar(s)) if s.as_str().is_none() => {
                Err(unsupported("regex pattern must be a string"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_tokens_normalize() {
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("<>".parse::<Operator>().unwrap(), Operator::Neq);
        assert_eq!("regex".parse::<Operator>().unwrap(), Operator::Regex);
        assert_eq!("NOT_IN".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("not  in".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("!~".parse::<Operator>().unwrap(), Operator::NotRegex);
        assert!(matches!(
            "LIKE".parse::<Operator>(),
            Err(QueryError::InvalidOperator(_))
        ));
    }

    #[test]
    fn test_requires_list() {
        assert!(Operator::In.requires_list());
        assert!(Operator::NotIn.requires_list());
        assert!(Operator::Between.requires_list());
        assert!(!Operator::Regex.requires_list());
        assert!(!Operator::Eq.requires_list());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(
            ConditionValue::from("a"),
            ConditionValue::Scalar(Scalar::String("a".into()))
        );
        assert_eq!(
            ConditionValue::from(vec![1, 2]),
            ConditionValue::List(vec![Scalar::Integer(1), Scalar::Integer(2)])
        );
        assert_eq!(
            ConditionValue::from(["a", "b"]).as_list().map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn test_check_shape() {
        assert!(Condition::and("host", Operator::Eq, "a").check_shape().is_ok());
        assert!(Condition::and("host", Operator::In, vec!["a"]).check_shape().is_ok());
        assert!(Condition::and("host", Operator::In, "a").check_shape().is_err());
        assert!(Condition::and("host", Operator::Eq, vec!["a"]).check_shape().is_err());
        assert!(Condition::and("v", Operator::Between, vec![1]).check_shape().is_err());
        assert!(Condition::and("v", Operator::Between, vec![1, 5]).check_shape().is_ok());
        assert!(Condition::and("host", Operator::Regex, 5).check_shape().is_err());
    }

    #[test]
    fn test_logical_tags() {
        let c = Condition::or("host", Operator::Eq, "a");
        assert_eq!(c.logical(), LogicalType::Or);
        assert!(!c.is_time());
        assert!(Condition::and("time", Operator::Gte, 0).is_time());
    }
}
