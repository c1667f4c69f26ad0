//! Backend-agnostic query model
//!
//! - **AST**: [`Query`] builder, time windows, aggregations, fill policies
//! - **Conditions**: flat AND/OR-tagged predicates
//! - **Parser**: textual query language into the AST
//! - **Contracts**: [`Compiler`] / [`Executor`] traits every backend implements
//! - **Results**: the uniform [`QueryResult`] model parsers produce
//!
//! # Query Language
//!
//! ```text
//! SELECT field | agg(field) [AS alias] [, ...] FROM measurement
//! [WHERE cond [AND|OR cond]...]
//! [GROUP BY tag [, ...] [, time(5m)]]
//! [FILL(null|none|previous|linear|<number>)]
//! [ORDER BY field [ASC|DESC]]
//! [LIMIT n] [OFFSET n]
//! ```
//!
//! # Examples
//!
//! ## Using the builder
//!
//! ```rust,ignore
//! use tsbridge::query::{AggregateFunction, Compiler, Query};
//! use tsbridge::drivers::influxdb::FluxCompiler;
//!
//! let query = Query::new("cpu")
//!     .and_where("host", "=", "server01")
//!     .latest("1h")?
//!     .interval("5m")
//!     .aggregate(AggregateFunction::Mean, "usage");
//!
//! let flux = FluxCompiler::new("telemetry").compile(&query)?;
//! ```
//!
//! ## Using query text
//!
//! ```rust,ignore
//! let query = parse_query(
//!     "SELECT mean(usage) FROM cpu WHERE host = 'server01' AND time >= now() - 1h GROUP BY time(5m)"
//! )?;
//! ```

mod ast;
mod condition;
mod duration;
mod error;
mod executor;
mod parser;
mod result;

pub use ast::{
    AggregateFunction, Aggregation, FillPolicy, Having, MathExpression, MetadataQuery, Query,
    SortDirection, TimeSpec, WILDCARD,
};
pub use condition::{Condition, ConditionValue, IntoOperator, LogicalType, Operator, Scalar};
pub use duration::{DurationUnit, RelativeDuration};
pub use error::{CompileResult, QueryError};
pub use executor::{CompiledQuery, Compiler, Executor};
pub use parser::{parse_condition, parse_query};
pub use result::{LabelResult, Metadata, Point, QueryResult, Series, TimeSeriesResult};

/// Group a flat condition sequence into AND-joined groups of OR-joined
/// conditions.
///
/// A new group starts at every AND-tagged condition; OR-tagged conditions
/// join the group of the condition before them. The tag of the first
/// condition is irrelevant.
pub(crate) fn condition_groups(conditions: &[Condition]) -> Vec<Vec<&Condition>> {
    let mut groups: Vec<Vec<&Condition>> = Vec::new();
    for condition in conditions {
        match (condition.logical(), groups.last_mut()) {
            (LogicalType::Or, Some(group)) => group.push(condition),
            _ => groups.push(vec![condition]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_groups() {
        let conditions = vec![
            Condition::and("a", Operator::Eq, 1),
            Condition::or("b", Operator::Eq, 2),
            Condition::and("c", Operator::Eq, 3),
            Condition::or("d", Operator::Eq, 4),
            Condition::or("e", Operator::Eq, 5),
        ];

        let groups = condition_groups(&conditions);
        let fields: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|c| c.field()).collect())
            .collect();
        assert_eq!(fields, vec![vec!["a", "b"], vec!["c", "d", "e"]]);
    }

    #[test]
    fn test_leading_or_starts_group() {
        let conditions = vec![Condition::or("a", Operator::Eq, 1)];
        assert_eq!(condition_groups(&conditions).len(), 1);
    }
}
