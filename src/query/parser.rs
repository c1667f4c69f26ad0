//! Query Parser
//!
//! Parses query text into a [`Query`].
//!
//! # Supported Syntax
//!
//! ```text
//! SELECT [DISTINCT] field | agg(field) [AS alias] [, ...] FROM measurement
//! [WHERE cond [AND|OR cond]...]
//! [GROUP BY tag [, ...] [, time(5m)]]
//! [HAVING field op number]
//! [FILL(null|none|previous|linear|<number>)]
//! [ORDER BY field [ASC|DESC] [, ...]]
//! [LIMIT n] [OFFSET n]
//! ```
//!
//! Conditions:
//!
//! ```text
//! host = 'server01'            usage > 90
//! host IN ('a', 'b')           host NOT IN ('c')
//! usage BETWEEN 10 AND 20      host =~ /^web-/      host !~ /^db-/
//! time >= now() - 1h           time >= '2023-10-27T00:00:00Z'
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1, one_of},
    combinator::{map, map_res, opt, recognize, value},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::query::ast::{AggregateFunction, FillPolicy, Query, SortDirection};
use crate::query::condition::{Condition, ConditionValue, LogicalType, Operator, Scalar};
use crate::query::duration::RelativeDuration;
use crate::query::error::{CompileResult, QueryError};
use chrono::{DateTime, Utc};

/// Parse a query string into a Query AST
pub fn parse_query(input: &str) -> CompileResult<Query> {
    let input = input.trim();

    match parse_full_query(input) {
        Ok((remaining, query)) => {
            if remaining.trim().is_empty() {
                Ok(query)
            } else {
                Err(QueryError::Parse(format!(
                    "Unexpected input after query: '{}'",
                    remaining.trim()
                )))
            }
        }
        Err(e) => Err(QueryError::Parse(format!("{:?}", e))),
    }
}

/// Parse a single `field op value` condition (AND-tagged)
pub fn parse_condition(input: &str) -> CompileResult<Condition> {
    match parse_field_condition(input.trim()) {
        Ok((remaining, (field, op, value))) if remaining.trim().is_empty() => {
            Ok(Condition::new(field, op, value, LogicalType::And))
        }
        Ok((remaining, _)) => Err(QueryError::Parse(format!(
            "Unexpected input after condition: '{}'",
            remaining.trim()
        ))),
        Err(e) => Err(QueryError::Parse(format!("{:?}", e))),
    }
}

/// An item in the SELECT clause
#[derive(Debug, Clone, PartialEq)]
enum SelectItem {
    Wildcard,
    Field(String),
    Aggregate {
        function: AggregateFunction,
        field: String,
        alias: Option<String>,
    },
}

/// Condition in WHERE clause
#[derive(Debug, Clone, PartialEq)]
enum WhereItem {
    /// `time >= now() - 1h`
    Latest(RelativeDuration),
    /// `time >= '...'` / `time <= '...'`
    TimeBound(Operator, DateTime<Utc>),
    Filter(String, Operator, ConditionValue),
}

#[derive(Debug, Clone, PartialEq)]
enum GroupItem {
    Tag(String),
    Interval(String),
}

/// Parse the full query
fn parse_full_query(input: &str) -> IResult<&str, Query> {
    let (input, _) = multispace0(input)?;
    let (input, (distinct, select)) = parse_select_clause(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("FROM")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, measurement) = parse_identifier(input)?;
    let (input, where_items) = opt(preceded(multispace1, parse_where_clause))(input)?;
    let (input, group_by) = opt(preceded(multispace1, parse_group_by_clause))(input)?;
    let (input, having) = opt(preceded(multispace1, parse_having_clause))(input)?;
    let (input, fill) = opt(preceded(multispace1, parse_fill_clause))(input)?;
    let (input, order_by) = opt(preceded(multispace1, parse_order_by_clause))(input)?;
    let (input, limit) = opt(preceded(multispace1, parse_limit_clause))(input)?;
    let (input, offset) = opt(preceded(multispace1, parse_offset_clause))(input)?;
    let (input, _) = multispace0(input)?;

    let mut query = Query::new(measurement);

    // Plain fields go to the selection, aggregates to the aggregation list
    let mut fields = Vec::new();
    for item in select {
        match item {
            SelectItem::Wildcard => fields.push("*".to_string()),
            SelectItem::Field(f) => fields.push(f),
            SelectItem::Aggregate {
                function,
                field,
                alias,
            } => {
                query = match alias {
                    Some(alias) => query.aggregate_as(function, field, alias),
                    None => query.aggregate(function, field),
                };
            }
        }
    }
    query = query.select(fields);
    if distinct {
        query = query.distinct();
    }

    let mut start = None;
    let mut end = None;
    for (logical, item) in where_items.unwrap_or_default() {
        match item {
            WhereItem::Latest(d) => query = query.latest_duration(d),
            WhereItem::TimeBound(Operator::Gt | Operator::Gte, ts) => start = Some(ts),
            WhereItem::TimeBound(op @ (Operator::Lt | Operator::Lte), ts) => end = Some((op, ts)),
            WhereItem::TimeBound(op, ts) => {
                query = query.condition(Condition::new("time", op, ts, logical));
            }
            WhereItem::Filter(field, op, value) => {
                query = query.condition(Condition::new(field, op, value, logical));
            }
        }
    }
    match (start, end) {
        (Some(start), end) => {
            let end = end.map(|(_, ts)| ts).unwrap_or_else(Utc::now);
            query = query.time_range(start, end);
        }
        // An upper bound alone stays a plain condition on `time`
        (None, Some((op, end))) => {
            query = query.condition(Condition::new("time", op, end, LogicalType::And));
        }
        (None, None) => {}
    }

    for item in group_by.unwrap_or_default() {
        query = match item {
            GroupItem::Tag(tag) => query.group_by(tag),
            GroupItem::Interval(interval) => query.interval(interval),
        };
    }

    if let Some((field, op, value)) = having {
        query = query.having(field, op, value);
    }
    if let Some(fill) = fill {
        query = query.fill(fill);
    }
    for (field, direction) in order_by.unwrap_or_default() {
        query = query.order_by(field, direction);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    if let Some(offset) = offset {
        query = query.offset(offset);
    }

    Ok((input, query))
}

/// Parse SELECT clause
fn parse_select_clause(input: &str) -> IResult<&str, (bool, Vec<SelectItem>)> {
    let (input, _) = tag_no_case("SELECT")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, distinct) = opt(pair(tag_no_case("DISTINCT"), multispace1))(input)?;

    let (input, items) = separated_list1(
        delimited(multispace0, char(','), multispace0),
        parse_select_item,
    )(input)?;

    Ok((input, (distinct.is_some(), items)))
}

/// Parse a single SELECT item
fn parse_select_item(input: &str) -> IResult<&str, SelectItem> {
    alt((
        value(SelectItem::Wildcard, char('*')),
        parse_aggregated_item,
        map(parse_identifier, |f| SelectItem::Field(f.to_string())),
    ))(input)
}

/// Parse an aggregated item like mean(usage) AS avg_usage
fn parse_aggregated_item(input: &str) -> IResult<&str, SelectItem> {
    let (input, function) = map_res(parse_identifier, |name: &str| name.parse::<AggregateFunction>())(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, field) = alt((tag("*"), parse_identifier))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char(')')(input)?;
    let (input, alias) = opt(parse_alias)(input)?;

    Ok((
        input,
        SelectItem::Aggregate {
            function,
            field: field.to_string(),
            alias,
        },
    ))
}

/// Parse AS alias clause
fn parse_alias(input: &str) -> IResult<&str, String> {
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("AS")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, alias) = parse_identifier(input)?;
    Ok((input, alias.to_string()))
}

/// Parse WHERE clause
fn parse_where_clause(input: &str) -> IResult<&str, Vec<(LogicalType, WhereItem)>> {
    let (input, _) = tag_no_case("WHERE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, first) = parse_where_item(input)?;
    let (input, rest) = many0(pair(parse_connective, parse_where_item))(input)?;

    let mut items = vec![(LogicalType::And, first)];
    items.extend(rest);
    Ok((input, items))
}

/// Parse AND / OR between conditions
fn parse_connective(input: &str) -> IResult<&str, LogicalType> {
    delimited(
        multispace1,
        alt((
            value(LogicalType::And, tag_no_case("AND")),
            value(LogicalType::Or, tag_no_case("OR")),
        )),
        multispace1,
    )(input)
}

fn parse_where_item(input: &str) -> IResult<&str, WhereItem> {
    alt((
        map(parse_relative_time_condition, WhereItem::Latest),
        map(parse_absolute_time_condition, |(op, ts)| WhereItem::TimeBound(op, ts)),
        map(parse_field_condition, |(f, op, v)| WhereItem::Filter(f, op, v)),
    ))(input)
}

/// Parse time condition like "time >= now() - 7d"
fn parse_relative_time_condition(input: &str) -> IResult<&str, RelativeDuration> {
    let (input, _) = tag_no_case("time")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = alt((tag(">="), tag(">")))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = tag_no_case("now()")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('-')(input)?;
    let (input, _) = multispace0(input)?;
    parse_duration(input)
}

/// Parse time condition like "time >= '2023-10-27T00:00:00Z'"
fn parse_absolute_time_condition(input: &str) -> IResult<&str, (Operator, DateTime<Utc>)> {
    let (input, _) = tag_no_case("time")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = parse_operator(input)?;
    let (input, _) = multispace0(input)?;
    let (input, ts) = map_res(parse_quoted_string, |s| {
        DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc))
    })(input)?;
    Ok((input, (op, ts)))
}

/// Parse duration like "7d", "24h", "30m"
fn parse_duration(input: &str) -> IResult<&str, RelativeDuration> {
    map_res(recognize(pair(digit1, one_of("smhdwy"))), RelativeDuration::parse)(input)
}

/// Parse a `field <op> value` condition
fn parse_field_condition(input: &str) -> IResult<&str, (String, Operator, ConditionValue)> {
    let (input, field) = parse_identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, (op, value)) = alt((
        parse_in_tail,
        parse_between_tail,
        parse_regex_tail,
        parse_comparison_tail,
    ))(input)?;
    Ok((input, (field.to_string(), op, value)))
}

/// `IN (...)` / `NOT IN (...)`
fn parse_in_tail(input: &str) -> IResult<&str, (Operator, ConditionValue)> {
    let (input, op) = alt((
        value(
            Operator::NotIn,
            tuple((tag_no_case("NOT"), multispace1, tag_no_case("IN"))),
        ),
        value(Operator::In, tag_no_case("IN")),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, items) = delimited(
        pair(char('('), multispace0),
        separated_list1(delimited(multispace0, char(','), multispace0), parse_literal),
        pair(multispace0, char(')')),
    )(input)?;
    Ok((input, (op, ConditionValue::List(items))))
}

/// `BETWEEN low AND high`
fn parse_between_tail(input: &str) -> IResult<&str, (Operator, ConditionValue)> {
    let (input, _) = tag_no_case("BETWEEN")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, low) = parse_literal(input)?;
    let (input, _) = delimited(multispace1, tag_no_case("AND"), multispace1)(input)?;
    let (input, high) = parse_literal(input)?;
    Ok((input, (Operator::Between, ConditionValue::List(vec![low, high]))))
}

/// `=~ /re/` / `!~ /re/`
fn parse_regex_tail(input: &str) -> IResult<&str, (Operator, ConditionValue)> {
    let (input, op) = alt((
        value(Operator::Regex, tag("=~")),
        value(Operator::NotRegex, tag("!~")),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, pattern) = alt((
        delimited(char('/'), take_while(|c| c != '/'), char('/')),
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
    ))(input)?;
    Ok((input, (op, ConditionValue::Scalar(Scalar::String(pattern.to_string())))))
}

fn parse_comparison_tail(input: &str) -> IResult<&str, (Operator, ConditionValue)> {
    let (input, op) = parse_operator(input)?;
    let (input, _) = multispace0(input)?;
    let (input, literal) = parse_literal(input)?;
    Ok((input, (op, ConditionValue::Scalar(literal))))
}

/// Parse GROUP BY clause
fn parse_group_by_clause(input: &str) -> IResult<&str, Vec<GroupItem>> {
    let (input, _) = tag_no_case("GROUP")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("BY")(input)?;
    let (input, _) = multispace1(input)?;

    separated_list1(
        delimited(multispace0, char(','), multispace0),
        alt((
            map(
                delimited(
                    pair(tag_no_case("time"), char('(')),
                    recognize(pair(digit1, one_of("smhdwy"))),
                    char(')'),
                ),
                |i: &str| GroupItem::Interval(i.to_string()),
            ),
            map(parse_identifier, |t| GroupItem::Tag(t.to_string())),
        )),
    )(input)
}

/// Parse HAVING clause (single comparison)
fn parse_having_clause(input: &str) -> IResult<&str, (String, Operator, Scalar)> {
    let (input, _) = tag_no_case("HAVING")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, field) = parse_identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = parse_operator(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = parse_number(input)?;
    Ok((input, (field.to_string(), op, value)))
}

/// Parse FILL(...)
fn parse_fill_clause(input: &str) -> IResult<&str, FillPolicy> {
    let (input, _) = tag_no_case("FILL")(input)?;
    let (input, _) = multispace0(input)?;
    map_res(
        delimited(char('('), take_while1(|c| c != ')'), char(')')),
        |s: &str| s.parse::<FillPolicy>(),
    )(input)
}

/// Parse ORDER BY clause
fn parse_order_by_clause(input: &str) -> IResult<&str, Vec<(String, SortDirection)>> {
    let (input, _) = tag_no_case("ORDER")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("BY")(input)?;
    let (input, _) = multispace1(input)?;

    separated_list1(
        delimited(multispace0, char(','), multispace0),
        map(
            pair(
                parse_identifier,
                opt(preceded(
                    multispace1,
                    alt((
                        value(SortDirection::Asc, tag_no_case("ASC")),
                        value(SortDirection::Desc, tag_no_case("DESC")),
                    )),
                )),
            ),
            |(field, dir)| (field.to_string(), dir.unwrap_or(SortDirection::Asc)),
        ),
    )(input)
}

/// Parse LIMIT clause
fn parse_limit_clause(input: &str) -> IResult<&str, usize> {
    let (input, _) = tag_no_case("LIMIT")(input)?;
    let (input, _) = multispace1(input)?;
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

/// Parse OFFSET clause
fn parse_offset_clause(input: &str) -> IResult<&str, usize> {
    let (input, _) = tag_no_case("OFFSET")(input)?;
    let (input, _) = multispace1(input)?;
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

/// Parse comparison operator
fn parse_operator(input: &str) -> IResult<&str, Operator> {
    alt((
        value(Operator::Gte, tag(">=")),
        value(Operator::Lte, tag("<=")),
        value(Operator::Neq, alt((tag("!="), tag("<>")))),
        value(Operator::Gt, tag(">")),
        value(Operator::Lt, tag("<")),
        value(Operator::Eq, alt((tag("=="), tag("=")))),
    ))(input)
}

/// Parse identifier (measurement, field, tag key); double quotes allow
/// anything but a double quote
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while1(|c| c != '"'), char('"')),
        recognize(pair(
            take_while1(|c: char| c.is_alphabetic() || c == '_'),
            take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '.' || c == '-'),
        )),
    ))(input)
}

/// Parse a literal: quoted string, number, boolean or null
fn parse_literal(input: &str) -> IResult<&str, Scalar> {
    alt((
        map(parse_quoted_string, Scalar::String),
        value(Scalar::Bool(true), tag_no_case("true")),
        value(Scalar::Bool(false), tag_no_case("false")),
        value(Scalar::Null, tag_no_case("null")),
        parse_number,
    ))(input)
}

/// Parse quoted string
fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('\'')(input)?;
    let (input, content) = take_while(|c| c != '\'')(input)?;
    let (input, _) = char('\'')(input)?;
    Ok((input, content.to_string()))
}

/// Parse integer or floating point number
fn parse_number(input: &str) -> IResult<&str, Scalar> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: &str| {
            if s.contains('.') {
                s.parse::<f64>().map(Scalar::Float).map_err(|e| e.to_string())
            } else {
                s.parse::<i64>().map(Scalar::Integer).map_err(|e| e.to_string())
            }
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::TimeSpec;

    #[test]
    fn test_parse_simple_select() {
        let query = parse_query("SELECT usage FROM cpu").unwrap();
        assert_eq!(query.measurement(), "cpu");
        assert_eq!(query.fields(), &["usage".to_string()]);
        assert!(query.aggregations().is_empty());
    }

    #[test]
    fn test_parse_select_star() {
        let query = parse_query("SELECT * FROM cpu").unwrap();
        assert!(query.selects_all_fields());
    }

    #[test]
    fn test_parse_aggregations_with_alias() {
        let query = parse_query(
            "SELECT mean(usage) AS avg_usage, max(usage) FROM cpu GROUP BY time(5m)",
        )
        .unwrap();

        assert_eq!(query.aggregations().len(), 2);
        assert_eq!(query.aggregations()[0].function, AggregateFunction::Mean);
        assert_eq!(query.aggregations()[0].alias.as_deref(), Some("avg_usage"));
        assert_eq!(query.aggregations()[1].function, AggregateFunction::Max);
        assert_eq!(query.interval_str(), Some("5m"));
        // no plain fields selected -> wildcard
        assert!(query.selects_all_fields());
    }

    #[test]
    fn test_parse_where_latest() {
        let query = parse_query("SELECT usage FROM cpu WHERE time >= now() - 7d").unwrap();
        assert_eq!(query.relative_time().map(|d| d.to_string()), Some("7d".to_string()));
        assert!(query.conditions().is_empty());
    }

    #[test]
    fn test_parse_where_absolute_range() {
        let query = parse_query(
            "SELECT usage FROM cpu WHERE time >= '2023-10-27T00:00:00Z' AND time <= '2023-10-27T12:00:00Z'",
        )
        .unwrap();

        match query.time() {
            TimeSpec::Absolute { start, end } => {
                assert_eq!(start.timestamp(), 1_698_364_800);
                assert_eq!(end.timestamp(), 1_698_408_000);
            }
            other => panic!("expected absolute range, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_and_or_tags() {
        let query = parse_query(
            "SELECT usage FROM cpu WHERE host = 'a' OR host = 'b' AND region != 'eu'",
        )
        .unwrap();

        let c = query.conditions();
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].logical(), LogicalType::And);
        assert_eq!(c[1].logical(), LogicalType::Or);
        assert_eq!(c[2].logical(), LogicalType::And);
        assert_eq!(c[2].operator(), Operator::Neq);
    }

    #[test]
    fn test_parse_list_operators() {
        let query = parse_query(
            "SELECT usage FROM cpu WHERE host IN ('a', 'b') AND dc NOT IN ('x') AND usage BETWEEN 10 AND 20.5",
        )
        .unwrap();

        let c = query.conditions();
        assert_eq!(c[0].operator(), Operator::In);
        assert_eq!(c[0].value().as_list().map(|l| l.len()), Some(2));
        assert_eq!(c[1].operator(), Operator::NotIn);
        assert_eq!(c[2].operator(), Operator::Between);
        assert_eq!(
            c[2].value(),
            &ConditionValue::List(vec![Scalar::Integer(10), Scalar::Float(20.5)])
        );
    }

    #[test]
    fn test_parse_regex() {
        let query = parse_query("SELECT usage FROM cpu WHERE host =~ /^web-\\d+$/ AND dc !~ /eu/").unwrap();
        let c = query.conditions();
        assert_eq!(c[0].operator(), Operator::Regex);
        assert_eq!(c[0].value().as_scalar().and_then(Scalar::as_str), Some("^web-\\d+$"));
        assert_eq!(c[1].operator(), Operator::NotRegex);
    }

    #[test]
    fn test_parse_full_query() {
        let query = parse_query(
            "SELECT DISTINCT mean(usage) AS u FROM cpu WHERE host = 'a' AND time >= now() - 1h \
             GROUP BY host, region, time(1m) HAVING u > 50 FILL(previous) ORDER BY time DESC LIMIT 10 OFFSET 5",
        )
        .unwrap();

        assert!(query.is_distinct());
        assert_eq!(query.group_by_tags(), &["host".to_string(), "region".to_string()]);
        assert_eq!(query.interval_str(), Some("1m"));
        assert_eq!(query.having_clauses().len(), 1);
        assert_eq!(query.fill_policy(), Some(FillPolicy::Previous));
        assert_eq!(query.ordering(), &[("time".to_string(), SortDirection::Desc)]);
        assert_eq!(query.limit_value(), Some(10));
        assert_eq!(query.offset_value(), Some(5));
        assert!(query.validate().is_empty());
    }

    #[test]
    fn test_parse_case_insensitive() {
        let query = parse_query("select avg(usage) from cpu where time >= now() - 7d group by time(1h)").unwrap();
        assert_eq!(query.aggregations()[0].function, AggregateFunction::Mean);
        assert_eq!(query.interval_str(), Some("1h"));
    }

    #[test]
    fn test_parse_condition_helper() {
        let c = parse_condition("host != 'server01'").unwrap();
        assert_eq!(c.field(), "host");
        assert_eq!(c.operator(), Operator::Neq);
        assert!(parse_condition("host ?? 1").is_err());
    }

    #[test]
    fn test_parse_error_invalid_query() {
        assert!(parse_query("INVALID usage").is_err());
        assert!(parse_query("SELECT usage").is_err());
        assert!(parse_query("SELECT usage FROM cpu LIMIT ten").is_err());
    }
}
