//! Choice rule parsing and evaluation.
//!
//! A Choice state holds an ordered list of rules. Each rule is a boolean
//! condition plus the name of the state to go to when it holds:
//!
//! ```json
//! {
//!   "And": [
//!     {"Variable": "$.amount", "NumericGreaterThan": 100},
//!     {"Not": {"Variable": "$.approved", "BooleanEquals": false}}
//!   ],
//!   "Next": "Review"
//! }
//! ```
//!
//! Leaf comparisons never raise errors. A missing variable or an operand of
//! the wrong type makes the comparison false.

use crate::error::CoreError;
use crate::path::JsonPath;
use chrono::{DateTime, FixedOffset};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Comparison operators of the States language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    StringEquals,
    StringLessThan,
    StringGreaterThan,
    StringLessThanEquals,
    StringGreaterThanEquals,
    StringMatches,
    NumericEquals,
    NumericLessThan,
    NumericGreaterThan,
    NumericLessThanEquals,
    NumericGreaterThanEquals,
    BooleanEquals,
    TimestampEquals,
    TimestampLessThan,
    TimestampGreaterThan,
    TimestampLessThanEquals,
    TimestampGreaterThanEquals,
    IsPresent,
    IsNull,
    IsString,
    IsNumeric,
    IsBoolean,
    IsTimestamp,
}

const OPERATORS: &[(&str, ComparisonOperator)] = &[
    ("StringEquals", ComparisonOperator::StringEquals),
    ("StringLessThan", ComparisonOperator::StringLessThan),
    ("StringGreaterThan", ComparisonOperator::StringGreaterThan),
    ("StringLessThanEquals", ComparisonOperator::StringLessThanEquals),
    ("StringGreaterThanEquals", ComparisonOperator::StringGreaterThanEquals),
    ("StringMatches", ComparisonOperator::StringMatches),
    ("NumericEquals", ComparisonOperator::NumericEquals),
    ("NumericLessThan", ComparisonOperator::NumericLessThan),
    ("NumericGreaterThan", ComparisonOperator::NumericGreaterThan),
    ("NumericLessThanEquals", ComparisonOperator::NumericLessThanEquals),
    ("NumericGreaterThanEquals", ComparisonOperator::NumericGreaterThanEquals),
    ("BooleanEquals", ComparisonOperator::BooleanEquals),
    ("TimestampEquals", ComparisonOperator::TimestampEquals),
    ("TimestampLessThan", ComparisonOperator::TimestampLessThan),
    ("TimestampGreaterThan", ComparisonOperator::TimestampGreaterThan),
    ("TimestampLessThanEquals", ComparisonOperator::TimestampLessThanEquals),
    ("TimestampGreaterThanEquals", ComparisonOperator::TimestampGreaterThanEquals),
    ("IsPresent", ComparisonOperator::IsPresent),
    ("IsNull", ComparisonOperator::IsNull),
    ("IsString", ComparisonOperator::IsString),
    ("IsNumeric", ComparisonOperator::IsNumeric),
    ("IsBoolean", ComparisonOperator::IsBoolean),
    ("IsTimestamp", ComparisonOperator::IsTimestamp),
];

impl ComparisonOperator {
    /// Looks up an operator by its field name. The second value is true for
    /// the `...Path` form, whose operand is a path instead of a literal.
    pub fn from_field(field: &str) -> Option<(Self, bool)> {
        let (name, is_path) = match field.strip_suffix("Path") {
            Some(base) => (base, true),
            None => (field, false),
        };
        let op = OPERATORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| *op)?;
        if is_path && (op.is_type_test() || op == ComparisonOperator::StringMatches) {
            return None;
        }
        Some((op, is_path))
    }

    pub fn name(&self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(n, _)| *n)
            .unwrap_or("Unknown")
    }

    /// Returns true for the `Is*` family.
    pub fn is_type_test(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::IsPresent
                | ComparisonOperator::IsNull
                | ComparisonOperator::IsString
                | ComparisonOperator::IsNumeric
                | ComparisonOperator::IsBoolean
                | ComparisonOperator::IsTimestamp
        )
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(JsonPath),
}

/// A boolean condition over the state data.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        variable: JsonPath,
        operator: ComparisonOperator,
        operand: Operand,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// A top-level Choice rule: a condition and the state it selects.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

impl ChoiceRule {
    /// Parses a top-level rule, which must carry `Next`.
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        let condition = Condition::parse(value)?;
        let next = value
            .get("Next")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::definition("choice rule is missing 'Next'"))?;
        Ok(Self {
            condition,
            next: next.to_string(),
        })
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.condition.evaluate(data)
    }

    /// Like [`matches`](Self::matches), resolving `$$.` paths against the
    /// context object.
    pub fn matches_with_context(&self, data: &Value, context: &Value) -> bool {
        self.condition.evaluate_with_context(data, context)
    }
}

impl Condition {
    /// Parses a condition from its JSON form.
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::definition("choice rule must be an object"))?;

        if let Some(operands) = obj.get("And") {
            return Ok(Condition::And(parse_operands("And", operands)?));
        }
        if let Some(operands) = obj.get("Or") {
            return Ok(Condition::Or(parse_operands("Or", operands)?));
        }
        if let Some(inner) = obj.get("Not") {
            return Ok(Condition::Not(Box::new(Condition::parse(inner)?)));
        }

        let variable = obj
            .get("Variable")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::definition("choice rule is missing 'Variable'"))?;
        let variable = JsonPath::parse(variable)?;

        let mut found = None;
        for (field, v) in obj {
            if matches!(field.as_str(), "Variable" | "Next" | "Comment") {
                continue;
            }
            let Some((operator, is_path)) = ComparisonOperator::from_field(field) else {
                return Err(CoreError::definition(format!(
                    "unknown comparison operator '{}'",
                    field
                )));
            };
            if found.is_some() {
                return Err(CoreError::definition(
                    "choice rule must have exactly one comparison operator",
                ));
            }
            found = Some((operator, parse_operand(operator, is_path, field, v)?));
        }

        let (operator, operand) = found.ok_or_else(|| {
            CoreError::definition(format!(
                "choice rule on '{}' has no comparison operator",
                variable
            ))
        })?;

        Ok(Condition::Compare {
            variable,
            operator,
            operand,
        })
    }

    /// Evaluates the condition against the data. Context paths are missing.
    pub fn evaluate(&self, data: &Value) -> bool {
        self.evaluate_with_context(data, &Value::Null)
    }

    /// Evaluates the condition, resolving `$$.` paths against `context`.
    pub fn evaluate_with_context(&self, data: &Value, context: &Value) -> bool {
        match self {
            Condition::Compare {
                variable,
                operator,
                operand,
            } => {
                let value = variable.resolve(data, context);
                let expected = match operand {
                    Operand::Literal(v) => Some(v),
                    Operand::Path(p) => p.resolve(data, context),
                };
                compare(*operator, value, expected)
            }
            Condition::And(operands) => operands
                .iter()
                .all(|c| c.evaluate_with_context(data, context)),
            Condition::Or(operands) => operands
                .iter()
                .any(|c| c.evaluate_with_context(data, context)),
            Condition::Not(inner) => !inner.evaluate_with_context(data, context),
        }
    }
}

fn parse_operands(name: &str, value: &Value) -> Result<Vec<Condition>, CoreError> {
    let items = value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| CoreError::definition(format!("'{}' needs a non-empty array", name)))?;
    items.iter().map(Condition::parse).collect()
}

fn parse_operand(
    operator: ComparisonOperator,
    is_path: bool,
    field: &str,
    value: &Value,
) -> Result<Operand, CoreError> {
    if is_path {
        let path = value
            .as_str()
            .ok_or_else(|| CoreError::definition(format!("'{}' must be a path string", field)))?;
        return Ok(Operand::Path(JsonPath::parse(path)?));
    }

    let well_typed = match operator {
        op if op.is_type_test() => value.is_boolean(),
        ComparisonOperator::BooleanEquals => value.is_boolean(),
        ComparisonOperator::StringMatches => value.is_string(),
        _ => true,
    };
    if !well_typed {
        return Err(CoreError::definition(format!(
            "'{}' has an operand of the wrong type",
            field
        )));
    }

    Ok(Operand::Literal(value.clone()))
}

/// Evaluates one condition against the data.
pub fn evaluate_rule(condition: &Condition, data: &Value) -> bool {
    condition.evaluate(data)
}

/// Returns the `Next` of the first rule that holds, in declaration order.
pub fn evaluate_choice_rules<'a>(rules: &'a [ChoiceRule], data: &Value) -> Option<&'a str> {
    evaluate_choice_rules_with_context(rules, data, &Value::Null)
}

/// First-match evaluation with `$$.` paths resolved against `context`.
pub fn evaluate_choice_rules_with_context<'a>(
    rules: &'a [ChoiceRule],
    data: &Value,
    context: &Value,
) -> Option<&'a str> {
    rules
        .iter()
        .find(|rule| rule.matches_with_context(data, context))
        .map(|rule| rule.next.as_str())
}

fn compare(op: ComparisonOperator, value: Option<&Value>, expected: Option<&Value>) -> bool {
    use ComparisonOperator::*;

    if op.is_type_test() {
        let Some(Value::Bool(wanted)) = expected else {
            return false;
        };
        let holds = match op {
            IsPresent => value.is_some(),
            IsNull => matches!(value, Some(Value::Null)),
            IsString => matches!(value, Some(Value::String(_))),
            // serde_json keeps booleans apart from numbers
            IsNumeric => matches!(value, Some(Value::Number(_))),
            IsBoolean => matches!(value, Some(Value::Bool(_))),
            IsTimestamp => value.and_then(as_timestamp).is_some(),
            _ => false,
        };
        return holds == *wanted;
    }

    let (Some(value), Some(expected)) = (value, expected) else {
        return false;
    };

    match op {
        StringEquals | StringLessThan | StringGreaterThan | StringLessThanEquals
        | StringGreaterThanEquals => match (value, expected) {
            (Value::String(a), Value::String(b)) => ordering_holds(op, a.cmp(b)),
            _ => false,
        },
        StringMatches => match (value, expected) {
            (Value::String(a), Value::String(pattern)) => wildcard_match(pattern, a),
            _ => false,
        },
        NumericEquals | NumericLessThan | NumericGreaterThan | NumericLessThanEquals
        | NumericGreaterThanEquals => match (value, expected) {
            (Value::Number(a), Value::Number(b)) => compare_numbers(a, b)
                .map(|ord| ordering_holds(op, ord))
                .unwrap_or(false),
            _ => false,
        },
        BooleanEquals => match (value, expected) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        },
        TimestampEquals | TimestampLessThan | TimestampGreaterThan | TimestampLessThanEquals
        | TimestampGreaterThanEquals => match (as_timestamp(value), as_timestamp(expected)) {
            (Some(a), Some(b)) => ordering_holds(op, a.cmp(&b)),
            _ => false,
        },
        _ => false,
    }
}

fn ordering_holds(op: ComparisonOperator, ord: Ordering) -> bool {
    use ComparisonOperator::*;

    match op {
        StringEquals | NumericEquals | TimestampEquals => ord == Ordering::Equal,
        StringLessThan | NumericLessThan | TimestampLessThan => ord == Ordering::Less,
        StringGreaterThan | NumericGreaterThan | TimestampGreaterThan => ord == Ordering::Greater,
        StringLessThanEquals | NumericLessThanEquals | TimestampLessThanEquals => {
            ord != Ordering::Greater
        }
        StringGreaterThanEquals | NumericGreaterThanEquals | TimestampGreaterThanEquals => {
            ord != Ordering::Less
        }
        _ => false,
    }
}

/// Compares two JSON numbers by value, exactly when both are integers.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return Some(x.cmp(&y));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn as_timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

/// Matches `text` against a pattern where `*` is any run of characters and
/// `\*` / `\\` are literal.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    #[derive(PartialEq)]
    enum Token {
        Star,
        Char(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Token::Char(escaped)),
                None => tokens.push(Token::Char('\\')),
            },
            '*' => tokens.push(Token::Star),
            other => tokens.push(Token::Char(other)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match tokens.get(p) {
            Some(Token::Star) => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(Token::Char(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    tokens[p..].iter().all(|tok| *tok == Token::Star)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rule(value: Value) -> ChoiceRule {
        ChoiceRule::parse(&value).unwrap()
    }

    fn cond(value: Value) -> Condition {
        Condition::parse(&value).unwrap()
    }

    #[test]
    fn test_context_variable_resolves_against_context() {
        let rules = vec![
            rule(json!({"Variable": "$$.Execution.Name", "StringEquals": "nightly", "Next": "Batch"})),
            rule(json!({"Variable": "$.kind", "StringEqualsPath": "$$.Execution.Input.kind", "Next": "Same"})),
        ];
        let context = json!({"Execution": {"Name": "nightly", "Input": {"kind": "a"}}});
        assert_eq!(
            evaluate_choice_rules_with_context(&rules, &json!({}), &context),
            Some("Batch")
        );

        let other = json!({"Execution": {"Name": "adhoc", "Input": {"kind": "a"}}});
        assert_eq!(
            evaluate_choice_rules_with_context(&rules, &json!({"kind": "a"}), &other),
            Some("Same")
        );

        // A data document shaped like the context does not satisfy a context path.
        let lookalike = json!({"Execution": {"Name": "nightly"}});
        assert_eq!(evaluate_choice_rules(&rules, &lookalike), None);
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule(json!({"Variable": "$.x", "NumericGreaterThan": 0, "Next": "First"})),
            rule(json!({"Variable": "$.x", "NumericGreaterThan": -10, "Next": "Second"})),
        ];
        assert_eq!(evaluate_choice_rules(&rules, &json!({"x": 5})), Some("First"));
        assert_eq!(evaluate_choice_rules(&rules, &json!({"x": -5})), Some("Second"));
        assert_eq!(evaluate_choice_rules(&rules, &json!({"x": -50})), None);
    }

    #[test]
    fn test_is_numeric_rejects_booleans() {
        let c = cond(json!({"Variable": "$.v", "IsNumeric": true}));
        assert!(!c.evaluate(&json!({"v": true})));
        assert!(c.evaluate(&json!({"v": 42})));
        assert!(c.evaluate(&json!({"v": 4.2})));
        assert!(!c.evaluate(&json!({"v": "42"})));
    }

    #[test]
    fn test_type_tests_invert() {
        let present = cond(json!({"Variable": "$.v", "IsPresent": true}));
        let absent = cond(json!({"Variable": "$.v", "IsPresent": false}));
        assert!(present.evaluate(&json!({"v": null})));
        assert!(!present.evaluate(&json!({})));
        assert!(absent.evaluate(&json!({})));

        let not_null = cond(json!({"Variable": "$.v", "IsNull": false}));
        assert!(not_null.evaluate(&json!({"v": 1})));
        assert!(!not_null.evaluate(&json!({"v": null})));

        let is_string = cond(json!({"Variable": "$.v", "IsString": true}));
        assert!(is_string.evaluate(&json!({"v": ""})));
        assert!(!is_string.evaluate(&json!({"v": 1})));

        let is_bool = cond(json!({"Variable": "$.v", "IsBoolean": true}));
        assert!(is_bool.evaluate(&json!({"v": false})));
        assert!(!is_bool.evaluate(&json!({"v": 0})));

        let is_ts = cond(json!({"Variable": "$.v", "IsTimestamp": true}));
        assert!(is_ts.evaluate(&json!({"v": "2024-01-01T00:00:00Z"})));
        assert!(!is_ts.evaluate(&json!({"v": "yesterday"})));
    }

    #[test]
    fn test_string_operators() {
        let eq = cond(json!({"Variable": "$.s", "StringEquals": "abc"}));
        assert!(eq.evaluate(&json!({"s": "abc"})));
        assert!(!eq.evaluate(&json!({"s": "abd"})));
        assert!(!eq.evaluate(&json!({"s": 5})));
        assert!(!eq.evaluate(&json!({})));

        let lt = cond(json!({"Variable": "$.s", "StringLessThan": "m"}));
        assert!(lt.evaluate(&json!({"s": "a"})));
        assert!(!lt.evaluate(&json!({"s": "z"})));

        let ge = cond(json!({"Variable": "$.s", "StringGreaterThanEquals": "m"}));
        assert!(ge.evaluate(&json!({"s": "m"})));
        assert!(ge.evaluate(&json!({"s": "n"})));
    }

    #[test]
    fn test_string_matches() {
        let c = cond(json!({"Variable": "$.f", "StringMatches": "log-*.txt"}));
        assert!(c.evaluate(&json!({"f": "log-2024.txt"})));
        assert!(c.evaluate(&json!({"f": "log-.txt"})));
        assert!(!c.evaluate(&json!({"f": "log-2024.csv"})));

        let escaped = cond(json!({"Variable": "$.f", "StringMatches": "a\\*b"}));
        assert!(escaped.evaluate(&json!({"f": "a*b"})));
        assert!(!escaped.evaluate(&json!({"f": "axxb"})));

        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*a*b*", "xxaxxbxx"));
        assert!(!wildcard_match("a*b", "ab c"));
    }

    #[test]
    fn test_numeric_int_float_by_value() {
        let c = cond(json!({"Variable": "$.n", "NumericEquals": 5}));
        assert!(c.evaluate(&json!({"n": 5.0})));
        assert!(c.evaluate(&json!({"n": 5})));
        assert!(!c.evaluate(&json!({"n": "5"})));
        assert!(!c.evaluate(&json!({"n": true})));

        let le = cond(json!({"Variable": "$.n", "NumericLessThanEquals": 2.5}));
        assert!(le.evaluate(&json!({"n": 2})));
        assert!(le.evaluate(&json!({"n": 2.5})));
        assert!(!le.evaluate(&json!({"n": 3})));
    }

    #[test]
    fn test_boolean_equals_is_strict() {
        let c = cond(json!({"Variable": "$.b", "BooleanEquals": true}));
        assert!(c.evaluate(&json!({"b": true})));
        assert!(!c.evaluate(&json!({"b": 1})));
        assert!(!c.evaluate(&json!({"b": "true"})));
    }

    #[test]
    fn test_timestamp_comparison() {
        let c = cond(json!({
            "Variable": "$.t",
            "TimestampGreaterThan": "2024-01-01T00:00:00Z"
        }));
        assert!(c.evaluate(&json!({"t": "2024-06-01T00:00:00Z"})));
        assert!(!c.evaluate(&json!({"t": "2023-06-01T00:00:00Z"})));
        // Same instant in another offset.
        let eq = cond(json!({
            "Variable": "$.t",
            "TimestampEquals": "2024-01-01T00:00:00Z"
        }));
        assert!(eq.evaluate(&json!({"t": "2024-01-01T02:00:00+02:00"})));
    }

    #[test]
    fn test_path_operand() {
        let c = cond(json!({"Variable": "$.a", "NumericGreaterThanPath": "$.b"}));
        assert!(c.evaluate(&json!({"a": 3, "b": 2})));
        assert!(!c.evaluate(&json!({"a": 1, "b": 2})));
        assert!(!c.evaluate(&json!({"a": 1})));
    }

    #[test]
    fn test_combinators_nest() {
        let c = cond(json!({
            "Or": [
                {"And": [
                    {"Variable": "$.a", "BooleanEquals": true},
                    {"Not": {"Variable": "$.b", "StringEquals": "x"}}
                ]},
                {"Variable": "$.c", "IsPresent": true}
            ]
        }));
        assert!(c.evaluate(&json!({"a": true, "b": "y"})));
        assert!(!c.evaluate(&json!({"a": true, "b": "x"})));
        assert!(c.evaluate(&json!({"a": false, "c": 0})));
        assert!(!c.evaluate(&json!({"a": false})));
    }

    #[test]
    fn test_missing_variable_never_errors() {
        let c = cond(json!({"Variable": "$.deep.path[3]", "NumericLessThan": 1}));
        assert!(!evaluate_rule(&c, &json!({"deep": {"path": [1]}})));
        assert!(!evaluate_rule(&c, &json!("scalar")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse(&json!({"Variable": "$.a"})).is_err());
        assert!(Condition::parse(&json!({"Variable": "$.a", "Bogus": 1})).is_err());
        assert!(Condition::parse(&json!({"Variable": "$.a", "IsNull": "yes"})).is_err());
        assert!(Condition::parse(&json!({"And": []})).is_err());
        assert!(Condition::parse(&json!({
            "Variable": "$.a", "StringEquals": "x", "NumericEquals": 1
        }))
        .is_err());
        assert!(ChoiceRule::parse(&json!({"Variable": "$.a", "IsNull": true})).is_err());
        assert!(Condition::parse(&json!({"Variable": "$.a", "IsNullPath": "$.b"})).is_err());
    }

    #[test]
    fn test_operator_names_round_trip() {
        for (name, op) in OPERATORS {
            assert_eq!(op.name(), *name);
            assert_eq!(ComparisonOperator::from_field(name), Some((*op, false)));
        }
    }

    proptest! {
        #[test]
        fn prop_numeric_matches_f64_ordering(a in -1.0e6f64..1.0e6, b in -1.0e6f64..1.0e6) {
            let gt = cond(json!({"Variable": "$.v", "NumericGreaterThan": b}));
            let lt = cond(json!({"Variable": "$.v", "NumericLessThan": b}));
            let data = json!({"v": a});
            prop_assert_eq!(gt.evaluate(&data), a > b);
            prop_assert_eq!(lt.evaluate(&data), a < b);
        }

        #[test]
        fn prop_integer_equals_float(n in -100_000i64..100_000) {
            let c = cond(json!({"Variable": "$.v", "NumericEquals": n as f64}));
            let data = json!({"v": n});
            prop_assert!(c.evaluate(&data));
        }
    }
}
