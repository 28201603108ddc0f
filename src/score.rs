//! Grades extracted tool calls against a test case's expected calls.
//!
//! Each expected call is paired with at most one attempt of the same name
//! (maximum total credit for unordered expectations, an order-preserving
//! alignment for sequential ones). A pair's credit is the mean of its
//! argument credits:
//!
//! | argument                                   | credit |
//! |--------------------------------------------|--------|
//! | satisfies its matcher                      | 1.0    |
//! | string differing only in letter case       | 0.8    |
//! | present with the wrong value or type       | 0.3    |
//! | missing, but a similarly named key exists  | 0.2    |
//! | missing                                    | 0.0    |
//!
//! Strict cases give 0 for anything short of a satisfied matcher. The case
//! score is the summed pair credit divided by the number of required calls
//! plus any disallowed extra calls.

use std::{collections::BTreeMap, fmt, str::FromStr};

use evalexpr::{eval, Value as ExprValue};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{extract::ToolCallAttempt, suite::TestCase};

const CASE_ONLY_CREDIT: f64 = 0.8;
const WRONG_VALUE_CREDIT: f64 = 0.3;
const SIMILAR_KEY_CREDIT: f64 = 0.2;
const SIMILAR_KEY_RATIO: f64 = 0.7;
const EPSILON: f64 = 1e-9;
const MAX_EXACT_ASSIGNMENT_ATTEMPTS: usize = 12;

static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Basic,
    MultiTool,
    Complex,
    Context,
    Ambiguous,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Basic,
        Category::MultiTool,
        Category::Complex,
        Category::Context,
        Category::Ambiguous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Basic => "basic",
            Category::MultiTool => "multi_tool",
            Category::Complex => "complex",
            Category::Context => "context",
            Category::Ambiguous => "ambiguous",
        }
    }

    /// Categories scored against the partial-credit threshold by default.
    pub fn allows_partial_credit(&self) -> bool {
        matches!(self, Category::Ambiguous)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrder {
    #[default]
    Unordered,
    Sequential,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default)]
    pub calls: Vec<ExpectedCall>,
    #[serde(default)]
    pub order: CallOrder,
    #[serde(default)]
    pub strict: bool,
    /// Unset means extras are tolerated only in partial-credit categories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_extra: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Expectation {
    pub fn calls(calls: Vec<ExpectedCall>) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    pub fn sequential(mut self) -> Self {
        self.order = CallOrder::Sequential;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_allow_extra(mut self, allow: bool) -> Self {
        self.allow_extra = Some(allow);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Compiles every pattern and schema once so a broken suite fails at load time.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(threshold) = self.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(format!("threshold {threshold} is outside [0, 1]"));
            }
        }
        for call in &self.calls {
            for (argument, matcher) in &call.arguments {
                let ArgMatcher::Predicate(predicate) = matcher else {
                    continue;
                };
                match predicate {
                    Predicate::Regex(pattern) => {
                        Regex::new(pattern).map_err(|error| {
                            format!("{}.{argument}: invalid $regex: {error}", call.name)
                        })?;
                    }
                    Predicate::Schema(schema) => {
                        compile_schema(schema).map_err(|error| {
                            format!("{}.{argument}: invalid $schema: {error}", call.name)
                        })?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedCall {
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgMatcher>,
}

impl ExpectedCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, matcher: impl Into<ArgMatcher>) -> Self {
        self.arguments.insert(name.into(), matcher.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgMatcher {
    Predicate(Predicate),
    Exact(Value),
}

impl<'de> Deserialize<'de> for ArgMatcher {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let is_predicate = match &value {
            Value::Object(map) => map.len() == 1 && map.keys().all(|key| key.starts_with('$')),
            _ => false,
        };
        if is_predicate {
            serde_json::from_value(value)
                .map(ArgMatcher::Predicate)
                .map_err(D::Error::custom)
        } else {
            Ok(ArgMatcher::Exact(value))
        }
    }
}

impl From<Value> for ArgMatcher {
    fn from(value: Value) -> Self {
        ArgMatcher::Exact(value)
    }
}

impl From<&str> for ArgMatcher {
    fn from(value: &str) -> Self {
        ArgMatcher::Exact(Value::String(value.to_string()))
    }
}

impl From<Predicate> for ArgMatcher {
    fn from(predicate: Predicate) -> Self {
        ArgMatcher::Predicate(predicate)
    }
}

impl fmt::Display for ArgMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgMatcher::Exact(value) => write!(f, "{value}"),
            ArgMatcher::Predicate(Predicate::Regex(pattern)) => write!(f, "a match for /{pattern}/"),
            ArgMatcher::Predicate(Predicate::CaseInsensitive(text)) => {
                write!(f, "\"{text}\" (any case)")
            }
            ArgMatcher::Predicate(Predicate::Contains(text)) => write!(f, "text containing \"{text}\""),
            ArgMatcher::Predicate(Predicate::OneOf(values)) => {
                write!(f, "one of {}", Value::Array(values.clone()))
            }
            ArgMatcher::Predicate(Predicate::Range(range)) => match (range.min, range.max) {
                (Some(min), Some(max)) => write!(f, "a number in [{min}, {max}]"),
                (Some(min), None) => write!(f, "a number >= {min}"),
                (None, Some(max)) => write!(f, "a number <= {max}"),
                (None, None) => f.write_str("a number"),
            },
            ArgMatcher::Predicate(Predicate::Type(kind)) => write!(f, "a value of type {kind}"),
            ArgMatcher::Predicate(Predicate::Any(_)) => f.write_str("any non-null value"),
            ArgMatcher::Predicate(Predicate::Schema(_)) => f.write_str("a value matching the schema"),
            ArgMatcher::Predicate(Predicate::EvaluatesTo(target)) => {
                write!(f, "an expression evaluating to {target}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Unanchored search over a string argument.
    #[serde(rename = "$regex")]
    Regex(String),
    #[serde(rename = "$ci")]
    CaseInsensitive(String),
    #[serde(rename = "$contains")]
    Contains(String),
    #[serde(rename = "$one_of")]
    OneOf(Vec<Value>),
    #[serde(rename = "$range")]
    Range(NumericRange),
    #[serde(rename = "$type")]
    Type(JsonType),
    #[serde(rename = "$any")]
    Any(bool),
    /// Draft 7 JSON Schema.
    #[serde(rename = "$schema")]
    Schema(Value),
    #[serde(rename = "$evaluates_to")]
    EvaluatesTo(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl JsonType {
    fn of(value: &Value) -> JsonType {
        match value {
            Value::String(_) => JsonType::String,
            Value::Number(number) if number.is_i64() || number.is_u64() => JsonType::Integer,
            Value::Number(_) => JsonType::Number,
            Value::Bool(_) => JsonType::Boolean,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
            Value::Null => JsonType::Null,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Number => value.is_number(),
            JsonType::Integer => value
                .as_f64()
                .is_some_and(|number| number.fract() == 0.0),
            other => *other == JsonType::of(value),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Array => "array",
            JsonType::Object => "object",
            JsonType::Null => "null",
        };
        f.write_str(label)
    }
}

/// Why a case lost credit (or, in `notes`, a deviation that was tolerated).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    NoToolCall {
        expected: usize,
    },
    MissingCall {
        name: String,
    },
    UnexpectedCall {
        name: String,
    },
    WrongArgument {
        call: String,
        argument: String,
        expected: String,
        actual: Value,
        detail: Option<String>,
    },
    MissingArgument {
        call: String,
        argument: String,
        similar: Option<String>,
    },
    UnexpectedArgument {
        call: String,
        argument: String,
    },
    TypeMismatch {
        call: String,
        argument: String,
        expected: String,
        actual: String,
    },
    OutOfOrder {
        name: String,
        expected_position: usize,
        actual_position: usize,
    },
    BelowThreshold {
        score: f64,
        threshold: f64,
    },
    TemplateSyntax {
        message: String,
    },
    RequestTimeout {
        after_ms: u64,
    },
    Transport {
        message: String,
    },
    Aborted {
        message: String,
    },
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::NoToolCall { expected } => {
                write!(f, "no tool call found (expected {expected})")
            }
            Reason::MissingCall { name } => write!(f, "missing call: {name}"),
            Reason::UnexpectedCall { name } => write!(f, "unexpected call: {name}"),
            Reason::WrongArgument {
                call,
                argument,
                expected,
                actual,
                detail,
            } => {
                write!(f, "{call}.{argument}: expected {expected}, got {actual}")?;
                if let Some(detail) = detail {
                    write!(f, " ({detail})")?;
                }
                Ok(())
            }
            Reason::MissingArgument {
                call,
                argument,
                similar,
            } => match similar {
                Some(similar) => write!(f, "{call}.{argument}: missing (found similar key '{similar}')"),
                None => write!(f, "{call}.{argument}: missing"),
            },
            Reason::UnexpectedArgument { call, argument } => {
                write!(f, "{call}.{argument}: unexpected argument")
            }
            Reason::TypeMismatch {
                call,
                argument,
                expected,
                actual,
            } => write!(f, "{call}.{argument}: expected a {expected}, got a {actual}"),
            Reason::OutOfOrder {
                name,
                expected_position,
                actual_position,
            } => write!(
                f,
                "{name} out of order: expected at position {expected_position}, found at {actual_position}"
            ),
            Reason::BelowThreshold { score, threshold } => {
                write!(f, "score {score:.2} below threshold {threshold:.2}")
            }
            Reason::TemplateSyntax { message } => write!(f, "template error: {message}"),
            Reason::RequestTimeout { after_ms } => write!(f, "request timed out after {after_ms} ms"),
            Reason::Transport { message } => write!(f, "request failed: {message}"),
            Reason::Aborted { message } => write!(f, "evaluation aborted: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub case_id: String,
    pub passed: bool,
    pub score: f64,
    /// Empty exactly when `passed`.
    pub reasons: Vec<Reason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Reason>,
}

impl ScoreResult {
    /// Worst score for a case that never produced output to grade.
    pub fn failed(case_id: impl Into<String>, reason: Reason) -> Self {
        Self {
            case_id: case_id.into(),
            passed: false,
            score: 0.0,
            reasons: vec![reason],
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scorer {
    /// Pass mark for partial-credit categories without an explicit threshold.
    pub partial_threshold: f64,
}

impl Default for Scorer {
    fn default() -> Self {
        Self {
            partial_threshold: 0.5,
        }
    }
}

impl Scorer {
    pub fn new(partial_threshold: f64) -> Self {
        Self { partial_threshold }
    }

    pub fn score(&self, case: &TestCase, attempts: &[ToolCallAttempt]) -> ScoreResult {
        self.score_expectation(&case.id, case.category, &case.expect, attempts)
    }

    pub fn threshold_for(&self, category: Category, expect: &Expectation) -> f64 {
        match expect.threshold {
            Some(threshold) => threshold,
            None if expect.strict => 1.0,
            None if category.allows_partial_credit() => self.partial_threshold,
            None => 1.0,
        }
        .clamp(0.0, 1.0)
    }

    pub fn score_expectation(
        &self,
        case_id: &str,
        category: Category,
        expect: &Expectation,
        attempts: &[ToolCallAttempt],
    ) -> ScoreResult {
        let allow_extra = expect
            .allow_extra
            .unwrap_or_else(|| category.allows_partial_credit());
        let threshold = self.threshold_for(category, expect);

        let mut reasons = Vec::new();
        let mut notes = Vec::new();

        let pairs: Vec<Vec<Option<PairScore>>> = expect
            .calls
            .iter()
            .map(|expected| {
                attempts
                    .iter()
                    .map(|attempt| {
                        (attempt.name == expected.name)
                            .then(|| score_pair(expected, attempt, expect.strict))
                    })
                    .collect()
            })
            .collect();
        let credits: Vec<Vec<Option<f64>>> = pairs
            .iter()
            .map(|row| row.iter().map(|pair| pair.as_ref().map(|p| p.credit)).collect())
            .collect();

        let assignment = match expect.order {
            CallOrder::Unordered => assign_unordered(&credits, attempts.len()),
            CallOrder::Sequential => assign_sequential(&credits, attempts.len()),
        };

        let mut consumed = vec![false; attempts.len()];
        for index in assignment.iter().flatten() {
            consumed[*index] = true;
        }

        if attempts.is_empty() && !expect.calls.is_empty() {
            reasons.push(Reason::NoToolCall {
                expected: expect.calls.len(),
            });
        }

        let mut credit = 0.0;
        for (position, (expected, assigned)) in expect.calls.iter().zip(&assignment).enumerate() {
            match assigned {
                Some(index) => {
                    if let Some(pair) = &pairs[position][*index] {
                        credit += pair.credit;
                        reasons.extend(pair.reasons.iter().cloned());
                        notes.extend(pair.notes.iter().cloned());
                    }
                }
                None if attempts.is_empty() => {}
                None => {
                    let displaced = (expect.order == CallOrder::Sequential)
                        .then(|| {
                            attempts.iter().enumerate().position(|(index, attempt)| {
                                !consumed[index] && attempt.name == expected.name
                            })
                        })
                        .flatten();
                    match displaced {
                        Some(index) => {
                            consumed[index] = true;
                            reasons.push(Reason::OutOfOrder {
                                name: expected.name.clone(),
                                expected_position: position,
                                actual_position: index,
                            });
                        }
                        None => reasons.push(Reason::MissingCall {
                            name: expected.name.clone(),
                        }),
                    }
                }
            }
        }

        let mut penalized_extras = 0usize;
        for (index, attempt) in attempts.iter().enumerate() {
            if consumed[index] {
                continue;
            }
            let reason = Reason::UnexpectedCall {
                name: attempt.name.clone(),
            };
            if allow_extra {
                notes.push(reason);
            } else {
                penalized_extras += 1;
                reasons.push(reason);
            }
        }

        let denominator = expect.calls.len() + penalized_extras;
        let score = if denominator == 0 {
            1.0
        } else {
            (credit / denominator as f64).clamp(0.0, 1.0)
        };
        let passed = score + EPSILON >= threshold;

        if passed {
            notes.append(&mut reasons);
        } else if reasons.is_empty() {
            reasons.push(Reason::BelowThreshold { score, threshold });
        }

        ScoreResult {
            case_id: case_id.to_string(),
            passed,
            score,
            reasons,
            notes,
        }
    }
}

#[derive(Debug, Clone)]
struct PairScore {
    credit: f64,
    reasons: Vec<Reason>,
    notes: Vec<Reason>,
}

enum Verdict {
    Satisfied,
    CaseOnly,
    Wrong(Option<String>),
    TypeMismatch(String),
}

fn score_pair(expected: &ExpectedCall, attempt: &ToolCallAttempt, strict: bool) -> PairScore {
    let mut reasons = Vec::new();
    let mut notes = Vec::new();
    let mut total = 0.0;

    for (argument, matcher) in &expected.arguments {
        let credit = match attempt.arguments.get(argument) {
            Some(actual) => match check(matcher, actual) {
                Verdict::Satisfied => 1.0,
                Verdict::CaseOnly => {
                    reasons.push(Reason::WrongArgument {
                        call: expected.name.clone(),
                        argument: argument.clone(),
                        expected: matcher.to_string(),
                        actual: actual.clone(),
                        detail: Some("differs only in letter case".to_string()),
                    });
                    CASE_ONLY_CREDIT
                }
                Verdict::Wrong(detail) => {
                    reasons.push(Reason::WrongArgument {
                        call: expected.name.clone(),
                        argument: argument.clone(),
                        expected: matcher.to_string(),
                        actual: actual.clone(),
                        detail,
                    });
                    WRONG_VALUE_CREDIT
                }
                Verdict::TypeMismatch(expected_type) => {
                    reasons.push(Reason::TypeMismatch {
                        call: expected.name.clone(),
                        argument: argument.clone(),
                        expected: expected_type,
                        actual: JsonType::of(actual).to_string(),
                    });
                    WRONG_VALUE_CREDIT
                }
            },
            None => {
                let similar = similar_key(argument, &attempt.arguments, &expected.arguments);
                let credit = if similar.is_some() { SIMILAR_KEY_CREDIT } else { 0.0 };
                reasons.push(Reason::MissingArgument {
                    call: expected.name.clone(),
                    argument: argument.clone(),
                    similar,
                });
                credit
            }
        };
        total += if strict && credit < 1.0 { 0.0 } else { credit };
    }

    let mut credit = if expected.arguments.is_empty() {
        1.0
    } else {
        total / expected.arguments.len() as f64
    };

    for key in attempt.arguments.keys() {
        if expected.arguments.contains_key(key) {
            continue;
        }
        let reason = Reason::UnexpectedArgument {
            call: expected.name.clone(),
            argument: key.clone(),
        };
        if strict {
            credit = 0.0;
            reasons.push(reason);
        } else {
            notes.push(reason);
        }
    }

    PairScore {
        credit,
        reasons,
        notes,
    }
}

fn similar_key(
    wanted: &str,
    actual: &Map<String, Value>,
    expected: &BTreeMap<String, ArgMatcher>,
) -> Option<String> {
    let wanted = wanted.to_lowercase();
    actual
        .keys()
        .filter(|key| !expected.contains_key(*key))
        .map(|key| (key, strsim::normalized_levenshtein(&wanted, &key.to_lowercase())))
        .filter(|(key, ratio)| {
            *ratio >= SIMILAR_KEY_RATIO
                || key.to_lowercase().contains(&wanted)
                || wanted.contains(&key.to_lowercase())
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(key, _)| key.clone())
}

fn check(matcher: &ArgMatcher, actual: &Value) -> Verdict {
    match matcher {
        ArgMatcher::Exact(expected) => compare_exact(expected, actual),
        ArgMatcher::Predicate(predicate) => check_predicate(predicate, actual),
    }
}

fn compare_exact(expected: &Value, actual: &Value) -> Verdict {
    if values_equal(expected, actual) {
        return Verdict::Satisfied;
    }
    match (expected, actual) {
        (Value::String(expected), Value::String(actual)) => {
            if expected.to_lowercase() == actual.to_lowercase() {
                Verdict::CaseOnly
            } else {
                Verdict::Wrong(None)
            }
        }
        (expected, actual) if JsonType::of(expected) != JsonType::of(actual)
            && !(expected.is_number() && actual.is_number()) =>
        {
            Verdict::TypeMismatch(JsonType::of(expected).to_string())
        }
        _ => Verdict::Wrong(None),
    }
}

fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < EPSILON,
            _ => a == b,
        },
        _ => expected == actual,
    }
}

fn check_predicate(predicate: &Predicate, actual: &Value) -> Verdict {
    match predicate {
        Predicate::Regex(pattern) => {
            let Some(text) = actual.as_str() else {
                return Verdict::TypeMismatch("string".to_string());
            };
            match Regex::new(pattern) {
                Ok(regex) if regex.is_match(text) => Verdict::Satisfied,
                Ok(_) => Verdict::Wrong(None),
                Err(error) => Verdict::Wrong(Some(format!("invalid pattern: {error}"))),
            }
        }
        Predicate::CaseInsensitive(expected) => match actual.as_str() {
            Some(text) if text.to_lowercase() == expected.to_lowercase() => Verdict::Satisfied,
            Some(_) => Verdict::Wrong(None),
            None => Verdict::TypeMismatch("string".to_string()),
        },
        Predicate::Contains(needle) => match actual.as_str() {
            Some(text) if text.contains(needle.as_str()) => Verdict::Satisfied,
            Some(text) if text.to_lowercase().contains(&needle.to_lowercase()) => {
                Verdict::CaseOnly
            }
            Some(_) => Verdict::Wrong(None),
            None => Verdict::TypeMismatch("string".to_string()),
        },
        Predicate::OneOf(options) => {
            let verdicts: Vec<Verdict> = options
                .iter()
                .map(|option| compare_exact(option, actual))
                .collect();
            if verdicts.iter().any(|v| matches!(v, Verdict::Satisfied)) {
                Verdict::Satisfied
            } else if verdicts.iter().any(|v| matches!(v, Verdict::CaseOnly)) {
                Verdict::CaseOnly
            } else {
                Verdict::Wrong(None)
            }
        }
        Predicate::Range(range) => {
            let Some(number) = actual.as_f64() else {
                return Verdict::TypeMismatch("number".to_string());
            };
            let above = range.min.map_or(true, |min| number >= min);
            let below = range.max.map_or(true, |max| number <= max);
            if above && below {
                Verdict::Satisfied
            } else {
                Verdict::Wrong(None)
            }
        }
        Predicate::Type(kind) => {
            if kind.matches(actual) {
                Verdict::Satisfied
            } else {
                Verdict::TypeMismatch(kind.to_string())
            }
        }
        Predicate::Any(_) => {
            if actual.is_null() {
                Verdict::Wrong(Some("value is null".to_string()))
            } else {
                Verdict::Satisfied
            }
        }
        Predicate::Schema(schema) => match compile_schema(schema) {
            Ok(compiled) => match compiled.validate(actual) {
                Ok(()) => Verdict::Satisfied,
                Err(mut errors) => Verdict::Wrong(errors.next().map(|error| error.to_string())),
            },
            Err(error) => Verdict::Wrong(Some(format!("invalid schema: {error}"))),
        },
        Predicate::EvaluatesTo(target) => {
            let value = match actual {
                Value::Number(number) => number.as_f64(),
                Value::String(expression) => evaluate_expression(expression),
                _ => return Verdict::TypeMismatch("string".to_string()),
            };
            match value {
                Some(value) if (value - target).abs() < 1e-6 => Verdict::Satisfied,
                Some(value) => Verdict::Wrong(Some(format!("evaluates to {value}"))),
                None => Verdict::Wrong(Some("expression could not be evaluated".to_string())),
            }
        }
    }
}

fn compile_schema(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|error| error.to_string())
}

/// Models write arithmetic the way people do; map the common spellings onto
/// evalexpr's syntax before evaluating. Integer literals become floats so
/// `7/2` is 3.5.
fn evaluate_expression(expression: &str) -> Option<f64> {
    let normalized = expression
        .replace('×', "*")
        .replace('÷', "/")
        .replace("**", "^")
        .replace("math::sqrt(", "sqrt(")
        .replace("math.sqrt(", "sqrt(")
        .replace("sqrt(", "math::sqrt(");
    let normalized = RE_NUMBER.replace_all(&normalized, |captures: &Captures| {
        let literal = &captures[0];
        if literal.contains('.') {
            literal.to_string()
        } else {
            format!("{literal}.0")
        }
    });
    let value = eval(&normalized).ok()?;
    match value {
        ExprValue::Int(v) => Some(v as f64),
        ExprValue::Float(v) => Some(v),
        _ => None,
    }
}

/// Maximum-credit matching of expected calls to attempts: exhaustive search
/// for small inputs, Kuhn-Munkres beyond that.
fn assign_unordered(credits: &[Vec<Option<f64>>], attempts: usize) -> Vec<Option<usize>> {
    if attempts > MAX_EXACT_ASSIGNMENT_ATTEMPTS {
        return assign_hungarian(credits, attempts);
    }

    let expected = credits.len();
    let masks = 1usize << attempts;
    // best[i][mask]: highest credit for expected calls i.. with `mask` attempts taken.
    let mut best = vec![vec![0.0f64; masks]; expected + 1];
    for i in (0..expected).rev() {
        for mask in 0..masks {
            let mut value = best[i + 1][mask];
            for (j, credit) in credits[i].iter().enumerate() {
                if let Some(credit) = credit {
                    if mask & (1 << j) == 0 {
                        value = value.max(credit + best[i + 1][mask | (1 << j)]);
                    }
                }
            }
            best[i][mask] = value;
        }
    }

    let mut assignment = Vec::with_capacity(expected);
    let mut mask = 0usize;
    for i in 0..expected {
        let chosen = credits[i].iter().enumerate().find_map(|(j, credit)| {
            let credit = (*credit)?;
            let free = mask & (1 << j) == 0;
            (free && credit + best[i + 1][mask | (1 << j)] + EPSILON >= best[i][mask]).then_some(j)
        });
        if let Some(j) = chosen {
            mask |= 1 << j;
        }
        assignment.push(chosen);
    }
    assignment
}

/// Name matches that earn no credit are paired up after the weighted
/// assignment, so they still count as the expected call being attempted.
fn assign_hungarian(credits: &[Vec<Option<f64>>], attempts: usize) -> Vec<Option<usize>> {
    let weights: Vec<Vec<f64>> = credits
        .iter()
        .map(|row| row.iter().map(|credit| credit.unwrap_or(0.0)).collect())
        .collect();

    let mut used = vec![false; attempts];
    let mut assignment: Vec<Option<usize>> = max_weight_matching(&weights, attempts)
        .into_iter()
        .zip(credits)
        .map(|(column, row)| {
            let column = column.filter(|j| row[*j].is_some())?;
            used[column] = true;
            Some(column)
        })
        .collect();

    for (row, slot) in credits.iter().zip(assignment.iter_mut()) {
        if slot.is_some() {
            continue;
        }
        if let Some(j) = (0..attempts).find(|j| !used[*j] && row[*j].is_some()) {
            used[j] = true;
            *slot = Some(j);
        }
    }
    assignment
}

/// Kuhn-Munkres over the square padding of `weights` (rows by `columns`).
/// Returns the column matched to each row, `None` for padding.
fn max_weight_matching(weights: &[Vec<f64>], columns: usize) -> Vec<Option<usize>> {
    let rows = weights.len();
    let size = rows.max(columns);
    let cost = |i: usize, j: usize| {
        if i < rows && j < columns {
            -weights[i][j]
        } else {
            0.0
        }
    };

    // 1-based potentials; p[j] is the row matched to column j, 0 when free.
    let mut u = vec![0.0f64; size + 1];
    let mut v = vec![0.0f64; size + 1];
    let mut p = vec![0usize; size + 1];
    let mut way = vec![0usize; size + 1];
    for i in 1..=size {
        p[0] = i;
        let mut j0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; size + 1];
        let mut visited = vec![false; size + 1];
        loop {
            visited[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=size {
                if visited[j] {
                    continue;
                }
                let slack = cost(i0 - 1, j - 1) - u[i0] - v[j];
                if slack < min_slack[j] {
                    min_slack[j] = slack;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }
            for j in 0..=size {
                if visited[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut matched = vec![None; rows];
    for j in 1..=size {
        let i = p[j];
        if i >= 1 && i <= rows && j <= columns {
            matched[i - 1] = Some(j - 1);
        }
    }
    matched
}

/// Order-preserving alignment with maximum total credit.
fn assign_sequential(credits: &[Vec<Option<f64>>], attempts: usize) -> Vec<Option<usize>> {
    let expected = credits.len();
    let mut best = vec![vec![0.0f64; attempts + 1]; expected + 1];
    for i in (0..expected).rev() {
        for j in (0..attempts).rev() {
            let mut value = best[i + 1][j].max(best[i][j + 1]);
            if let Some(credit) = credits[i][j] {
                value = value.max(credit + best[i + 1][j + 1]);
            }
            best[i][j] = value;
        }
    }

    let mut assignment = vec![None; expected];
    let (mut i, mut j) = (0usize, 0usize);
    while i < expected && j < attempts {
        match credits[i][j] {
            Some(credit) if credit + best[i + 1][j + 1] + EPSILON >= best[i][j] => {
                assignment[i] = Some(j);
                i += 1;
                j += 1;
            }
            _ if best[i][j + 1] + EPSILON >= best[i][j] => j += 1,
            _ => i += 1,
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Provenance;
    use serde_json::json;

    fn attempt(name: &str, arguments: Value) -> ToolCallAttempt {
        ToolCallAttempt {
            name: name.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            provenance: Provenance::Native { index: 0 },
        }
    }

    fn weather(location: &str) -> Expectation {
        Expectation::calls(vec![
            ExpectedCall::new("get_weather").with_argument("location", location)
        ])
    }

    fn score(category: Category, expect: &Expectation, attempts: &[ToolCallAttempt]) -> ScoreResult {
        Scorer::default().score_expectation("case", category, expect, attempts)
    }

    #[test]
    fn exact_call_passes_with_full_credit() {
        let result = score(
            Category::Basic,
            &weather("Boston"),
            &[attempt("get_weather", json!({"location": "Boston"}))],
        );
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn letter_case_difference_fails_exact_match() {
        let result = score(
            Category::Basic,
            &weather("Boston"),
            &[attempt("get_weather", json!({"location": "boston"}))],
        );
        assert!(!result.passed);
        assert!((result.score - 0.8).abs() < 1e-9);
        assert!(matches!(result.reasons[0], Reason::WrongArgument { .. }));
    }

    #[test]
    fn wrong_tool_name_earns_nothing() {
        let result = score(
            Category::Basic,
            &weather("Boston"),
            &[attempt("search_web", json!({"location": "Boston"}))],
        );
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result
            .reasons
            .contains(&Reason::MissingCall { name: "get_weather".to_string() }));
        assert!(result
            .reasons
            .contains(&Reason::UnexpectedCall { name: "search_web".to_string() }));
    }

    #[test]
    fn no_tool_call_is_reported() {
        let result = score(Category::Basic, &weather("Boston"), &[]);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.reasons, vec![Reason::NoToolCall { expected: 1 }]);
    }

    #[test]
    fn argument_credit_ladder() {
        let expect = Expectation::calls(vec![ExpectedCall::new("get_weather")
            .with_argument("location", "Paris")
            .with_argument("unit", "fahrenheit")]);

        let wrong_value = score(
            Category::Basic,
            &expect,
            &[attempt("get_weather", json!({"location": "Paris", "unit": "celsius"}))],
        );
        assert!((wrong_value.score - 0.65).abs() < 1e-9);

        let similar_key = score(
            Category::Basic,
            &expect,
            &[attempt("get_weather", json!({"location": "Paris", "units": "fahrenheit"}))],
        );
        assert!((similar_key.score - 0.6).abs() < 1e-9);
        assert!(similar_key.reasons.contains(&Reason::MissingArgument {
            call: "get_weather".to_string(),
            argument: "unit".to_string(),
            similar: Some("units".to_string()),
        }));

        let strict = score(
            Category::Basic,
            &expect.clone().strict(),
            &[attempt("get_weather", json!({"location": "Paris", "unit": "Fahrenheit"}))],
        );
        assert!((strict.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unordered_scoring_ignores_attempt_order() {
        let expect = Expectation::calls(vec![
            ExpectedCall::new("get_weather").with_argument("location", "Paris"),
            ExpectedCall::new("get_weather").with_argument("location", "London"),
        ]);
        let forward = [
            attempt("get_weather", json!({"location": "Paris"})),
            attempt("get_weather", json!({"location": "London"})),
        ];
        let backward = [forward[1].clone(), forward[0].clone()];

        let a = score(Category::MultiTool, &expect, &forward);
        let b = score(Category::MultiTool, &expect, &backward);
        assert!(a.passed && b.passed);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn sequential_scoring_flags_order() {
        let expect = Expectation::calls(vec![
            ExpectedCall::new("get_weather"),
            ExpectedCall::new("search_web"),
        ])
        .sequential();
        let in_order = [attempt("get_weather", json!({})), attempt("search_web", json!({}))];
        let reversed = [in_order[1].clone(), in_order[0].clone()];

        assert!(score(Category::Complex, &expect, &in_order).passed);
        let result = score(Category::Complex, &expect, &reversed);
        assert!(!result.passed);
        assert_eq!(result.score, 0.5);
        assert!(result
            .reasons
            .iter()
            .any(|reason| matches!(reason, Reason::OutOfOrder { .. })));
    }

    #[test]
    fn extras_fail_unless_allowed() {
        let attempts = [
            attempt("get_weather", json!({"location": "Boston"})),
            attempt("search_web", json!({"query": "Boston"})),
        ];
        let strict_extras = score(Category::Basic, &weather("Boston"), &attempts);
        assert!(!strict_extras.passed);
        assert_eq!(strict_extras.score, 0.5);

        let allowed = score(
            Category::Basic,
            &weather("Boston").with_allow_extra(true),
            &attempts,
        );
        assert!(allowed.passed);
        assert!(allowed.reasons.is_empty());
        assert_eq!(allowed.notes.len(), 1);
    }

    #[test]
    fn ambiguous_category_accepts_partial_credit() {
        let result = score(
            Category::Ambiguous,
            &weather("Springfield"),
            &[attempt("get_weather", json!({"location": "springfield"}))],
        );
        assert!(result.passed);
        assert!(result.reasons.is_empty());
        assert!(!result.notes.is_empty());
    }

    #[test]
    fn predicates_from_yaml() {
        let expect: Expectation = serde_yaml::from_str(
            r#"
calls:
  - name: calculate
    arguments:
      expression: { $evaluates_to: 37 }
  - name: get_weather
    arguments:
      location: { $regex: "(?i)^new york" }
      unit: { $one_of: [celsius, fahrenheit] }
  - name: search_web
    arguments:
      query: { $contains: "AI" }
      num_results: { $range: { min: 1, max: 10 } }
"#,
        )
        .unwrap();
        expect.validate().unwrap();

        let attempts = [
            attempt("calculate", json!({"expression": "sqrt(144) + 25"})),
            attempt("get_weather", json!({"location": "New York City", "unit": "celsius"})),
            attempt("search_web", json!({"query": "latest AI news", "num_results": 5})),
        ];
        let result = score(Category::Complex, &expect, &attempts);
        assert!(result.passed, "{:?}", result.reasons);
    }

    #[test]
    fn schema_and_type_predicates() {
        let expect = Expectation::calls(vec![ExpectedCall::new("search_web")
            .with_argument("query", Predicate::Type(JsonType::String))
            .with_argument(
                "num_results",
                Predicate::Schema(json!({"type": "integer", "minimum": 1})),
            )]);
        let ok = score(
            Category::Basic,
            &expect,
            &[attempt("search_web", json!({"query": "x", "num_results": 3}))],
        );
        assert!(ok.passed);

        let bad = score(
            Category::Basic,
            &expect,
            &[attempt("search_web", json!({"query": 7, "num_results": 0}))],
        );
        assert!(!bad.passed);
        assert!(bad
            .reasons
            .iter()
            .any(|reason| matches!(reason, Reason::TypeMismatch { .. })));
    }

    #[test]
    fn rescoring_is_idempotent() {
        let attempts = [attempt("get_weather", json!({"location": "boston", "extra": 1}))];
        let first = score(Category::Basic, &weather("Boston"), &attempts);
        let second = score(Category::Basic, &weather("Boston"), &attempts);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_regex_is_rejected_by_validation() {
        let expect = Expectation::calls(vec![ExpectedCall::new("f")
            .with_argument("x", Predicate::Regex("(".to_string()))]);
        assert!(expect.validate().is_err());
    }

    #[test]
    fn large_attempt_lists_still_get_the_best_assignment() {
        let attempts = MAX_EXACT_ASSIGNMENT_ATTEMPTS + 2;
        let row = |entries: &[(usize, f64)]| {
            let mut row = vec![None; attempts];
            for (j, credit) in entries {
                row[*j] = Some(*credit);
            }
            row
        };
        let total = |credits: &[Vec<Option<f64>>], assignment: &[Option<usize>]| -> f64 {
            credits
                .iter()
                .zip(assignment)
                .filter_map(|(row, column)| row[(*column)?])
                .sum()
        };

        let flexible = row(&[(0, 1.0), (5, 0.9), (13, 0.0)]);
        let only_first = row(&[(0, 1.0)]);
        let name_only = row(&[(13, 0.0)]);

        let credits = vec![flexible.clone(), only_first.clone(), name_only.clone()];
        let assignment = assign_unordered(&credits, attempts);
        assert_eq!(assignment, vec![Some(5), Some(0), Some(13)]);
        assert!((total(&credits, &assignment) - 1.9).abs() < 1e-9);

        let reversed = vec![name_only, only_first, flexible];
        let assignment = assign_unordered(&reversed, attempts);
        assert!((total(&reversed, &assignment) - 1.9).abs() < 1e-9);
        assert_eq!(assignment[0], Some(13));
    }

    #[test]
    fn arithmetic_spellings_evaluate_as_floats() {
        assert_eq!(evaluate_expression("7/2"), Some(3.5));
        assert_eq!(evaluate_expression("math::sqrt(16)"), Some(4.0));
        assert_eq!(evaluate_expression("math.sqrt(16) + 1"), Some(5.0));
        assert_eq!(evaluate_expression("2 ** 3 × 1.5"), Some(12.0));
    }

    #[test]
    fn no_calls_expected_and_none_made() {
        let result = score(Category::Context, &Expectation::default(), &[]);
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }
}
