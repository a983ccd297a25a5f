//! The problem-package manifest.
//!
//! A Simfile is a plaintext key/value document with two bracketed blocks:
//!
//! ```text
//! name: Sum of numbers
//! label: sum
//! statement: doc/statement.pdf
//! checker: check/checker.cpp
//! memory_limit: 64
//! solutions: [prog/sum.cpp, prog/sum_slow.cpp]
//! limits: [
//!         sum0a 0.50
//!         sum1a 1.00
//!         sum1b 1.00
//! ]
//! scoring: [
//!         1 100
//! ]
//! ```
//!
//! Tests are grouped by the digit run preceding the trailing letters of the
//! test name (`sum1a` -> group `1`, tag `a`). Tag `ocen` or a group id with
//! a leading `0` marks a sample group, which always scores 0.

use std::time::Duration;

use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, line_ending, not_line_ending, space0, space1};
use nom::combinator::{eof, map};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimfileError {
    #[error("simfile syntax error near: {0}")]
    Syntax(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("duplicate field: {0}")]
    DuplicateField(String),
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid test name: {0} (expected <prefix><group digits><tag letters>)")]
    InvalidTestName(String),
    #[error("test group {0} has no tests")]
    GroupWithoutTests(String),
    #[error("test group {0} has no score")]
    MissingScore(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    pub time_limit: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGroup {
    /// Group id: the digit run shared by the group's test names.
    pub id: String,
    pub points: i64,
    pub tests: Vec<TestSpec>,
}

impl TestGroup {
    pub fn is_sample(&self) -> bool {
        self.id.starts_with('0')
            || self
                .tests
                .iter()
                .any(|t| split_test_name(&t.name).is_ok_and(|(_, _, tid)| tid == "ocen"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simfile {
    pub name: String,
    pub label: String,
    pub statement: String,
    pub checker: String,
    /// Ordered; the first entry is the model solution.
    pub solutions: Vec<String>,
    pub memory_limit_mib: u64,
    /// Declaration order of the `limits` block.
    pub groups: Vec<TestGroup>,
}

/// Splits a test name into `(prefix, group id, tag)`:
/// `sum1a` -> `("sum", "1", "a")`, `sum0ocen` -> `("sum", "0", "ocen")`.
pub fn split_test_name(name: &str) -> Result<(&str, &str, &str), SimfileError> {
    let tag_start = name
        .rfind(|c: char| !c.is_ascii_alphabetic())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (head, tag) = name.split_at(tag_start);
    let gid_start = head
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (prefix, gid) = head.split_at(gid_start);
    if gid.is_empty() {
        return Err(SimfileError::InvalidTestName(name.to_string()));
    }
    Ok((prefix, gid, tag))
}

// ── Raw parsing ──

#[derive(Debug)]
enum RawValue {
    Scalar(String),
    List(Vec<String>),
    Block(Vec<Vec<String>>),
}

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, ',' | '[' | ']'))(input)
}

fn eol(input: &str) -> IResult<&str, ()> {
    map(tuple((space0, alt((line_ending, eof)))), |_| ())(input)
}

fn block_entry(input: &str) -> IResult<&str, Vec<String>> {
    let (input, _) = space0(input)?;
    let (input, first) = token(input)?;
    let (input, rest) = many0(preceded(space1, token))(input)?;
    let (input, _) = eol(input)?;
    let mut entry = vec![first.to_string()];
    entry.extend(rest.into_iter().map(str::to_string));
    Ok((input, entry))
}

fn block(input: &str) -> IResult<&str, RawValue> {
    let (input, _) = char('[')(input)?;
    let (input, _) = eol(input)?;
    let (input, entries) = many0(block_entry)(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char(']')(input)?;
    Ok((input, RawValue::Block(entries)))
}

fn inline_list(input: &str) -> IResult<&str, RawValue> {
    let (input, items) = delimited(
        char('['),
        separated_list0(char(','), delimited(space0, token, space0)),
        char(']'),
    )(input)?;
    Ok((
        input,
        RawValue::List(items.into_iter().map(str::to_string).collect()),
    ))
}

fn scalar(input: &str) -> IResult<&str, RawValue> {
    map(not_line_ending, |v: &str| {
        RawValue::Scalar(v.trim().to_string())
    })(input)
}

fn item(input: &str) -> IResult<&str, (String, RawValue)> {
    let (input, k) = key(input)?;
    let (input, _) = char(':')(input)?;
    let (input, _) = space0(input)?;
    let (input, v) = alt((block, inline_list, scalar))(input)?;
    let (input, _) = eol(input)?;
    Ok((input, (k.to_string(), v)))
}

fn document(input: &str) -> IResult<&str, Vec<(String, RawValue)>> {
    let (input, _) = nom::character::complete::multispace0(input)?;
    terminated(
        many0(terminated(item, nom::character::complete::multispace0)),
        eof,
    )(input)
}

// ── Semantic construction ──

fn seconds_to_limit(field: &'static str, value: &str) -> Result<Duration, SimfileError> {
    let secs: f64 = value.parse().map_err(|_| SimfileError::InvalidValue {
        field,
        value: value.to_string(),
    })?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SimfileError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_millis((secs * 1000.0).round() as u64))
}

impl Simfile {
    pub fn parse(input: &str) -> Result<Simfile, SimfileError> {
        let (_, items) =
            document(input).map_err(|e| SimfileError::Syntax(e.to_string().chars().take(80).collect()))?;

        let mut name = None;
        let mut label = None;
        let mut statement = None;
        let mut checker = None;
        let mut solutions: Option<Vec<String>> = None;
        let mut memory_limit = None;
        let mut limits: Option<Vec<Vec<String>>> = None;
        let mut scoring: Option<Vec<Vec<String>>> = None;

        for (k, v) in items {
            let dup = match (k.as_str(), v) {
                ("name", RawValue::Scalar(v)) => name.replace(v).is_some(),
                ("label", RawValue::Scalar(v)) => label.replace(v).is_some(),
                ("statement", RawValue::Scalar(v)) => statement.replace(v).is_some(),
                ("checker", RawValue::Scalar(v)) => checker.replace(v).is_some(),
                ("memory_limit", RawValue::Scalar(v)) => memory_limit.replace(v).is_some(),
                ("solutions", RawValue::List(v)) => solutions.replace(v).is_some(),
                ("limits", RawValue::Block(v)) => limits.replace(v).is_some(),
                ("scoring", RawValue::Block(v)) => scoring.replace(v).is_some(),
                (_, _) => {
                    return Err(SimfileError::Syntax(k));
                }
            };
            if dup {
                return Err(SimfileError::DuplicateField(k));
            }
        }

        let name = non_empty("name", name)?;
        let label = non_empty("label", label)?;
        let statement = non_empty("statement", statement)?;
        let checker = non_empty("checker", checker)?;
        let solutions = solutions.ok_or(SimfileError::MissingField("solutions"))?;
        if solutions.is_empty() {
            return Err(SimfileError::MissingField("solutions"));
        }
        let memory_limit = memory_limit.ok_or(SimfileError::MissingField("memory_limit"))?;
        let memory_limit_mib: u64 =
            memory_limit
                .parse()
                .ok()
                .filter(|&v| v > 0)
                .ok_or(SimfileError::InvalidValue {
                    field: "memory_limit",
                    value: memory_limit.clone(),
                })?;

        let mut groups: Vec<TestGroup> = Vec::new();
        for entry in limits.ok_or(SimfileError::MissingField("limits"))? {
            let [test_name, limit] = entry.as_slice() else {
                return Err(SimfileError::InvalidValue {
                    field: "limits",
                    value: entry.join(" "),
                });
            };
            let (_, gid, _) = split_test_name(test_name)?;
            let test = TestSpec {
                name: test_name.clone(),
                time_limit: seconds_to_limit("time_limit", limit)?,
            };
            match groups.iter_mut().find(|g| g.id == gid) {
                Some(group) => group.tests.push(test),
                None => groups.push(TestGroup {
                    id: gid.to_string(),
                    points: 0,
                    tests: vec![test],
                }),
            }
        }

        for entry in scoring.ok_or(SimfileError::MissingField("scoring"))? {
            let [gid, points] = entry.as_slice() else {
                return Err(SimfileError::InvalidValue {
                    field: "scoring",
                    value: entry.join(" "),
                });
            };
            let points: i64 = points.parse().map_err(|_| SimfileError::InvalidValue {
                field: "scoring",
                value: points.clone(),
            })?;
            let group = groups
                .iter_mut()
                .find(|g| g.id == *gid)
                .ok_or_else(|| SimfileError::GroupWithoutTests(gid.clone()))?;
            group.points = points;
        }

        for group in &mut groups {
            if group.is_sample() {
                group.points = 0;
            }
        }
        if let Some(group) = groups.iter().find(|g| !g.is_sample() && g.points == 0) {
            return Err(SimfileError::MissingScore(group.id.clone()));
        }

        Ok(Simfile {
            name,
            label,
            statement,
            checker,
            solutions,
            memory_limit_mib,
            groups,
        })
    }

    /// Re-serializes the manifest. `parse(dump(s)) == s`.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "name: {}", self.name);
        let _ = writeln!(out, "label: {}", self.label);
        let _ = writeln!(out, "statement: {}", self.statement);
        let _ = writeln!(out, "checker: {}", self.checker);
        let _ = writeln!(out, "memory_limit: {}", self.memory_limit_mib);
        let _ = writeln!(out, "solutions: [{}]", self.solutions.join(", "));
        let _ = writeln!(out, "limits: [");
        for group in &self.groups {
            for test in &group.tests {
                let _ = writeln!(
                    out,
                    "        {} {:.2}",
                    test.name,
                    test.time_limit.as_secs_f64()
                );
            }
        }
        let _ = writeln!(out, "]");
        let _ = writeln!(out, "scoring: [");
        for group in self.groups.iter().filter(|g| !g.is_sample()) {
            let _ = writeln!(out, "        {} {}", group.id, group.points);
        }
        let _ = writeln!(out, "]");
        out
    }

    pub fn model_solution(&self) -> &str {
        &self.solutions[0]
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mib << 20
    }
}

fn non_empty(field: &'static str, value: Option<String>) -> Result<String, SimfileError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SimfileError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
name: Sum of numbers
label: sum
statement: doc/statement.pdf
checker: check/checker.cpp
memory_limit: 64
solutions: [prog/sum.cpp, prog/sum_slow.cpp]
limits: [
        sum0a 0.50
        sum1a 1.00
        sum1b 1.00
        sum2ocen 2.00
]
scoring: [
        1 100
]
";

    #[test]
    fn parses_a_full_manifest() {
        let sf = Simfile::parse(SAMPLE).unwrap();
        assert_eq!(sf.name, "Sum of numbers");
        assert_eq!(sf.label, "sum");
        assert_eq!(sf.memory_limit_mib, 64);
        assert_eq!(sf.model_solution(), "prog/sum.cpp");
        assert_eq!(sf.groups.len(), 3);
        assert_eq!(sf.groups[0].id, "0");
        assert!(sf.groups[0].is_sample());
        assert_eq!(sf.groups[1].id, "1");
        assert_eq!(sf.groups[1].points, 100);
        assert_eq!(sf.groups[1].tests.len(), 2);
        assert_eq!(
            sf.groups[1].tests[0].time_limit,
            Duration::from_millis(1000)
        );
        // "ocen" tag marks group 2 as a sample regardless of its id.
        assert!(sf.groups[2].is_sample());
        assert_eq!(sf.groups[2].points, 0);
    }

    #[test]
    fn dump_then_parse_is_identity() {
        let sf = Simfile::parse(SAMPLE).unwrap();
        let again = Simfile::parse(&sf.dump()).unwrap();
        assert_eq!(sf, again);
    }

    #[test]
    fn test_name_splitting() {
        assert_eq!(split_test_name("sum1a").unwrap(), ("sum", "1", "a"));
        assert_eq!(split_test_name("sum0ocen").unwrap(), ("sum", "0", "ocen"));
        assert_eq!(split_test_name("sum12").unwrap(), ("sum", "12", ""));
        assert_eq!(split_test_name("7b").unwrap(), ("", "7", "b"));
        assert!(split_test_name("abc").is_err());
    }

    #[test]
    fn scoring_for_unknown_group_is_rejected() {
        let bad = SAMPLE.replace("        1 100", "        1 50\n        3 50");
        assert_eq!(
            Simfile::parse(&bad),
            Err(SimfileError::GroupWithoutTests("3".into()))
        );
    }

    #[test]
    fn scored_group_without_points_is_rejected() {
        let bad = SAMPLE.replace("        1 100\n", "");
        assert_eq!(Simfile::parse(&bad), Err(SimfileError::MissingScore("1".into())));
    }

    #[test]
    fn missing_memory_limit_is_rejected() {
        let bad = SAMPLE.replace("memory_limit: 64\n", "");
        assert_eq!(
            Simfile::parse(&bad),
            Err(SimfileError::MissingField("memory_limit"))
        );
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let bad = format!("{SAMPLE}label: again\n");
        assert_eq!(
            Simfile::parse(&bad),
            Err(SimfileError::DuplicateField("label".into()))
        );
    }
}
