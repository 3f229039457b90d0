//! Label and field selectors used by route filters and list queries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector {input:?}: {reason}")]
pub struct SelectorError {
    pub input: String,
    pub reason: String,
}

fn err(input: &str, reason: impl Into<String>) -> SelectorError {
    SelectorError { input: input.to_string(), reason: reason.into() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

/// Label selector: `k=v`, `k==v`, `k!=v`, `k`, `!k`, `k in (a,b)`, `k notin (a,b)`, comma separated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching exactly the given key/value pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self { reqs: pairs.into_iter().map(|(k, v)| Requirement::Eq(k.to_string(), v.to_string())).collect() }
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| match r {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::NotEq(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
        })
    }

    /// Match against optional labels (objects without labels behave as an empty map).
    pub fn matches_opt(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(l) => self.matches(l),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn valid_value(v: &str) -> bool {
    v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Split on commas outside parentheses.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_requirement(input: &str, term: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if !valid_key(key) { return Err(err(input, format!("bad key in {:?}", term))); }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if let Some((head, rest)) = term.split_once('(') {
        let inner = rest.strip_suffix(')').ok_or_else(|| err(input, format!("unclosed set in {:?}", term)))?;
        let mut parts = head.split_whitespace();
        let (key, op) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(op), None) => (k, op),
            _ => return Err(err(input, format!("expected `key in (..)` in {:?}", term))),
        };
        if !valid_key(key) { return Err(err(input, format!("bad key in {:?}", term))); }
        let values: Vec<String> = inner.split(',').map(|v| v.trim()).filter(|v| !v.is_empty()).map(|v| v.to_string()).collect();
        if values.is_empty() || !values.iter().all(|v| valid_value(v)) {
            return Err(err(input, format!("bad value set in {:?}", term)));
        }
        return match op {
            "in" => Ok(Requirement::In(key.to_string(), values)),
            "notin" => Ok(Requirement::NotIn(key.to_string(), values)),
            other => Err(err(input, format!("unknown set operator {:?}", other))),
        };
    }
    let (key, value, negate) = if let Some((k, v)) = term.split_once("!=") {
        (k, Some(v), true)
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Some(v), false)
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Some(v), false)
    } else {
        (term, None, false)
    };
    let key = key.trim();
    if !valid_key(key) { return Err(err(input, format!("bad key in {:?}", term))); }
    match value.map(str::trim) {
        None => Ok(Requirement::Exists(key.to_string())),
        Some(v) if !valid_value(v) => Err(err(input, format!("bad value in {:?}", term))),
        Some(v) if negate => Ok(Requirement::NotEq(key.to_string(), v.to_string())),
        Some(v) => Ok(Requirement::Eq(key.to_string(), v.to_string())),
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() { return Ok(Self::default()); }
        let reqs = split_terms(s)
            .into_iter()
            .map(|t| t.trim())
            .map(|t| if t.is_empty() { Err(err(s, "empty requirement")) } else { parse_requirement(s, t) })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { reqs })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .reqs
            .iter()
            .map(|r| match r {
                Requirement::Eq(k, v) => format!("{}={}", k, v),
                Requirement::NotEq(k, v) => format!("{}!={}", k, v),
                Requirement::Exists(k) => k.clone(),
                Requirement::NotExists(k) => format!("!{}", k),
                Requirement::In(k, vs) => format!("{} in ({})", k, vs.join(",")),
                Requirement::NotIn(k, vs) => format!("{} notin ({})", k, vs.join(",")),
            })
            .collect();
        f.write_str(&rendered.join(","))
    }
}

/// Field selector over dotted JSON paths: `metadata.name=x,spec.type!=y`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    reqs: Vec<(Vec<String>, String, bool)>,
}

impl FieldSelector {
    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    /// Missing fields compare as the empty string.
    pub fn matches(&self, obj: &Json) -> bool {
        self.reqs.iter().all(|(path, want, negate)| {
            let got = lookup(obj, path);
            (got == *want) != *negate
        })
    }
}

fn lookup(obj: &Json, path: &[String]) -> String {
    let mut cur = obj;
    for seg in path {
        match cur.get(seg.as_str()) {
            Some(next) => cur = next,
            None => return String::new(),
        }
    }
    match cur {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() { return Ok(Self::default()); }
        let mut reqs = Vec::new();
        for term in s.split(',').map(|t| t.trim()) {
            let (path, value, negate) = if let Some((p, v)) = term.split_once("!=") {
                (p, v, true)
            } else if let Some((p, v)) = term.split_once("==") {
                (p, v, false)
            } else if let Some((p, v)) = term.split_once('=') {
                (p, v, false)
            } else {
                return Err(err(s, format!("expected path=value in {:?}", term)));
            };
            let segs: Vec<String> = path.trim().split('.').map(|p| p.to_string()).collect();
            if segs.iter().any(|p| p.is_empty()) {
                return Err(err(s, format!("bad field path in {:?}", term)));
            }
            reqs.push((segs, value.trim().to_string(), negate));
        }
        Ok(Self { reqs })
    }
}
