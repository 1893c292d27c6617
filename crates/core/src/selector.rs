//! Label selectors in the Kubernetes string syntax.
//!
//! Supported forms, combined with `,` (logical AND):
//! `k=v`, `k==v`, `k!=v`, `k`, `!k`, `k in (a,b)`, `k notin (a,b)`.
//! The empty string selects everything.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty label key in `{0}`")]
    EmptyKey(String),
    #[error("invalid label key `{0}`")]
    InvalidKey(String),
    #[error("unbalanced parentheses in `{0}`")]
    Unbalanced(String),
    #[error("unknown set operator `{op}` in `{term}` (expect in/notin)")]
    UnknownOperator { op: String, term: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        let get = |k: &str| labels.iter().find(|(lk, _)| lk == k).map(|(_, v)| v.as_str());
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // Absent keys satisfy `!=`, as in Kubernetes.
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
            Requirement::In(k, vs) => get(k).map(|v| vs.iter().any(|x| x == v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => get(k).map(|v| !vs.iter().any(|x| x == v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
        }
    }
}

/// Conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every object.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn with(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self
    }

    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for term in split_terms(s)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Split on commas outside parentheses.
fn split_terms(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Unbalanced(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn check_key<'a>(key: &'a str, term: &str) -> Result<&'a str, SelectorError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(SelectorError::EmptyKey(term.to_string()));
    }
    if key.chars().any(|c| c.is_whitespace() || matches!(c, '=' | '!' | '(' | ')')) {
        return Err(SelectorError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

fn parse_term(term: &str) -> Result<Requirement, SelectorError> {
    if let Some(open) = term.find('(') {
        let close = term.rfind(')').ok_or_else(|| SelectorError::Unbalanced(term.to_string()))?;
        let head: Vec<&str> = term[..open].split_whitespace().collect();
        let values: Vec<String> = term[open + 1..close]
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        return match head.as_slice() {
            [key, "in"] => Ok(Requirement::In(check_key(key, term)?.to_string(), values)),
            [key, "notin"] => Ok(Requirement::NotIn(check_key(key, term)?.to_string(), values)),
            [_, op] => Err(SelectorError::UnknownOperator { op: (*op).to_string(), term: term.to_string() }),
            _ => Err(SelectorError::EmptyKey(term.to_string())),
        };
    }
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement::NotExists(check_key(rest, term)?.to_string()));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(check_key(k, term)?.to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(check_key(k, term)?.to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(check_key(k, term)?.to_string(), v.trim().to_string()));
    }
    Ok(Requirement::Exists(check_key(term, term)?.to_string()))
}
