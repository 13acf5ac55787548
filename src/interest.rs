//! Declarative subscriptions.
//!
//! An [`Interest`] is a predicate over instance records. Atomic interests
//! test a single field; [`MultipleInterests`] is a flat OR of atomic ones
//! and can only be built through [`Interest::any_of`], which flattens and
//! de-duplicates its input.

use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::InterestError;
use crate::model::InstanceRecord;

/// How an atomic interest compares a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub enum Pattern {
    Equals(String),
    /// A regular expression that must match the whole field.
    Like(LikePattern),
}

#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, InterestError> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|cause| {
            InterestError::InvalidPattern {
                pattern: pattern.clone(),
                cause,
            }
        })?;
        Ok(Self { pattern, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl Pattern {
    pub fn equals(value: impl Into<String>) -> Self {
        Pattern::Equals(value.into())
    }

    pub fn like(pattern: impl Into<String>) -> Result<Self, InterestError> {
        LikePattern::new(pattern).map(Pattern::Like)
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Pattern::Equals(expected) => expected == value,
            Pattern::Like(like) => like.regex.is_match(value),
        }
    }

    fn operator(&self) -> Operator {
        match self {
            Pattern::Equals(_) => Operator::Equals,
            Pattern::Like(_) => Operator::Like,
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Pattern::Equals(value) => value,
            Pattern::Like(like) => like.as_str(),
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.operator() == other.operator() && self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

impl Hash for Pattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operator().hash(state);
        self.as_str().hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operator {
    Equals,
    Like,
}

#[derive(Serialize, Deserialize)]
struct PatternRepr {
    operator: Operator,
    pattern: String,
}

impl TryFrom<PatternRepr> for Pattern {
    type Error = InterestError;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        match repr.operator {
            Operator::Equals => Ok(Pattern::Equals(repr.pattern)),
            Operator::Like => Pattern::like(repr.pattern),
        }
    }
}

impl From<Pattern> for PatternRepr {
    fn from(pattern: Pattern) -> Self {
        PatternRepr {
            operator: pattern.operator(),
            pattern: pattern.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Equals(value) => write!(f, "={value}"),
            Pattern::Like(like) => write!(f, "~{}", like.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "pattern", rename_all = "snake_case")]
pub enum Interest {
    FullRegistry,
    EmptyRegistry,
    Application(Pattern),
    Vip(Pattern),
    SecureVip(Pattern),
    Instance(Pattern),
    Multiple(MultipleInterests),
}

/// A flat, de-duplicated OR of at least two atomic interests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Interest>", into = "Vec<Interest>")]
pub struct MultipleInterests(Vec<Interest>);

impl MultipleInterests {
    pub fn atoms(&self) -> &[Interest] {
        &self.0
    }
}

impl From<Vec<Interest>> for MultipleInterests {
    fn from(interests: Vec<Interest>) -> Self {
        MultipleInterests(flatten(interests))
    }
}

impl From<MultipleInterests> for Vec<Interest> {
    fn from(multiple: MultipleInterests) -> Self {
        multiple.0
    }
}

fn flatten(interests: impl IntoIterator<Item = Interest>) -> Vec<Interest> {
    let mut atoms: Vec<Interest> = Vec::new();
    for interest in interests {
        match interest {
            Interest::Multiple(MultipleInterests(nested)) => atoms.extend(nested),
            atom => atoms.push(atom),
        }
    }
    atoms.sort_by_cached_key(|atom| atom.to_string());
    atoms.dedup();
    atoms
}

impl Interest {
    pub fn application(name: impl Into<String>) -> Self {
        Interest::Application(Pattern::equals(name))
    }

    pub fn application_like(pattern: &str) -> Result<Self, InterestError> {
        Pattern::like(pattern).map(Interest::Application)
    }

    pub fn vip(vip: impl Into<String>) -> Self {
        Interest::Vip(Pattern::equals(vip))
    }

    pub fn vip_like(pattern: &str) -> Result<Self, InterestError> {
        Pattern::like(pattern).map(Interest::Vip)
    }

    pub fn secure_vip(vip: impl Into<String>) -> Self {
        Interest::SecureVip(Pattern::equals(vip))
    }

    pub fn instance(id: impl Into<String>) -> Self {
        Interest::Instance(Pattern::equals(id))
    }

    pub fn instance_like(pattern: &str) -> Result<Self, InterestError> {
        Pattern::like(pattern).map(Interest::Instance)
    }

    /// OR of the given interests. Nested composites are flattened, empty
    /// interests dropped and duplicates removed; a full-registry member
    /// swallows the rest. The result is only a `Multiple` when at least two
    /// distinct atoms remain.
    pub fn any_of(interests: impl IntoIterator<Item = Interest>) -> Interest {
        let mut atoms = flatten(interests);
        atoms.retain(|atom| *atom != Interest::EmptyRegistry);

        if atoms.contains(&Interest::FullRegistry) {
            return Interest::FullRegistry;
        }
        match atoms.len() {
            0 => Interest::EmptyRegistry,
            1 => atoms.remove(0),
            _ => Interest::Multiple(MultipleInterests(atoms)),
        }
    }

    pub fn matches(&self, record: &InstanceRecord) -> bool {
        match self {
            Interest::FullRegistry => true,
            Interest::EmptyRegistry => false,
            Interest::Application(pattern) => pattern.is_match(record.app()),
            Interest::Vip(pattern) => record.vip_address().is_some_and(|v| pattern.is_match(v)),
            Interest::SecureVip(pattern) => record
                .secure_vip_address()
                .is_some_and(|v| pattern.is_match(v)),
            Interest::Instance(pattern) => pattern.is_match(record.id()),
            Interest::Multiple(multiple) => multiple.0.iter().any(|atom| atom.matches(record)),
        }
    }

    pub fn is_atomic(&self) -> bool {
        !matches!(self, Interest::Multiple(_))
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::FullRegistry => f.write_str("full-registry"),
            Interest::EmptyRegistry => f.write_str("empty-registry"),
            Interest::Application(p) => write!(f, "application{p}"),
            Interest::Vip(p) => write!(f, "vip{p}"),
            Interest::SecureVip(p) => write!(f, "secure-vip{p}"),
            Interest::Instance(p) => write!(f, "instance{p}"),
            Interest::Multiple(multiple) => {
                let atoms: Vec<String> = multiple.0.iter().map(ToString::to_string).collect();
                write!(f, "any-of[{}]", atoms.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        InstanceRecord::builder("i-123")
            .app("billing")
            .vip_address("billing.vip")
            .build()
    }

    #[test]
    fn like_patterns_match_the_whole_field() {
        let record = record();
        assert!(Interest::application_like("bill.*").unwrap().matches(&record));
        assert!(!Interest::application_like("bill").unwrap().matches(&record));
        assert!(Interest::instance_like("i-[0-9]+").unwrap().matches(&record));
        assert!(!Interest::secure_vip("billing.vip").matches(&record));
    }

    #[test]
    fn invalid_like_pattern_is_rejected() {
        let err = Interest::application_like("bill(").unwrap_err();
        assert!(err.to_string().contains("bill("));
    }

    #[test]
    fn composites_are_flat_and_deduplicated() {
        let nested = Interest::any_of([Interest::application("a"), Interest::vip("v")]);
        let combined = Interest::any_of([
            nested,
            Interest::application("a"),
            Interest::EmptyRegistry,
            Interest::instance("i-1"),
        ]);

        let Interest::Multiple(multiple) = &combined else {
            panic!("expected a composite, got {combined}");
        };
        assert_eq!(multiple.atoms().len(), 3);
        assert!(multiple.atoms().iter().all(Interest::is_atomic));

        let reordered = Interest::any_of([
            Interest::instance("i-1"),
            Interest::vip("v"),
            Interest::application("a"),
        ]);
        assert_eq!(combined, reordered);
    }

    #[test]
    fn degenerate_composites_collapse() {
        assert_eq!(Interest::any_of([]), Interest::EmptyRegistry);
        assert_eq!(
            Interest::any_of([Interest::application("a"), Interest::application("a")]),
            Interest::application("a")
        );
        assert_eq!(
            Interest::any_of([Interest::application("a"), Interest::FullRegistry]),
            Interest::FullRegistry
        );
    }

    #[test]
    fn composite_matches_any_member() {
        let record = record();
        let interest =
            Interest::any_of([Interest::application("other"), Interest::vip("billing.vip")]);
        assert!(interest.matches(&record));
        assert!(!Interest::EmptyRegistry.matches(&record));
    }

    #[test]
    fn patterns_round_trip_through_json() {
        let interest = Interest::vip_like("billing\\..*").unwrap();
        let json = serde_json::to_string(&interest).unwrap();
        let back: Interest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, interest);
        assert!(back.matches(&record()));
    }
}
