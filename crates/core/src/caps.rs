// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Capability descriptions ("caps") for streams flowing between stages.
//!
//! Caps are a list of [`Structure`]s, each a media type name plus a set of
//! typed fields. Caps are *fixed* when they describe exactly one concrete
//! format (one structure, every field a single value) and *unfixed* when they
//! describe a family of formats (ranges, lists or several structures).
//!
//! Two special values exist: `ANY` (matches everything) and `EMPTY`
//! (matches nothing, e.g. an unknown stream).
//!
//! ## Text form
//!
//! ```text
//! video/x-h264, stream-format={ avc, byte-stream }, width=[ 16, 4096 ]; audio/mpeg, mpegversion=4
//! ```
//!
//! Field values may carry a `(type)` annotation; `(string)` forces a string
//! even when the value looks numeric.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single field value inside a [`Structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    /// Inclusive integer range.
    IntRange { min: i64, max: i64 },
    Bool(bool),
    Str(String),
    /// A set of alternatives.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Returns `true` if the value denotes exactly one concrete value.
    pub fn is_fixed(&self) -> bool {
        match self {
            Self::Int(_) | Self::Bool(_) | Self::Str(_) => true,
            Self::IntRange { min, max } => min == max,
            Self::List(items) => matches!(items.as_slice(), [only] if only.is_fixed()),
        }
    }

    /// Computes the common subset of two values, if any.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::List(items), _) => {
                Self::collect_alternatives(items.iter().filter_map(|v| v.intersect(other)))
            },
            (_, Self::List(items)) => {
                Self::collect_alternatives(items.iter().filter_map(|v| self.intersect(v)))
            },
            (Self::Int(a), Self::Int(b)) => (a == b).then_some(Self::Int(*a)),
            (Self::Int(v), Self::IntRange { min, max })
            | (Self::IntRange { min, max }, Self::Int(v)) => {
                (min <= v && v <= max).then_some(Self::Int(*v))
            },
            (
                Self::IntRange { min: a_min, max: a_max },
                Self::IntRange { min: b_min, max: b_max },
            ) => {
                let lo = *a_min.max(b_min);
                let hi = *a_max.min(b_max);
                match lo.cmp(&hi) {
                    Ordering::Less => Some(Self::IntRange { min: lo, max: hi }),
                    Ordering::Equal => Some(Self::Int(lo)),
                    Ordering::Greater => None,
                }
            },
            (Self::Bool(a), Self::Bool(b)) => (a == b).then_some(Self::Bool(*a)),
            (Self::Str(a), Self::Str(b)) => (a == b).then(|| Self::Str(a.clone())),
            _ => None,
        }
    }

    /// Returns `true` if every value in `self` is also allowed by `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        match self {
            Self::List(items) => items.iter().all(|v| v.is_subset_of(other)),
            _ => self.intersect(other).as_ref() == Some(self),
        }
    }

    /// Picks one concrete value.
    pub fn fixate(&self) -> Self {
        match self {
            Self::IntRange { min, .. } => Self::Int(*min),
            Self::List(items) => items.first().map_or_else(|| self.clone(), Self::fixate),
            _ => self.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn collect_alternatives(values: impl Iterator<Item = Self>) -> Option<Self> {
        let mut out: Vec<Self> = Vec::new();
        for value in values {
            if !out.contains(&value) {
                out.push(value);
            }
        }
        match out.len() {
            0 => None,
            1 => out.pop(),
            _ => Some(Self::List(out)),
        }
    }

    fn from_bare(raw: &str, force_string: bool) -> Self {
        if !force_string {
            if let Ok(v) = raw.parse::<i64>() {
                return Self::Int(v);
            }
            match raw {
                "true" => return Self::Bool(true),
                "false" => return Self::Bool(false),
                _ => {},
            }
        }
        Self::Str(raw.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::IntRange { min, max } => write!(f, "[ {min}, {max} ]"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(s) => {
                let needs_quotes = s.is_empty()
                    || s.parse::<i64>().is_ok()
                    || s == "true"
                    || s == "false"
                    || s.chars().any(|c| {
                        c.is_whitespace()
                            || matches!(c, ',' | ';' | '=' | '[' | ']' | '{' | '}' | '(' | '"')
                    });
                if needs_quotes {
                    write!(f, "\"{s}\"")
                } else {
                    f.write_str(s)
                }
            },
            Self::List(items) => {
                f.write_str("{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(" }")
            },
        }
    }
}

/// A media type name plus its fields, e.g. `audio/mpeg, mpegversion=4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    name: String,
    fields: IndexMap<String, FieldValue>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: IndexMap::new() }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_int)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_fixed(&self) -> bool {
        self.fields.values().all(FieldValue::is_fixed)
    }

    /// Intersects two structures. Fields present on only one side are kept.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if self.name != other.name {
            return None;
        }
        let mut out = self.clone();
        for (key, other_value) in &other.fields {
            match out.fields.get(key) {
                Some(value) => {
                    let merged = value.intersect(other_value)?;
                    out.fields.insert(key.clone(), merged);
                },
                None => {
                    out.fields.insert(key.clone(), other_value.clone());
                },
            }
        }
        Some(out)
    }

    /// Returns `true` if every format described by `self` is described by `other`.
    ///
    /// Fields constrained by `other` must be present in `self`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.name == other.name
            && other
                .fields
                .iter()
                .all(|(key, ov)| self.fields.get(key).is_some_and(|sv| sv.is_subset_of(ov)))
    }

    #[must_use]
    pub fn fixate(&self) -> Self {
        Self {
            name: self.name.clone(),
            fields: self.fields.iter().map(|(k, v)| (k.clone(), v.fixate())).collect(),
        }
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.fields {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// Error returned when parsing caps from their text form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid caps '{input}': {reason}")]
pub struct CapsParseError {
    pub input: String,
    pub reason: String,
}

/// A capability description: ANY, EMPTY, or a list of structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    any: bool,
    structures: SmallVec<[Structure; 1]>,
}

impl Caps {
    pub fn new_any() -> Self {
        Self { any: true, structures: SmallVec::new() }
    }

    pub fn new_empty() -> Self {
        Self { any: false, structures: SmallVec::new() }
    }

    /// Caps with a single field-less structure.
    pub fn new_simple(name: impl Into<String>) -> Self {
        Self::from_structure(Structure::new(name))
    }

    pub fn from_structure(structure: Structure) -> Self {
        let mut structures = SmallVec::new();
        structures.push(structure);
        Self { any: false, structures }
    }

    pub fn from_structures(structures: impl IntoIterator<Item = Structure>) -> Self {
        Self { any: false, structures: structures.into_iter().collect() }
    }

    pub fn builder(name: impl Into<String>) -> CapsBuilder {
        CapsBuilder { structure: Structure::new(name) }
    }

    pub const fn is_any(&self) -> bool {
        self.any
    }

    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// Fixed caps describe exactly one concrete format.
    pub fn is_fixed(&self) -> bool {
        !self.any && matches!(self.structures.as_slice(), [only] if only.is_fixed())
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn structure(&self, index: usize) -> Option<&Structure> {
        self.structures.get(index)
    }

    /// Name of the first structure, e.g. `video/x-h264`.
    pub fn media_type(&self) -> Option<&str> {
        self.structures.first().map(Structure::name)
    }

    pub fn can_intersect(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }
        let mut out = Self::new_empty();
        for a in &self.structures {
            for b in &other.structures {
                if let Some(s) = a.intersect(b) {
                    if !out.structures.contains(&s) {
                        out.structures.push(s);
                    }
                }
            }
        }
        out
    }

    /// Returns `true` if every structure of `self` is covered by `superset`.
    pub fn is_subset(&self, superset: &Self) -> bool {
        if superset.any {
            return true;
        }
        if self.any {
            return false;
        }
        self.structures.iter().all(|s| superset.structures.iter().any(|o| s.is_subset_of(o)))
    }

    /// Appends the structures of `other` that are not already covered.
    pub fn merge(&mut self, other: Self) {
        if self.any {
            return;
        }
        if other.any {
            *self = Self::new_any();
            return;
        }
        for s in other.structures {
            if !self.structures.iter().any(|existing| s.is_subset_of(existing)) {
                self.structures.push(s);
            }
        }
    }

    /// Picks one concrete format out of the first structure.
    #[must_use]
    pub fn fixate(&self) -> Self {
        self.structures.first().map_or_else(|| self.clone(), |s| Self::from_structure(s.fixate()))
    }
}

/// Builds single-structure caps.
pub struct CapsBuilder {
    structure: Structure,
}

impl CapsBuilder {
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.structure.set(key, value);
        self
    }

    pub fn build(self) -> Caps {
        Caps::from_structure(self.structure)
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return f.write_str("ANY");
        }
        if self.structures.is_empty() {
            return f.write_str("EMPTY");
        }
        for (i, s) in self.structures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

impl FromStr for Caps {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "ANY" => return Ok(Self::new_any()),
            "" | "EMPTY" => return Ok(Self::new_empty()),
            _ => {},
        }

        let mut parser = CapsParser { input: trimmed, pos: 0 };
        let mut caps = Self::new_empty();
        loop {
            let structure = parser.structure()?;
            caps.structures.push(structure);
            parser.skip_ws();
            match parser.bump() {
                None => break,
                Some(';') => {},
                Some(c) => return Err(parser.error(format!("unexpected '{c}'"))),
            }
        }
        Ok(caps)
    }
}

impl Serialize for Caps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Caps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

struct CapsParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> CapsParser<'a> {
    fn error(&self, reason: impl Into<String>) -> CapsParseError {
        CapsParseError { input: self.input.to_string(), reason: reason.into() }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), CapsParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    fn token(&mut self, stops: &[char]) -> &'a str {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.bump();
        }
        self.input[start..self.pos].trim_end()
    }

    fn structure(&mut self) -> Result<Structure, CapsParseError> {
        let name = self.token(&[',', ';']);
        if name.is_empty() || name.contains('=') {
            return Err(self.error("missing structure name"));
        }
        let mut structure = Structure::new(name);
        while self.eat(',') {
            let key = self.token(&['=', ',', ';']);
            if key.is_empty() {
                return Err(self.error("missing field name"));
            }
            self.expect('=')?;
            let value = self.value()?;
            structure.set(key, value);
        }
        Ok(structure)
    }

    fn value(&mut self) -> Result<FieldValue, CapsParseError> {
        self.skip_ws();
        let mut force_string = false;
        if self.peek() == Some('(') {
            self.bump();
            let ty = self.token(&[')']);
            self.expect(')')?;
            force_string = matches!(ty, "string" | "str" | "s");
            self.skip_ws();
        }

        match self.peek() {
            Some('[') => {
                self.bump();
                let lo = self.token(&[',']);
                self.expect(',')?;
                let hi = self.token(&[']']);
                self.expect(']')?;
                let (Ok(min), Ok(max)) = (lo.parse::<i64>(), hi.parse::<i64>()) else {
                    return Err(self.error(format!("invalid range [{lo}, {hi}]")));
                };
                match min.cmp(&max) {
                    Ordering::Less => Ok(FieldValue::IntRange { min, max }),
                    Ordering::Equal => Ok(FieldValue::Int(min)),
                    Ordering::Greater => Err(self.error(format!("empty range [{min}, {max}]"))),
                }
            },
            Some('{') => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    items.push(self.value()?);
                    if self.eat(',') {
                        continue;
                    }
                    self.expect('}')?;
                    break;
                }
                Ok(FieldValue::List(items))
            },
            Some('"') => {
                self.bump();
                let start = self.pos;
                loop {
                    match self.bump() {
                        Some('"') => break,
                        Some(_) => {},
                        None => return Err(self.error("unterminated string")),
                    }
                }
                Ok(FieldValue::Str(self.input[start..self.pos - 1].to_string()))
            },
            _ => {
                let raw = self.token(&[',', ';', '}', ']']);
                if raw.is_empty() {
                    return Err(self.error("missing field value"));
                }
                Ok(FieldValue::from_bare(raw, force_string))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn caps(s: &str) -> Caps {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let c = caps(
            "video/x-h264, stream-format={ avc, byte-stream }, width=[ 16, 4096 ]; audio/mpeg",
        );
        assert_eq!(c.structures().len(), 2);
        assert_eq!(c.media_type(), Some("video/x-h264"));
        assert_eq!(
            c.to_string(),
            "video/x-h264, stream-format={ avc, byte-stream }, width=[ 16, 4096 ]; audio/mpeg"
        );
        assert!(caps("ANY").is_any());
        assert!(caps("EMPTY").is_empty());
        assert!("video/x-h264, width=".parse::<Caps>().is_err());
        assert!("video/x-h264, width=[ 10, 1 ]".parse::<Caps>().is_err());
    }

    #[test]
    fn test_forced_string_type() {
        let c = caps("audio/x-test, layer=(string)3, rate=(int)48000");
        let s = c.structure(0).unwrap();
        assert_eq!(s.get_str("layer"), Some("3"));
        assert_eq!(s.get_int("rate"), Some(48000));
        assert_eq!(c.to_string().parse::<Caps>().unwrap(), c);
    }

    #[test]
    fn test_fixed_detection() {
        assert!(caps("video/x-h264, stream-format=avc, width=640").is_fixed());
        assert!(!caps("video/x-h264, stream-format={ avc, byte-stream }").is_fixed());
        assert!(!caps("video/x-h264; video/x-h265").is_fixed());
        assert!(!Caps::new_any().is_fixed());
        assert!(!Caps::new_empty().is_fixed());
    }

    #[test]
    fn test_intersect() {
        let a = caps("video/x-h264, stream-format={ avc, byte-stream }, width=[ 16, 4096 ]");
        let b = caps("video/x-h264, stream-format=avc, width=[ 1, 640 ], alignment=au");
        let i = a.intersect(&b);
        assert_eq!(
            i.to_string(),
            "video/x-h264, stream-format=avc, width=[ 16, 640 ], alignment=au"
        );
        assert!(!a.can_intersect(&caps("audio/mpeg")));
        assert_eq!(Caps::new_any().intersect(&a), a);
        assert!(caps("video/x-raw, width=[ 1, 10 ]")
            .intersect(&caps("video/x-raw, width=[ 10, 20 ]"))
            .is_fixed());
    }

    #[test]
    fn test_subset() {
        let fixed = caps("video/x-h264, stream-format=avc, alignment=au");
        let template = caps("video/x-h264, stream-format={ avc, byte-stream }");
        assert!(fixed.is_subset(&template));
        assert!(!template.is_subset(&fixed));
        assert!(fixed.is_subset(&caps("video/x-h264")));
        assert!(!caps("video/x-h264").is_subset(&template));
        assert!(fixed.is_subset(&Caps::new_any()));
        assert!(!Caps::new_any().is_subset(&fixed));
    }

    #[test]
    fn test_merge_and_fixate() {
        let mut c = caps("video/x-h264, stream-format=avc");
        c.merge(caps("video/x-h264, stream-format=avc; video/x-h265"));
        assert_eq!(c.structures().len(), 2);

        let f = caps("audio/x-raw, rate=[ 8000, 96000 ], channels={ 2, 1 }").fixate();
        assert!(f.is_fixed());
        assert_eq!(f.to_string(), "audio/x-raw, rate=8000, channels=2");
    }

    #[test]
    fn test_serde_as_string() {
        let c = caps("audio/mpeg, mpegversion=4");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"audio/mpeg, mpegversion=4\"");
        let back: Caps = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
