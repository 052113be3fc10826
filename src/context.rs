//! Evaluation contexts: the subjects flags are evaluated for.
//!
//! A [`Context`] is either a single-kind context (one subject, e.g. a user)
//! or a multi-kind context combining several subjects of distinct kinds
//! (e.g. a user on a device). Contexts are built through validating builders
//! and are immutable afterwards, so evaluation can share them freely across
//! threads.

use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const USER_KIND: &str = "user";
const MULTI_KIND: &str = "multi";

/// Kind of a context: `user`, `organization`, `device`, or any other
/// application-defined grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKind(String);

impl ContextKind {
    /// The default kind, `user`.
    pub fn user() -> ContextKind {
        ContextKind(USER_KIND.to_owned())
    }

    pub fn is_user(&self) -> bool {
        self.0 == USER_KIND
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind names may contain ASCII letters, digits, `.`, `-` and `_`.
    /// `kind` and `multi` are reserved.
    fn validate(kind: &str) -> Result<()> {
        let well_formed = !kind.is_empty()
            && kind != "kind"
            && kind != MULTI_KIND
            && kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        if well_formed {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration(format!(
                "invalid context kind {kind:?}"
            )))
        }
    }
}

impl Default for ContextKind {
    fn default() -> Self {
        ContextKind::user()
    }
}

impl From<&str> for ContextKind {
    fn from(value: &str) -> Self {
        ContextKind(value.to_owned())
    }
}

impl From<String> for ContextKind {
    fn from(value: String) -> Self {
        ContextKind(value)
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of a context attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`,
/// `bool`, vectors and maps.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numeric value. All numbers are represented as `f64`.
    Number(f64),
    /// A boolean value.
    Bool(bool),
    /// An array of values. A clause matches an array attribute if it matches
    /// any of its elements.
    Array(Vec<AttributeValue>),
    /// A structured value, addressable through [`Reference`] paths.
    Object(HashMap<String, AttributeValue>),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// A reference to a context attribute.
///
/// A plain name (`"email"`) refers to a top-level attribute. A name starting
/// with `/` is a pointer path into structured attributes (`"/address/city"`),
/// with `~1` and `~0` unescaping to `/` and `~` within components.
///
/// Invalid references (empty, `/`, empty path components) are representable
/// because they come out of wire data; they are reported as malformed flag
/// data when a clause tries to use them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Reference {
    raw: String,
    // Empty when the reference is invalid.
    components: Vec<String>,
}

impl Reference {
    pub fn new(raw: impl Into<String>) -> Reference {
        let raw = raw.into();
        let components = Reference::parse(&raw);
        Reference { raw, components }
    }

    fn parse(raw: &str) -> Vec<String> {
        if raw.is_empty() || raw == "/" {
            return Vec::new();
        }
        let Some(path) = raw.strip_prefix('/') else {
            // A plain attribute name, used literally (even if it contains ~).
            return vec![raw.to_owned()];
        };
        let components: Vec<String> = path
            .split('/')
            .map(|c| c.replace("~1", "/").replace("~0", "~"))
            .collect();
        if components.iter().any(|c| c.is_empty()) {
            Vec::new()
        } else {
            components
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.components.is_empty()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn components(&self) -> &[String] {
        &self.components
    }

    /// Name of the top-level attribute this reference starts at.
    pub(crate) fn base(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// True if the reference is the plain `key` attribute.
    pub(crate) fn is_key(&self) -> bool {
        self.components.len() == 1 && self.components[0] == "key"
    }

    /// True if the reference is the plain `kind` attribute.
    pub(crate) fn is_kind(&self) -> bool {
        self.components.len() == 1 && self.components[0] == "kind"
    }
}

impl From<String> for Reference {
    fn from(value: String) -> Self {
        Reference::new(value)
    }
}

impl From<Reference> for String {
    fn from(value: Reference) -> Self {
        value.raw
    }
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        Reference::new(value)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An evaluation context: a single subject, or several subjects of distinct
/// kinds combined into a multi-kind context.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    kind: ContextKind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
    // Populated only for multi-kind contexts; parts are single-kind and
    // sorted by kind.
    parts: Vec<Context>,
}

impl Context {
    /// Start building a single-kind context (kind defaults to `user`).
    pub fn builder(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(key)
    }

    /// Start building a multi-kind context.
    pub fn multi_builder() -> MultiContextBuilder {
        MultiContextBuilder::new()
    }

    pub fn kind(&self) -> &ContextKind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_multi(&self) -> bool {
        !self.parts.is_empty()
    }

    /// The single-kind context of the given kind, if this context contains
    /// one. For a single-kind context, that is the context itself when the
    /// kind matches.
    pub fn individual_context(&self, kind: &ContextKind) -> Option<&Context> {
        if self.is_multi() {
            self.parts.iter().find(|p| &p.kind == kind)
        } else if &self.kind == kind {
            Some(self)
        } else {
            None
        }
    }

    /// All kinds present in this context.
    pub fn kinds(&self) -> Vec<&ContextKind> {
        if self.is_multi() {
            self.parts.iter().map(|p| &p.kind).collect()
        } else {
            vec![&self.kind]
        }
    }

    /// Resolve an attribute reference against this (single-kind) context.
    ///
    /// Built-in attributes (`key`, `kind`, `name`, `anonymous`) are only
    /// addressable as single-component references. Returns `None` for
    /// missing attributes and for invalid references; the caller
    /// distinguishes the two via [`Reference::is_valid`].
    pub fn value_of(&self, reference: &Reference) -> Option<AttributeValue> {
        let mut components = reference.components().iter();
        let base = components.next()?;

        let mut current = if reference.components().len() == 1 {
            match base.as_str() {
                "key" => return Some(AttributeValue::String(self.key.clone())),
                "kind" => return Some(AttributeValue::String(self.kind.0.clone())),
                "name" => return self.name.clone().map(AttributeValue::String),
                "anonymous" => return Some(AttributeValue::Bool(self.anonymous)),
                _ => return self.attributes.get(base).cloned(),
            }
        } else {
            self.attributes.get(base)?
        };

        for component in components {
            match current {
                AttributeValue::Object(map) => current = map.get(component)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }

    /// Canonical key for this context, used to key external big-segment
    /// membership lookups. Multi-kind contexts concatenate their parts as
    /// `kind:key` pairs in kind order, with `%` and `:` escaped in keys.
    pub fn canonical_key(&self) -> String {
        if !self.is_multi() {
            return self.key.clone();
        }
        let mut out = String::new();
        for part in &self.parts {
            if !out.is_empty() {
                out.push(':');
            }
            out.push_str(part.kind.as_str());
            out.push(':');
            out.push_str(&part.key.replace('%', "%25").replace(':', "%3A"));
        }
        out
    }
}

/// Builder for single-kind [`Context`]s.
///
/// Every setter returns the builder by value; building never aliases
/// collections with previously built contexts.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            kind: USER_KIND.to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> ContextBuilder {
        self.kind = kind.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> ContextBuilder {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> ContextBuilder {
        self.anonymous = anonymous;
        self
    }

    /// Set a custom attribute.
    pub fn set(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> ContextBuilder {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Context> {
        ContextKind::validate(&self.kind)?;
        if self.key.is_empty() {
            return Err(Error::InvalidConfiguration(
                "context key must not be empty".to_owned(),
            ));
        }
        Ok(Context {
            kind: ContextKind(self.kind),
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
            parts: Vec::new(),
        })
    }
}

/// Builder for multi-kind [`Context`]s.
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    parts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> MultiContextBuilder {
        MultiContextBuilder::default()
    }

    /// Add a single-kind context. Adding a multi-kind context or a duplicate
    /// kind makes `build` fail.
    pub fn add(mut self, context: Context) -> MultiContextBuilder {
        self.parts.push(context);
        self
    }

    pub fn build(self) -> Result<Context> {
        let mut parts = self.parts;
        if parts.is_empty() {
            return Err(Error::InvalidConfiguration(
                "multi-kind context requires at least one part".to_owned(),
            ));
        }
        if parts.iter().any(Context::is_multi) {
            return Err(Error::InvalidConfiguration(
                "multi-kind context parts must be single-kind".to_owned(),
            ));
        }
        if parts.len() == 1 {
            // A multi-kind context of one part is just that part.
            return Ok(parts.pop().expect("checked non-empty"));
        }
        parts.sort_by(|a, b| a.kind.cmp(&b.kind));
        if parts.windows(2).any(|w| w[0].kind == w[1].kind) {
            return Err(Error::InvalidConfiguration(
                "multi-kind context parts must have distinct kinds".to_owned(),
            ));
        }
        let mut context = Context {
            kind: ContextKind(MULTI_KIND.to_owned()),
            key: String::new(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            parts,
        };
        context.key = context.canonical_key();
        Ok(context)
    }
}
