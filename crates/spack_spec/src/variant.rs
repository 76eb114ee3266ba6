//! Variants and compiler flags.
//!
//! A variant is a named compile-time option with one of three shapes:
//! boolean (`+foo` / `~foo`), single-valued (`foo=bar`) or multi-valued
//! (`foo=a,b`). Until a package definition fixes the arity, two
//! single-valued constraints with different values merge into a
//! multi-valued one; the subset semantics of `satisfies` treat a
//! required value set as "at least these values".
//!
//! Every variant and every compiler flag carries a `propagate` bit
//! (written `foo==bar`, `++foo`): the value applies to the node and to
//! every transitive dependency declaring a variant of the same name.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter, Write as _};
use std::str::FromStr;

use indexmap::IndexMap;
use thiserror::Error;

/// Names that have meaning to the spec machinery itself and therefore
/// cannot be propagated.
pub const RESERVED_VARIANT_NAMES: &[&str] = &[
    "patches",
    "dev_path",
    "commit",
    "arch",
    "architecture",
    "platform",
    "os",
    "target",
    "namespace",
];

/// The value wildcard. May not appear as a literal variant value.
pub const VALUE_WILDCARD: &str = "*";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("the variant value `*` is reserved")]
    ReservedValue,
    #[error("cannot propagate reserved variant `{0}`")]
    PropagationOnReserved(String),
}

/// A conflict found while merging two variant maps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("variant `{name}` cannot be both `{left}` and `{right}`")]
pub struct VariantConflict {
    pub name: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariantValue {
    Bool(bool),
    Single(String),
    Multi(BTreeSet<String>),
    /// The `*` wildcard: matches any defined, non-empty value.
    Any,
}

impl VariantValue {
    /// Builds a value from the comma-separated payload of `name=payload`.
    pub fn from_payload(payload: &str) -> Result<VariantValue, VariantError> {
        if payload == VALUE_WILDCARD {
            return Ok(VariantValue::Any);
        }
        let values: Vec<&str> = payload.split(',').map(str::trim).collect();
        if values.iter().any(|v| *v == VALUE_WILDCARD) {
            return Err(VariantError::ReservedValue);
        }
        if values.len() == 1 {
            Ok(match values[0] {
                "true" | "True" => VariantValue::Bool(true),
                "false" | "False" => VariantValue::Bool(false),
                single => VariantValue::Single(single.to_owned()),
            })
        } else {
            Ok(VariantValue::Multi(values.iter().map(|v| (*v).to_owned()).collect()))
        }
    }

    fn as_single(&self) -> Option<&str> {
        match self {
            VariantValue::Single(s) => Some(s),
            VariantValue::Bool(true) => Some("true"),
            VariantValue::Bool(false) => Some("false"),
            _ => None,
        }
    }

    /// Is this a value at all (the wildcard is not)?
    pub fn is_defined(&self) -> bool {
        match self {
            VariantValue::Any => false,
            VariantValue::Multi(set) => !set.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variant {
    name: String,
    pub value: VariantValue,
    pub propagate: bool,
}

impl Variant {
    pub fn new(
        name: impl Into<String>,
        value: VariantValue,
        propagate: bool,
    ) -> Result<Variant, VariantError> {
        let name = name.into();
        if propagate && RESERVED_VARIANT_NAMES.contains(&name.as_str()) {
            return Err(VariantError::PropagationOnReserved(name));
        }
        Ok(Variant { name, value, propagate })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces an abstract (wildcard) value with a concrete one,
    /// re-validating the reserved-value rule.
    pub fn substitute(&mut self, value: VariantValue) -> Result<(), VariantError> {
        if matches!(value, VariantValue::Any) {
            return Err(VariantError::ReservedValue);
        }
        self.value = value;
        Ok(())
    }

    /// Does every value admitted by `self` satisfy the requirement
    /// `other`? Both variants are assumed to share a name.
    pub fn satisfies(&self, other: &Variant) -> bool {
        if other.propagate && !self.propagate {
            return false;
        }
        self.value_satisfies(other)
    }

    /// Value-shape satisfaction, ignoring propagation bits. On a
    /// concrete spec propagation has already been materialized into
    /// values, so the bit is checked by walking the graph instead.
    pub fn value_satisfies(&self, other: &Variant) -> bool {
        match (&self.value, &other.value) {
            (mine, VariantValue::Any) => mine.is_defined(),
            (VariantValue::Any, _) => false,
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Multi(mine), VariantValue::Multi(req)) => req.is_subset(mine),
            (VariantValue::Multi(mine), req) => {
                req.as_single().map(|r| mine.contains(r)).unwrap_or(false)
            }
            (mine, VariantValue::Multi(req)) => {
                // The single present value must cover every required one.
                match mine.as_single() {
                    Some(m) => req.iter().all(|r| r == m),
                    None => false,
                }
            }
            (a, b) => a.as_single() == b.as_single(),
        }
    }

    /// Can some value satisfy both constraints?
    pub fn intersects(&self, other: &Variant) -> bool {
        match (&self.value, &other.value) {
            (_, VariantValue::Any) | (VariantValue::Any, _) => true,
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Bool(_), _) | (_, VariantValue::Bool(_)) => {
                self.value.as_single().is_some()
                    && self.value.as_single() == other.value.as_single()
            }
            // Value sets are "at least these" constraints: they always
            // admit the union.
            _ => true,
        }
    }

    /// Narrows `self` by `other` in place. Returns whether `self`
    /// changed, or the conflict when no value can satisfy both.
    pub fn constrain(&mut self, other: &Variant) -> Result<bool, VariantConflict> {
        if !self.intersects(other) {
            return Err(VariantConflict {
                name: self.name.clone(),
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        let mut changed = false;
        let merged = match (&self.value, &other.value) {
            (_, VariantValue::Any) => None,
            (VariantValue::Any, theirs) => Some(theirs.clone()),
            (VariantValue::Bool(_), _) | (_, VariantValue::Bool(_)) => None,
            (VariantValue::Single(a), VariantValue::Single(b)) if a == b => None,
            (mine, theirs) => {
                let mut union: BTreeSet<String> = BTreeSet::new();
                match mine {
                    VariantValue::Multi(set) => union.extend(set.iter().cloned()),
                    other => union.extend(other.as_single().map(str::to_owned)),
                }
                match theirs {
                    VariantValue::Multi(set) => union.extend(set.iter().cloned()),
                    other => union.extend(other.as_single().map(str::to_owned)),
                }
                Some(VariantValue::Multi(union))
            }
        };
        if let Some(merged) = merged {
            if merged != self.value {
                self.value = merged;
                changed = true;
            }
        }
        // A non-propagating request weakens propagation.
        let propagate = self.propagate && other.propagate;
        if propagate != self.propagate {
            self.propagate = propagate;
            changed = true;
        }
        Ok(changed)
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sigil = |on: &str| if self.propagate { format!("{on}{on}") } else { on.to_owned() };
        match &self.value {
            VariantValue::Bool(true) => write!(f, "{}{}", sigil("+"), self.name),
            VariantValue::Bool(false) => write!(f, "{}{}", sigil("~"), self.name),
            VariantValue::Any => {
                write!(f, "{}{}{}", self.name, if self.propagate { "==" } else { "=" }, "*")
            }
            VariantValue::Single(value) => {
                write!(f, "{}{}{}", self.name, if self.propagate { "==" } else { "=" }, value)
            }
            VariantValue::Multi(values) => {
                write!(f, "{}{}", self.name, if self.propagate { "==" } else { "=" })?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

/// The variants of one spec node, kept sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariantMap {
    variants: IndexMap<String, Variant>,
}

impl VariantMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.variants.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variants.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values()
    }

    /// Inserts or replaces a variant, keeping name order canonical.
    pub fn insert(&mut self, variant: Variant) {
        self.variants.insert(variant.name.clone(), variant);
        self.variants.sort_unstable_keys();
    }

    pub fn remove(&mut self, name: &str) -> Option<Variant> {
        self.variants.shift_remove(name)
    }

    /// Every variant has a defined (non-wildcard) value.
    pub fn is_fully_defined(&self) -> bool {
        self.variants.values().all(|v| v.value.is_defined())
    }

    pub fn satisfies(&self, other: &VariantMap) -> bool {
        self.satisfies_with(other, true)
    }

    /// As [`satisfies`](Self::satisfies); `require_propagation = false`
    /// compares values only, for concrete specs whose propagation has
    /// been materialized.
    pub fn satisfies_with(&self, other: &VariantMap, require_propagation: bool) -> bool {
        other.variants.values().all(|required| {
            self.variants
                .get(required.name())
                .map(|mine| {
                    if require_propagation {
                        mine.satisfies(required)
                    } else {
                        mine.value_satisfies(required)
                    }
                })
                .unwrap_or(false)
        })
    }

    pub fn intersects(&self, other: &VariantMap) -> bool {
        other.variants.values().all(|theirs| {
            self.variants
                .get(theirs.name())
                .map(|mine| mine.intersects(theirs))
                .unwrap_or(true)
        })
    }

    pub fn constrain(&mut self, other: &VariantMap) -> Result<bool, VariantConflict> {
        let mut changed = false;
        for theirs in other.variants.values() {
            match self.variants.get_mut(theirs.name()) {
                Some(mine) => changed |= mine.constrain(theirs)?,
                None => {
                    self.insert(theirs.clone());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// The names of variants requesting propagation.
    pub fn propagated(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values().filter(|v| v.propagate)
    }
}

impl Display for VariantMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Booleans render inline (`+a~b`); valued variants follow,
        // space separated.
        for variant in self.variants.values() {
            if matches!(variant.value, VariantValue::Bool(_)) {
                write!(f, "{variant}")?;
            }
        }
        for variant in self.variants.values() {
            if !matches!(variant.value, VariantValue::Bool(_)) {
                write!(f, " {variant}")?;
            }
        }
        Ok(())
    }
}

/// The compiler-flag kinds, in canonical order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum FlagKind {
    Cflags,
    Cxxflags,
    Fflags,
    Ldflags,
    Ldlibs,
    Cppflags,
}

impl FlagKind {
    /// True when `name` names a flag kind rather than a variant.
    pub fn is_flag_name(name: &str) -> bool {
        FlagKind::from_str(name).is_ok()
    }
}

/// One compiler flag token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Flag {
    pub value: String,
    pub propagate: bool,
    /// The full flag string this token was written in, preserving the
    /// provenance of multi-flag requests like `cflags="-O3 -g"`.
    pub flag_group: String,
}

/// Ordered compiler flags per kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagMap {
    flags: IndexMap<FlagKind, Vec<Flag>>,
}

impl FlagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.values().all(Vec::is_empty)
    }

    pub fn get(&self, kind: FlagKind) -> &[Flag] {
        self.flags.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlagKind, &[Flag])> {
        self.flags.iter().map(|(kind, flags)| (*kind, flags.as_slice()))
    }

    /// Splits a raw flag string on whitespace and appends each token,
    /// remembering the whole string as the tokens' flag group.
    pub fn add_flags(&mut self, kind: FlagKind, raw: &str, propagate: bool) {
        let group = raw.to_owned();
        let entry = self.flags.entry(kind).or_default();
        for token in raw.split_whitespace() {
            if entry.iter().any(|f| f.value == token) {
                continue;
            }
            entry.push(Flag { value: token.to_owned(), propagate, flag_group: group.clone() });
        }
        self.flags.sort_unstable_keys();
    }

    pub(crate) fn set_flags(&mut self, kind: FlagKind, flags: Vec<Flag>) {
        self.flags.insert(kind, flags);
        self.flags.sort_unstable_keys();
    }

    /// Ordered union, left then right. When both sides carry the same
    /// token, the merged token propagates only if both sides do.
    pub fn constrain(&mut self, other: &FlagMap) -> bool {
        let mut changed = false;
        for (kind, theirs) in &other.flags {
            let entry = self.flags.entry(*kind).or_default();
            for flag in theirs {
                match entry.iter_mut().find(|mine| mine.value == flag.value) {
                    Some(mine) => {
                        let propagate = mine.propagate && flag.propagate;
                        if propagate != mine.propagate {
                            mine.propagate = propagate;
                            changed = true;
                        }
                    }
                    None => {
                        entry.push(flag.clone());
                        changed = true;
                    }
                }
            }
        }
        self.flags.sort_unstable_keys();
        changed
    }

    pub fn satisfies(&self, other: &FlagMap) -> bool {
        other.flags.iter().all(|(kind, theirs)| {
            let mine = self.get(*kind);
            theirs.iter().all(|required| {
                mine.iter()
                    .any(|f| f.value == required.value && (!required.propagate || f.propagate))
            })
        })
    }

    /// Flag constraints are "at least these tokens"; they always admit
    /// the ordered union, so two flag maps always intersect.
    pub fn intersects(&self, _other: &FlagMap) -> bool {
        true
    }
}

impl Display for FlagMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, flags) in &self.flags {
            if flags.is_empty() {
                continue;
            }
            if !first {
                write!(f, " ")?;
            }
            first = false;
            let propagate = flags.iter().all(|flag| flag.propagate);
            let mut joined = String::new();
            for (i, flag) in flags.iter().enumerate() {
                if i > 0 {
                    joined.push(' ');
                }
                let _ = write!(joined, "{}", flag.value);
            }
            let eq = if propagate { "==" } else { "=" };
            if joined.contains(' ') {
                write!(f, "{kind}{eq}\"{joined}\"")?;
            } else {
                write!(f, "{kind}{eq}{joined}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn bool_variant(name: &str, value: bool) -> Variant {
        Variant::new(name, VariantValue::Bool(value), false).unwrap()
    }

    fn valued(name: &str, payload: &str) -> Variant {
        Variant::new(name, VariantValue::from_payload(payload).unwrap(), false).unwrap()
    }

    #[test]
    fn boolean_satisfaction_is_equality() {
        assert!(bool_variant("mpi", true).satisfies(&bool_variant("mpi", true)));
        assert!(!bool_variant("mpi", true).satisfies(&bool_variant("mpi", false)));
        assert!(!bool_variant("mpi", true).intersects(&bool_variant("mpi", false)));
    }

    #[test]
    fn multi_valued_subset_semantics() {
        let present = valued("languages", "c,cxx,fortran");
        let required = valued("languages", "c,cxx");
        assert!(present.satisfies(&required));
        assert!(!required.satisfies(&present));
        assert!(required.intersects(&present));
    }

    #[test]
    fn wildcard_matches_any_defined_value() {
        let any = Variant::new("foo", VariantValue::Any, false).unwrap();
        assert!(valued("foo", "bar").satisfies(&any));
        assert!(!any.satisfies(&valued("foo", "bar")));
        assert_matches!(
            VariantValue::from_payload("a,*"),
            Err(VariantError::ReservedValue)
        );
    }

    #[test]
    fn propagation_on_reserved_names_is_rejected() {
        assert_matches!(
            Variant::new("patches", VariantValue::Bool(true), true),
            Err(VariantError::PropagationOnReserved(_))
        );
    }

    #[test]
    fn abstract_single_values_merge_to_multi() {
        let mut mine = valued("foo", "bar");
        let changed = mine.constrain(&valued("foo", "baz")).unwrap();
        assert!(changed);
        assert_eq!(mine.value, VariantValue::from_payload("bar,baz").unwrap());
    }

    #[test]
    fn conflicting_booleans_fail_to_constrain() {
        let mut map = VariantMap::new();
        map.insert(bool_variant("mpi", true));
        map.insert(bool_variant("shared", true));

        let mut other = VariantMap::new();
        other.insert(valued("foo", "bar"));
        assert!(map.constrain(&other).unwrap());
        assert!(map.contains("foo"));

        let mut conflict = VariantMap::new();
        conflict.insert(bool_variant("mpi", false));
        assert_matches!(map.constrain(&conflict), Err(VariantConflict { name, .. }) if name == "mpi");
    }

    #[test]
    fn propagation_weakened_by_non_propagating_flag() {
        let mut mine = FlagMap::new();
        mine.add_flags(FlagKind::Cflags, "-O2", true);
        let mut theirs = FlagMap::new();
        theirs.add_flags(FlagKind::Cflags, "-O2 -g", false);

        assert!(mine.constrain(&theirs));
        let flags = mine.get(FlagKind::Cflags);
        assert_eq!(flags.len(), 2);
        assert!(!flags[0].propagate);
        assert_eq!(flags[0].value, "-O2");
        assert_eq!(flags[1].value, "-g");
        assert_eq!(flags[1].flag_group, "-O2 -g");
    }

    #[test]
    fn flag_map_display_quotes_multi_token_groups() {
        let mut flags = FlagMap::new();
        flags.add_flags(FlagKind::Cflags, "-O2 -g", false);
        flags.add_flags(FlagKind::Ldflags, "-lm", false);
        assert_eq!(flags.to_string(), "cflags=\"-O2 -g\" ldflags=-lm");
    }
}
