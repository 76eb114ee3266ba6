//! The architecture tuple: `(platform, os, target)`.
//!
//! Every axis may be absent on an abstract spec. The target axis is a
//! union of single microarchitectures and ranges over the
//! microarchitecture partial order; see [`microarch`].

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

pub mod microarch;

use microarch::{target_cmp, target_le};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseArchError {
    #[error("unknown platform `{0}`")]
    UnknownPlatform(String),
    #[error("architecture `{0}` has too many fields")]
    TooManyFields(String),
    #[error("target range `{0}` is empty")]
    EmptyTargetRange(String),
    #[error("empty target")]
    EmptyTarget,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
    Freebsd,
    /// Used by tests and mock repositories.
    Test,
}

/// One element of a target constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetElement {
    Single(String),
    Range { lo: Option<String>, hi: Option<String> },
}

impl TargetElement {
    fn contains(&self, name: &str) -> bool {
        match self {
            TargetElement::Single(s) => s == name,
            TargetElement::Range { lo, hi } => {
                lo.as_deref().map(|lo| target_le(lo, name)).unwrap_or(true)
                    && hi.as_deref().map(|hi| target_le(name, hi)).unwrap_or(true)
            }
        }
    }

    fn is_subset_of(&self, other: &TargetElement) -> bool {
        match (self, other) {
            (TargetElement::Single(a), TargetElement::Single(b)) => a == b,
            (TargetElement::Single(a), range) => range.contains(a),
            (TargetElement::Range { lo, hi }, TargetElement::Range { lo: olo, hi: ohi }) => {
                let lo_ok = match (olo, lo) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(theirs), Some(ours)) => target_le(theirs, ours),
                };
                let hi_ok = match (ohi, hi) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(theirs), Some(ours)) => target_le(ours, theirs),
                };
                lo_ok && hi_ok
            }
            (TargetElement::Range { .. }, TargetElement::Single(_)) => false,
        }
    }

    /// Componentwise intersection over the family order; `None` when
    /// the bounds are incomparable or the result is empty.
    fn intersection(&self, other: &TargetElement) -> Option<TargetElement> {
        match (self, other) {
            (TargetElement::Single(a), TargetElement::Single(b)) => {
                (a == b).then(|| self.clone())
            }
            (TargetElement::Single(a), range) | (range, TargetElement::Single(a)) => {
                range.contains(a).then(|| TargetElement::Single(a.clone()))
            }
            (
                TargetElement::Range { lo: alo, hi: ahi },
                TargetElement::Range { lo: blo, hi: bhi },
            ) => {
                let lo = match (alo, blo) {
                    (None, other) | (other, None) => other.clone(),
                    (Some(a), Some(b)) => match target_cmp(a, b)? {
                        Ordering::Less => Some(b.clone()),
                        _ => Some(a.clone()),
                    },
                };
                let hi = match (ahi, bhi) {
                    (None, other) | (other, None) => other.clone(),
                    (Some(a), Some(b)) => match target_cmp(a, b)? {
                        Ordering::Greater => Some(b.clone()),
                        _ => Some(a.clone()),
                    },
                };
                if let (Some(lo), Some(hi)) = (&lo, &hi) {
                    if !target_le(lo, hi) {
                        return None;
                    }
                }
                Some(TargetElement::Range { lo, hi })
            }
        }
    }
}

impl Display for TargetElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TargetElement::Single(s) => write!(f, "{s}"),
            TargetElement::Range { lo, hi } => write!(
                f,
                "{}:{}",
                lo.as_deref().unwrap_or(""),
                hi.as_deref().unwrap_or("")
            ),
        }
    }
}

/// A target constraint: a comma-separated union of elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSpec {
    elements: Vec<TargetElement>,
}

impl TargetSpec {
    pub fn single(name: impl Into<String>) -> Self {
        Self { elements: vec![TargetElement::Single(name.into())] }
    }

    pub fn elements(&self) -> &[TargetElement] {
        &self.elements
    }

    /// A single microarchitecture, as required of a concrete spec.
    pub fn as_single(&self) -> Option<&str> {
        match self.elements.as_slice() {
            [TargetElement::Single(name)] => Some(name),
            _ => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.as_single().is_some()
    }

    pub fn satisfies(&self, other: &TargetSpec) -> bool {
        self.elements
            .iter()
            .all(|mine| other.elements.iter().any(|theirs| mine.is_subset_of(theirs)))
    }

    pub fn intersects(&self, other: &TargetSpec) -> bool {
        self.elements
            .iter()
            .any(|mine| other.elements.iter().any(|theirs| mine.intersection(theirs).is_some()))
    }

    pub fn intersection(&self, other: &TargetSpec) -> Option<TargetSpec> {
        let elements: Vec<TargetElement> = self
            .elements
            .iter()
            .flat_map(|mine| {
                other.elements.iter().filter_map(move |theirs| mine.intersection(theirs))
            })
            .collect();
        if elements.is_empty() {
            None
        } else {
            Some(TargetSpec { elements })
        }
    }
}

impl Display for TargetSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

impl FromStr for TargetSpec {
    type Err = ParseArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseArchError::EmptyTarget);
        }
        let mut elements = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if let Some((lo, hi)) = part.split_once(':') {
                let lo = (!lo.is_empty()).then(|| lo.to_owned());
                let hi = (!hi.is_empty()).then(|| hi.to_owned());
                if let (Some(lo), Some(hi)) = (&lo, &hi) {
                    if !target_le(lo, hi) {
                        return Err(ParseArchError::EmptyTargetRange(part.to_owned()));
                    }
                }
                elements.push(TargetElement::Range { lo, hi });
            } else if part.is_empty() {
                return Err(ParseArchError::EmptyTarget);
            } else {
                elements.push(TargetElement::Single(part.to_owned()));
            }
        }
        Ok(TargetSpec { elements })
    }
}

/// The `(platform, os, target)` tuple of one spec node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchSpec {
    pub platform: Option<Platform>,
    pub os: Option<String>,
    pub target: Option<TargetSpec>,
}

impl ArchSpec {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    /// All three axes set, with a single microarchitecture target.
    pub fn is_concrete(&self) -> bool {
        self.platform.is_some()
            && self.os.is_some()
            && self.target.as_ref().map(TargetSpec::is_concrete).unwrap_or(false)
    }

    pub fn satisfies(&self, other: &ArchSpec) -> bool {
        let platform_ok = match (&self.platform, &other.platform) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a == b,
        };
        let os_ok = match (&self.os, &other.os) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a == b,
        };
        let target_ok = match (&self.target, &other.target) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a.satisfies(b),
        };
        platform_ok && os_ok && target_ok
    }

    pub fn intersects(&self, other: &ArchSpec) -> bool {
        let platform_ok = match (&self.platform, &other.platform) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let os_ok = match (&self.os, &other.os) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let target_ok = match (&self.target, &other.target) {
            (Some(a), Some(b)) => a.intersects(b),
            _ => true,
        };
        platform_ok && os_ok && target_ok
    }

    /// Fills missing axes from `other` and narrows target ranges.
    /// Returns whether `self` changed; `None` on empty intersection.
    pub fn constrain(&mut self, other: &ArchSpec) -> Option<bool> {
        if !self.intersects(other) {
            return None;
        }
        let mut changed = false;
        if self.platform.is_none() && other.platform.is_some() {
            self.platform = other.platform;
            changed = true;
        }
        if self.os.is_none() && other.os.is_some() {
            self.os = other.os.clone();
            changed = true;
        }
        match (&mut self.target, &other.target) {
            (Some(mine), Some(theirs)) => {
                let narrowed = mine.intersection(theirs)?;
                if narrowed != *mine {
                    *mine = narrowed;
                    changed = true;
                }
            }
            (None, Some(theirs)) => {
                self.target = Some(theirs.clone());
                changed = true;
            }
            _ => {}
        }
        Some(changed)
    }
}

impl Display for ArchSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let platform = self.platform.map(|p| p.to_string());
        write!(
            f,
            "{}-{}-{}",
            platform.as_deref().unwrap_or("None"),
            self.os.as_deref().unwrap_or("None"),
            self.target.as_ref().map(|t| t.to_string()).as_deref().unwrap_or("None"),
        )
    }
}

impl FromStr for ArchSpec {
    type Err = ParseArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() > 3 {
            return Err(ParseArchError::TooManyFields(s.to_owned()));
        }
        let unset = |p: &str| p.is_empty() || p == "None" || p == "none";
        let mut arch = ArchSpec::default();
        if let Some(platform) = parts.first().filter(|p| !unset(p)) {
            arch.platform = Some(
                Platform::from_str(platform)
                    .map_err(|_| ParseArchError::UnknownPlatform((*platform).to_owned()))?,
            );
        }
        if let Some(os) = parts.get(1).filter(|p| !unset(p)) {
            arch.os = Some((*os).to_owned());
        }
        if let Some(target) = parts.get(2).filter(|p| !unset(p)) {
            arch.target = Some(target.parse()?);
        }
        Ok(arch)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arch(s: &str) -> ArchSpec {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        let a = arch("linux-ubuntu22.04-x86_64");
        assert_eq!(a.platform, Some(Platform::Linux));
        assert_eq!(a.os.as_deref(), Some("ubuntu22.04"));
        assert_eq!(a.to_string(), "linux-ubuntu22.04-x86_64");
        assert!(a.is_concrete());

        let partial = arch("linux");
        assert_eq!(partial.to_string(), "linux-None-None");
        assert!(!partial.is_concrete());
    }

    #[test]
    fn target_range_membership() {
        let range: TargetSpec = "x86_64:haswell".parse().unwrap();
        assert!(TargetSpec::single("sandybridge").satisfies(&range));
        assert!(TargetSpec::single("haswell").satisfies(&range));
        assert!(!TargetSpec::single("skylake").satisfies(&range));
        assert!(!TargetSpec::single("zen2").satisfies(&range));
    }

    #[test]
    fn target_intersection_narrows() {
        let a: TargetSpec = "nehalem:skylake".parse().unwrap();
        let b: TargetSpec = "haswell:".parse().unwrap();
        let both = a.intersection(&b).unwrap();
        assert_eq!(both.to_string(), "haswell:skylake");

        let disjoint: TargetSpec = "zen:zen4".parse().unwrap();
        assert!(a.intersection(&disjoint).is_none());
    }

    #[test]
    fn constrain_fills_missing_axes() {
        let mut a = arch("linux--x86_64:");
        let changed = a.constrain(&arch("linux-ubuntu22.04-skylake")).unwrap();
        assert!(changed);
        assert_eq!(a.to_string(), "linux-ubuntu22.04-skylake");

        assert!(a.constrain(&arch("darwin")).is_none());
    }

    #[test]
    fn union_targets() {
        let union: TargetSpec = "skylake,zen2".parse().unwrap();
        assert!(TargetSpec::single("zen2").satisfies(&union));
        assert!(union.intersects(&TargetSpec::single("skylake")));
        assert!(!TargetSpec::single("ppc64le").satisfies(&union));
    }
}
