//! Version types and the version algebra.
//!
//! A version is one of four things: a [`StandardVersion`] (an ordered
//! tuple of numeric and alphabetic components plus an optional
//! prerelease), a [`GitVersion`] (a repository ref with a lazily
//! resolved standard version), a [`VersionRange`] (a half-open interval
//! over standard versions) or a [`VersionList`] (a sorted, disjoint
//! union of the former three). The [`Version`] sum type dispatches the
//! algebra operations over every pairing so that a missing case is a
//! compile error rather than a runtime surprise.
//!
//! Ordering of standard versions is lexicographic on the release tuple,
//! then on the prerelease. Alphabetic components compare below numeric
//! ones, with the exception of the "infinity" tokens (`develop`, `main`,
//! `master`, `head`, `trunk`) which compare above every numeral and
//! among themselves in that fixed order, `develop` being the greatest:
//!
//! ```txt
//!      1.2 < 1.2.1 < 1.3-alpha < 1.3-alpha2 < 1.3-beta < 1.3-rc1
//!    < 1.3 < 2.0 < trunk < head < master < main < develop
//! ```

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter, Write as _};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

mod parse;

pub use parse::{ParseVersionError, ParseVersionErrorKind};

/// Alphabetic tokens that compare greater than every numeric component.
/// Earlier entries are greater: `develop > main > master > head > trunk`.
pub const INFINITY_TOKENS: &[&str] = &["develop", "main", "master", "head", "trunk"];

/// A single component of a version's release tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionComponent {
    /// A numeric component, e.g. the `2` in `1.2`.
    Numeral(u64),
    /// A plain alphabetic component, e.g. the `p1` suffix token in `2.4.p1`.
    Token(Box<str>),
    /// An infinity token, stored as its index into [`INFINITY_TOKENS`].
    Infinity(usize),
}

impl VersionComponent {
    pub(crate) fn from_token(token: &str) -> Self {
        match INFINITY_TOKENS.iter().position(|t| *t == token) {
            Some(index) => VersionComponent::Infinity(index),
            None => VersionComponent::Token(token.into()),
        }
    }

    pub fn as_numeral(&self) -> Option<u64> {
        match self {
            VersionComponent::Numeral(n) => Some(*n),
            _ => None,
        }
    }
}

impl Ord for VersionComponent {
    fn cmp(&self, other: &Self) -> Ordering {
        use VersionComponent::*;
        match (self, other) {
            (Numeral(a), Numeral(b)) => a.cmp(b),
            (Token(a), Token(b)) => a.cmp(b),
            // Lower index in INFINITY_TOKENS is the greater version.
            (Infinity(a), Infinity(b)) => b.cmp(a),
            (Infinity(_), _) => Ordering::Greater,
            (_, Infinity(_)) => Ordering::Less,
            (Numeral(_), Token(_)) => Ordering::Greater,
            (Token(_), Numeral(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for VersionComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for VersionComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VersionComponent::Numeral(n) => write!(f, "{n}"),
            VersionComponent::Token(t) => write!(f, "{t}"),
            VersionComponent::Infinity(i) => write!(f, "{}", INFINITY_TOKENS[*i]),
        }
    }
}

/// The prerelease part of a standard version. `Final` is the release
/// itself and orders above every prerelease of the same release tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prerelease {
    Alpha(Option<u64>),
    Beta(Option<u64>),
    Rc(Option<u64>),
    Final,
}

impl Prerelease {
    /// The successor used when desugaring `@X` into `[X, next(X))`.
    fn next(self) -> Prerelease {
        match self {
            Prerelease::Alpha(Some(n)) => Prerelease::Alpha(Some(n + 1)),
            Prerelease::Alpha(None) => Prerelease::Beta(None),
            Prerelease::Beta(Some(n)) => Prerelease::Beta(Some(n + 1)),
            Prerelease::Beta(None) => Prerelease::Rc(None),
            Prerelease::Rc(Some(n)) => Prerelease::Rc(Some(n + 1)),
            Prerelease::Rc(None) | Prerelease::Final => Prerelease::Final,
        }
    }
}

impl Display for Prerelease {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (token, n) = match self {
            Prerelease::Alpha(n) => ("alpha", n),
            Prerelease::Beta(n) => ("beta", n),
            Prerelease::Rc(n) => ("rc", n),
            Prerelease::Final => return Ok(()),
        };
        match n {
            Some(n) => write!(f, "{token}{n}"),
            None => write!(f, "{token}"),
        }
    }
}

/// A parsed version string such as `1.2.0` or `2.0-rc1`.
///
/// The original string is retained so that `Display` round-trips
/// byte-for-byte, but equality, ordering and hashing are defined on the
/// parsed `(release, prerelease)` pair: `1.0` and `1_0` are equal.
#[derive(Debug, Clone)]
pub struct StandardVersion {
    original: Box<str>,
    release: SmallVec<[VersionComponent; 4]>,
    prerelease: Prerelease,
}

impl StandardVersion {
    pub(crate) fn new(
        original: Box<str>,
        release: SmallVec<[VersionComponent; 4]>,
        prerelease: Prerelease,
    ) -> Self {
        Self { original, release, prerelease }
    }

    /// Builds a version from parts, synthesizing a canonical string.
    pub(crate) fn from_parts(
        release: SmallVec<[VersionComponent; 4]>,
        prerelease: Prerelease,
    ) -> Self {
        let original = rebuild_string(&release, prerelease).into_boxed_str();
        Self { original, release, prerelease }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn release(&self) -> &[VersionComponent] {
        &self.release
    }

    pub fn prerelease(&self) -> Prerelease {
        self.prerelease
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease != Prerelease::Final
    }

    /// The least version strictly greater than `self` and every version
    /// prefixed by `self`. Used to desugar `@X` and `@X:Y` into
    /// half-open intervals. Returns `None` when no such version exists
    /// (the top infinity token).
    pub fn next(&self) -> Option<StandardVersion> {
        if self.prerelease != Prerelease::Final {
            return Some(Self::from_parts(self.release.clone(), self.prerelease.next()));
        }
        let mut release = self.release.clone();
        match release.last_mut() {
            Some(VersionComponent::Numeral(n)) => *n += 1,
            Some(VersionComponent::Token(t)) => {
                let mut bumped = t.to_string();
                bumped.push('a');
                *t = bumped.into_boxed_str();
            }
            Some(VersionComponent::Infinity(i)) => {
                if *i == 0 {
                    return None;
                }
                *i -= 1;
            }
            None => return None,
        }
        Some(Self::from_parts(release, Prerelease::Final))
    }

    /// The version truncated to its first `n` release components:
    /// `1.2.3`.up_to(2) is `1.2`.
    pub fn up_to(&self, n: usize) -> StandardVersion {
        if n >= self.release.len() {
            return self.clone();
        }
        Self::from_parts(self.release.iter().take(n).cloned().collect(), Prerelease::Final)
    }

    /// Appends the `-git.<distance>` suffix that orders a resolved git
    /// ref strictly above its nearest reachable tag.
    pub(crate) fn with_git_distance(&self, distance: u64) -> StandardVersion {
        let mut release = self.release.clone();
        release.push(VersionComponent::Token("git".into()));
        release.push(VersionComponent::Numeral(distance));
        let original = format!("{}-git.{}", self.original, distance).into_boxed_str();
        Self { original, release, prerelease: self.prerelease }
    }
}

fn rebuild_string(release: &[VersionComponent], prerelease: Prerelease) -> String {
    let mut out = String::new();
    for (i, component) in release.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        let _ = write!(out, "{component}");
    }
    if prerelease != Prerelease::Final {
        if !out.is_empty() {
            out.push('-');
        }
        let _ = write!(out, "{prerelease}");
    }
    out
}

impl PartialEq for StandardVersion {
    fn eq(&self, other: &Self) -> bool {
        self.release == other.release && self.prerelease == other.prerelease
    }
}

impl Eq for StandardVersion {}

impl Hash for StandardVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.release.hash(state);
        self.prerelease.hash(state);
    }
}

impl Ord for StandardVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        for pair in self.release.iter().zip_longest(other.release.iter()) {
            match pair {
                EitherOrBoth::Both(a, b) => match a.cmp(b) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                },
                EitherOrBoth::Left(_) => return Ordering::Greater,
                EitherOrBoth::Right(_) => return Ordering::Less,
            }
        }
        self.prerelease.cmp(&other.prerelease)
    }
}

impl PartialOrd for StandardVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for StandardVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl FromStr for StandardVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_standard_version(s)
    }
}

impl Serialize for StandardVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for StandardVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A version referring to a git ref (branch, tag or commit) rather than
/// a released version.
///
/// A git version never *equals* a standard version, but it may satisfy
/// one: comparisons against standard versions go through the resolved
/// [`ref_version`](GitVersion::ref_version), which is either asserted by
/// the user (`foo@git.main=2.1`) or produced by the package repository's
/// ref resolver at concretization time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitVersion {
    ref_str: String,
    ref_version: Option<StandardVersion>,
}

impl GitVersion {
    pub fn new(ref_str: impl Into<String>, ref_version: Option<StandardVersion>) -> Self {
        Self { ref_str: ref_str.into(), ref_version }
    }

    pub fn ref_str(&self) -> &str {
        &self.ref_str
    }

    pub fn ref_version(&self) -> Option<&StandardVersion> {
        self.ref_version.as_ref()
    }

    /// True when the ref looks like a full commit sha.
    pub fn is_commit_sha(&self) -> bool {
        self.ref_str.len() == 40
            && self.ref_str.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Records the result of ref resolution: the nearest reachable tag
    /// and the commit distance to it. A positive distance appends a
    /// `-git.<distance>` suffix, ordering the ref above the tag but
    /// below the tag's successor.
    pub fn resolve(&mut self, nearest_tag: StandardVersion, distance: u64) {
        self.ref_version = Some(if distance == 0 {
            nearest_tag
        } else {
            nearest_tag.with_git_distance(distance)
        });
    }

    pub fn is_resolved(&self) -> bool {
        self.ref_version.is_some()
    }
}

impl Display for GitVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_commit_sha() {
            write!(f, "{}", self.ref_str)?;
        } else {
            write!(f, "git.{}", self.ref_str)?;
        }
        // A concrete git version always prints its resolution so that
        // round-trips preserve identity.
        if let Some(version) = &self.ref_version {
            write!(f, "={version}")?;
        }
        Ok(())
    }
}

/// A contiguous interval of standard versions.
///
/// Both bounds are optional; a missing bound is the corresponding
/// extreme of the version lattice. The stored `hi` is the version the
/// user wrote: the interval it denotes is `[lo, next(hi))`, so
/// `2.1:2.5` contains `2.5` and `2.5.3` but not `2.6`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    lo: Option<StandardVersion>,
    hi: Option<StandardVersion>,
}

impl VersionRange {
    /// Builds a range, rejecting empty intervals (`hi < lo`).
    pub fn new(
        lo: Option<StandardVersion>,
        hi: Option<StandardVersion>,
    ) -> Result<Self, ParseVersionError> {
        let range = Self { lo, hi };
        if range.is_empty() {
            return Err(ParseVersionError::empty_range(&range.to_string()));
        }
        Ok(range)
    }

    /// The whole lattice, `:`.
    pub fn any() -> Self {
        Self { lo: None, hi: None }
    }

    /// The prefix range `[v, next(v))` denoted by a bare `@v`.
    pub fn prefix(v: StandardVersion) -> Self {
        Self { lo: Some(v.clone()), hi: Some(v) }
    }

    pub fn lo(&self) -> Option<&StandardVersion> {
        self.lo.as_ref()
    }

    pub fn hi(&self) -> Option<&StandardVersion> {
        self.hi.as_ref()
    }

    /// The exclusive upper bound; `None` is unbounded.
    fn upper(&self) -> Option<StandardVersion> {
        self.hi.as_ref().and_then(StandardVersion::next)
    }

    fn is_empty(&self) -> bool {
        match (&self.lo, self.upper()) {
            (Some(lo), Some(upper)) => *lo >= upper,
            _ => false,
        }
    }

    pub fn contains(&self, v: &StandardVersion) -> bool {
        if let Some(lo) = &self.lo {
            if v < lo {
                return false;
            }
        }
        match self.upper() {
            Some(upper) => *v < upper,
            None => true,
        }
    }

    pub fn intersects(&self, other: &VersionRange) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &VersionRange) -> Option<VersionRange> {
        let lo = match (&self.lo, &other.lo) {
            (None, lo) | (lo, None) => lo.clone(),
            (Some(a), Some(b)) => Some(if a >= b { a.clone() } else { b.clone() }),
        };
        let hi = match (self.upper(), other.upper()) {
            (None, None) => None,
            (Some(_), None) => self.hi.clone(),
            (None, Some(_)) => other.hi.clone(),
            (Some(a), Some(b)) => {
                if a <= b {
                    self.hi.clone()
                } else {
                    other.hi.clone()
                }
            }
        };
        let range = VersionRange { lo, hi };
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    pub fn is_subset_of(&self, other: &VersionRange) -> bool {
        let lo_ok = match (&other.lo, &self.lo) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(theirs), Some(ours)) => theirs <= ours,
        };
        let hi_ok = match (self.upper(), other.upper()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(ours), Some(theirs)) => ours <= theirs,
        };
        lo_ok && hi_ok
    }

    /// True when `other` starts at or before the point just past this
    /// range, i.e. the two can be coalesced into one interval.
    fn touches(&self, other: &VersionRange) -> bool {
        match (self.upper(), &other.lo) {
            (None, _) | (_, None) => true,
            (Some(upper), Some(lo)) => *lo <= upper,
        }
    }

    fn merged_with(&self, other: &VersionRange) -> VersionRange {
        let lo = match (&self.lo, &other.lo) {
            (None, _) | (_, None) => None,
            (Some(a), Some(b)) => Some(if a <= b { a.clone() } else { b.clone() }),
        };
        let hi = match (self.upper(), other.upper()) {
            // An unbounded side wins over any finite bound.
            (None, _) | (_, None) => None,
            (Some(a), Some(b)) => {
                if a >= b {
                    self.hi.clone()
                } else {
                    other.hi.clone()
                }
            }
        };
        VersionRange { lo, hi }
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.lo, &self.hi) {
            // A prefix range prints as the bare version it came from.
            (Some(lo), Some(hi)) if lo == hi => write!(f, "{lo}"),
            (Some(lo), Some(hi)) => write!(f, "{lo}:{hi}"),
            (Some(lo), None) => write!(f, "{lo}:"),
            (None, Some(hi)) => write!(f, ":{hi}"),
            (None, None) => write!(f, ":"),
        }
    }
}

/// The version sum type: the value of a spec's `@` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// An exact standard version, written `=1.2` in list position.
    Standard(StandardVersion),
    /// A git ref version.
    Git(GitVersion),
    /// An interval.
    Range(VersionRange),
    /// A union of the above.
    List(Box<VersionList>),
}

impl Version {
    pub fn is_concrete(&self) -> bool {
        match self {
            Version::Standard(_) | Version::Git(_) => true,
            Version::Range(_) => false,
            Version::List(list) => list.is_concrete(),
        }
    }

    pub fn satisfies(&self, other: &Version) -> bool {
        VersionList::from_version(self.clone()).satisfies(&VersionList::from_version(other.clone()))
    }

    pub fn intersects(&self, other: &Version) -> bool {
        VersionList::from_version(self.clone()).intersects(&VersionList::from_version(other.clone()))
    }

    /// Sort key used to keep version lists canonical: elements order by
    /// their lowest member, unresolved git refs after everything else.
    fn element_cmp(&self, other: &Version) -> Ordering {
        fn key(v: &Version) -> (u8, Option<&StandardVersion>, &str) {
            match v {
                Version::Range(r) => match r.lo() {
                    Some(lo) => (1, Some(lo), ""),
                    None => (0, None, ""),
                },
                Version::Standard(s) => (1, Some(s), ""),
                Version::Git(g) => match g.ref_version() {
                    Some(v) => (1, Some(v), g.ref_str()),
                    None => (2, None, g.ref_str()),
                },
                Version::List(_) => (3, None, ""),
            }
        }
        let (ka, va, sa) = key(self);
        let (kb, vb, sb) = key(other);
        ka.cmp(&kb).then_with(|| va.cmp(&vb)).then_with(|| sa.cmp(sb))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            // Exactness is part of the surface syntax: a plain `1.2`
            // parses back as a prefix range, so a pinned version must
            // print its `=`.
            Version::Standard(v) => write!(f, "={v}"),
            Version::Git(v) => write!(f, "{v}"),
            Version::Range(r) => write!(f, "{r}"),
            Version::List(l) => write!(f, "{l}"),
        }
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_version_element(s)
    }
}

/// A sorted, disjoint union of versions and ranges.
///
/// The canonical form invariant holds at all times: elements are sorted
/// by [`Version::element_cmp`] and no two elements overlap or touch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionList {
    elements: SmallVec<[Version; 1]>,
}

impl VersionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unconstrained list, equivalent to `@:`.
    pub fn any() -> Self {
        let mut list = Self::new();
        list.insert(Version::Range(VersionRange::any()));
        list
    }

    pub fn from_version(v: Version) -> Self {
        match v {
            Version::List(list) => *list,
            element => {
                let mut list = Self::new();
                list.insert(element);
                list
            }
        }
    }

    pub fn elements(&self) -> &[Version] {
        &self.elements
    }

    pub(crate) fn elements_mut(&mut self) -> &mut SmallVec<[Version; 1]> {
        &mut self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when the list pins exactly one concrete version.
    pub fn is_concrete(&self) -> bool {
        self.elements.len() == 1
            && matches!(self.elements[0], Version::Standard(_) | Version::Git(_))
    }

    /// The single concrete version, if [`is_concrete`](Self::is_concrete).
    pub fn as_concrete(&self) -> Option<&Version> {
        if self.is_concrete() {
            self.elements.first()
        } else {
            None
        }
    }

    /// True when this list places no constraint at all.
    pub fn is_any(&self) -> bool {
        matches!(
            self.elements.as_slice(),
            [Version::Range(r)] if r.lo().is_none() && r.hi().is_none()
        )
    }

    /// Inserts an element, keeping the list sorted and coalescing
    /// adjacent or overlapping members.
    pub fn insert(&mut self, v: Version) {
        match v {
            Version::List(list) => {
                for element in list.elements {
                    self.insert(element);
                }
                return;
            }
            _ => {}
        }
        let position = self
            .elements
            .iter()
            .position(|e| v.element_cmp(e) == Ordering::Less)
            .unwrap_or(self.elements.len());
        self.elements.insert(position, v);
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.elements.len() {
            let merged = merge_elements(&self.elements[i], &self.elements[i + 1]);
            match merged {
                Some(merged) => {
                    self.elements[i] = merged;
                    self.elements.remove(i + 1);
                }
                None => i += 1,
            }
        }
    }

    pub fn union(&self, other: &VersionList) -> VersionList {
        let mut result = self.clone();
        for element in &other.elements {
            result.insert(element.clone());
        }
        result
    }

    /// The intersection of two lists; empty when they do not intersect.
    pub fn intersection(&self, other: &VersionList) -> VersionList {
        let mut result = VersionList::new();
        for a in &self.elements {
            for b in &other.elements {
                if let Some(common) = intersect_elements(a, b) {
                    result.insert(common);
                }
            }
        }
        result
    }

    /// Does every version admitted by `self` also satisfy `other`?
    pub fn satisfies(&self, other: &VersionList) -> bool {
        self.elements
            .iter()
            .all(|a| other.elements.iter().any(|b| element_is_subset(a, b)))
    }

    /// Is there at least one version admitted by both?
    pub fn intersects(&self, other: &VersionList) -> bool {
        self.elements
            .iter()
            .any(|a| other.elements.iter().any(|b| intersect_elements(a, b).is_some()))
    }

    /// The greatest version mentioned by this list, used for display
    /// preferences; unbounded ranges yield `None`.
    pub fn highest(&self) -> Option<&StandardVersion> {
        self.elements.iter().rev().find_map(|e| match e {
            Version::Standard(v) => Some(v),
            Version::Git(g) => g.ref_version(),
            Version::Range(r) => r.hi(),
            Version::List(_) => None,
        })
    }

    /// The version a solver would prefer absent other constraints: the
    /// greatest non-infinity version, falling back to the greatest.
    pub fn preferred(&self) -> Option<&StandardVersion> {
        let released = self.elements.iter().rev().find_map(|e| match e {
            Version::Standard(v) | Version::Git(GitVersion { ref_version: Some(v), .. })
                if !matches!(v.release().first(), Some(VersionComponent::Infinity(_))) =>
            {
                Some(v)
            }
            Version::Range(r) => r
                .hi()
                .filter(|v| !matches!(v.release().first(), Some(VersionComponent::Infinity(_)))),
            _ => None,
        });
        released.or_else(|| self.highest())
    }
}

fn merge_elements(a: &Version, b: &Version) -> Option<Version> {
    match (a, b) {
        (Version::Range(ra), Version::Range(rb)) => {
            if ra.touches(rb) {
                Some(Version::Range(ra.merged_with(rb)))
            } else {
                None
            }
        }
        (Version::Range(r), Version::Standard(v)) | (Version::Standard(v), Version::Range(r)) => {
            if r.contains(v) {
                Some(Version::Range(r.clone()))
            } else {
                None
            }
        }
        (Version::Standard(va), Version::Standard(vb)) if va == vb => Some(a.clone()),
        (Version::Git(ga), Version::Git(gb)) if ga == gb => Some(a.clone()),
        _ => None,
    }
}

fn intersect_elements(a: &Version, b: &Version) -> Option<Version> {
    match (a, b) {
        (Version::Standard(va), Version::Standard(vb)) => (va == vb).then(|| a.clone()),
        (Version::Standard(v), Version::Range(r)) | (Version::Range(r), Version::Standard(v)) => {
            r.contains(v).then(|| Version::Standard(v.clone()))
        }
        (Version::Range(ra), Version::Range(rb)) => ra.intersection(rb).map(Version::Range),
        (Version::Git(ga), Version::Git(gb)) => (ga == gb).then(|| a.clone()),
        // A git version never equals a standard version, but the two
        // intersect when the resolved ref version matches.
        (Version::Git(g), Version::Standard(v)) | (Version::Standard(v), Version::Git(g)) => g
            .ref_version()
            .filter(|rv| *rv == v)
            .map(|_| Version::Git(g.clone())),
        (Version::Git(g), Version::Range(r)) | (Version::Range(r), Version::Git(g)) => g
            .ref_version()
            .filter(|rv| r.contains(rv))
            .map(|_| Version::Git(g.clone())),
        (Version::List(_), _) | (_, Version::List(_)) => None,
    }
}

fn element_is_subset(a: &Version, b: &Version) -> bool {
    match (a, b) {
        (Version::Standard(va), Version::Standard(vb)) => va == vb,
        (Version::Standard(v), Version::Range(r)) => r.contains(v),
        (Version::Range(ra), Version::Range(rb)) => ra.is_subset_of(rb),
        (Version::Git(ga), Version::Git(gb)) => ga == gb,
        (Version::Git(g), Version::Standard(v)) => g.ref_version() == Some(v),
        (Version::Git(g), Version::Range(r)) => {
            g.ref_version().map(|rv| r.contains(rv)).unwrap_or(false)
        }
        // A range admits versions a concrete element does not name.
        (Version::Range(_), Version::Standard(_) | Version::Git(_)) => false,
        (Version::Standard(_), Version::Git(_)) => false,
        (Version::List(_), _) | (_, Version::List(_)) => false,
    }
}

impl Display for VersionList {
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

impl FromStr for VersionList {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_version_list(s)
    }
}

impl Serialize for VersionList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.elements.len()))?;
        for element in &self.elements {
            seq.serialize_element(&element.to_string())?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for VersionList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        let mut list = VersionList::new();
        for text in texts {
            list.insert(text.parse().map_err(serde::de::Error::custom)?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn v(s: &str) -> StandardVersion {
        s.parse().unwrap()
    }

    fn vl(s: &str) -> VersionList {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("1.2", "1.2.1")]
    #[case("1.2.1", "1.3-alpha")]
    #[case("1.3-alpha", "1.3-alpha2")]
    #[case("1.3-alpha2", "1.3-beta")]
    #[case("1.3-beta", "1.3-rc1")]
    #[case("1.3-rc1", "1.3")]
    #[case("1.3", "2.0")]
    #[case("2.0", "trunk")]
    #[case("trunk", "head")]
    #[case("head", "master")]
    #[case("master", "main")]
    #[case("main", "develop")]
    #[case("1.2a", "1.2.0")]
    #[case("2.4.p1", "2.4.0")]
    fn ordering(#[case] lesser: &str, #[case] greater: &str) {
        assert!(v(lesser) < v(greater), "{lesser} should be < {greater}");
    }

    #[test]
    fn separator_insensitive_equality() {
        assert_eq!(v("1.0"), v("1_0"));
        assert_eq!(v("1.0"), v("1-0"));
        assert_ne!(v("1.0"), v("1.0.0"));
    }

    #[test]
    fn next_bumps_last_component() {
        assert_eq!(v("1.2").next().unwrap(), v("1.3"));
        assert_eq!(v("1.2.9").next().unwrap(), v("1.2.10"));
        assert_eq!(v("trunk").next().unwrap(), v("head"));
        assert!(v("develop").next().is_none());
    }

    #[test]
    fn prefix_range_contains_suffixed_versions() {
        let range = VersionRange::prefix(v("1.2"));
        assert!(range.contains(&v("1.2")));
        assert!(range.contains(&v("1.2.5")));
        assert!(!range.contains(&v("1.3")));
        assert!(!range.contains(&v("1.1")));
    }

    #[test]
    fn range_intersection() {
        let a = VersionRange::new(Some(v("0")), Some(v("2.5"))).unwrap();
        let b = VersionRange::new(Some(v("2.1")), Some(v("3"))).unwrap();
        let both = a.intersection(&b).unwrap();
        assert_eq!(both.to_string(), "2.1:2.5");

        let disjoint = VersionRange::new(Some(v("4")), Some(v("5"))).unwrap();
        assert!(a.intersection(&disjoint).is_none());
    }

    #[test]
    fn empty_range_construction_fails() {
        assert!(VersionRange::new(Some(v("2")), Some(v("1"))).is_err());
        // lo == hi is the prefix range, which is never empty.
        assert!(VersionRange::new(Some(v("2")), Some(v("2"))).is_ok());
    }

    #[test]
    fn list_canonicalization() {
        let list = vl("3.0,1.0:1.5,1.4:2.0");
        assert_eq!(list.to_string(), "1.0:2.0,3.0");
        // Union is idempotent on canonical lists.
        assert_eq!(list.union(&list), list);
    }

    #[test]
    fn list_satisfies_and_intersects() {
        assert!(vl("1.2:1.4").satisfies(&vl("1.0:2.0")));
        assert!(!vl("1.2:2.5").satisfies(&vl("1.0:2.0")));
        assert!(vl("1.2:2.5").intersects(&vl("1.0:2.0")));
        assert!(!vl("3:4").intersects(&vl("1.0:2.0")));
        assert!(vl("=1.2").satisfies(&vl("1.0:2.0")));
    }

    #[test]
    fn intersection_symmetry() {
        let a = vl("1.0:2.0,3.5");
        let b = vl("1.5:3.9");
        assert_eq!(a.intersection(&b), b.intersection(&a));
        assert_eq!(a.intersection(&b).to_string(), "1.5:2.0,3.5");
    }

    #[test]
    fn git_version_resolution_orders_between_tags() {
        let mut git = GitVersion::new("main-branch", None);
        git.resolve(v("1.2"), 3);
        let resolved = git.ref_version().unwrap().clone();
        assert!(resolved > v("1.2"));
        assert!(resolved < v("1.3"));
        assert_eq!(git.to_string(), "git.main-branch=1.2-git.3");
    }

    #[test]
    fn git_satisfies_standard_via_resolution() {
        let mut git = GitVersion::new("v2-tag", None);
        git.resolve(v("2.0"), 0);
        let list = VersionList::from_version(Version::Git(git));
        assert!(list.satisfies(&vl("2.0")));
        assert!(list.intersects(&vl("1.5:2.5")));
        // Satisfies the pinned version through its resolution, but is
        // never *equal* to the standard version.
        assert!(list.satisfies(&vl("=2.0")));
        assert_ne!(list.elements()[0], Version::Standard(v("2.0")));
    }
}
