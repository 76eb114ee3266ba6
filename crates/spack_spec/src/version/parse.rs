//! Parsing of version strings, ranges and lists.
//!
//! A version string is split on `.`, `_` and `-` into segments; each
//! segment is further split into runs of digits and letters. Trailing
//! tokens matching `alpha|beta|rc`, optionally followed by a number,
//! form the prerelease. Everything else is a release component.

use lazy_regex::regex_is_match;
use smallvec::SmallVec;
use thiserror::Error;

use super::{
    GitVersion, Prerelease, StandardVersion, Version, VersionComponent, VersionList, VersionRange,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid version `{version}`: {kind}")]
pub struct ParseVersionError {
    /// The offending input.
    pub version: String,
    /// Why the input was rejected.
    pub kind: ParseVersionErrorKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseVersionErrorKind {
    #[error("empty version string")]
    Empty,
    #[error("invalid character at offset {0}")]
    InvalidCharacter(usize),
    #[error("the range contains no versions")]
    EmptyRange,
    #[error("a range takes at most one `:`")]
    TooManyColons,
    #[error("numeric component does not fit in 64 bits")]
    NumberOverflow,
    #[error("invalid git ref")]
    InvalidGitRef,
}

impl ParseVersionError {
    fn new(version: &str, kind: ParseVersionErrorKind) -> Self {
        Self { version: version.to_owned(), kind }
    }

    pub(crate) fn empty_range(range: &str) -> Self {
        Self::new(range, ParseVersionErrorKind::EmptyRange)
    }
}

/// Parses a single standard version such as `1.2.0` or `2.0-rc1`.
pub(crate) fn parse_standard_version(s: &str) -> Result<StandardVersion, ParseVersionError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseVersionError::new(s, ParseVersionErrorKind::Empty));
    }
    if !regex_is_match!(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$", s) {
        let offset = s
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
            .map(|(i, _)| i)
            .unwrap_or(0);
        return Err(ParseVersionError::new(s, ParseVersionErrorKind::InvalidCharacter(offset)));
    }

    #[derive(Debug)]
    enum Raw {
        Num(u64),
        Alpha(String),
    }

    let mut tokens: Vec<Raw> = Vec::new();
    let mut offset = 0usize;
    for segment in s.split(['.', '_', '-']) {
        if segment.is_empty() {
            return Err(ParseVersionError::new(s, ParseVersionErrorKind::InvalidCharacter(offset)));
        }
        let bytes = segment.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let digits = bytes[i].is_ascii_digit();
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() == digits {
                i += 1;
            }
            let run = &segment[start..i];
            if digits {
                let n: u64 = run.parse().map_err(|_| {
                    ParseVersionError::new(s, ParseVersionErrorKind::NumberOverflow)
                })?;
                tokens.push(Raw::Num(n));
            } else {
                tokens.push(Raw::Alpha(run.to_owned()));
            }
        }
        offset += segment.len() + 1;
    }

    let is_prerelease_token = |raw: &Raw| {
        matches!(raw, Raw::Alpha(a)
            if a.eq_ignore_ascii_case("alpha")
                || a.eq_ignore_ascii_case("beta")
                || a.eq_ignore_ascii_case("rc"))
    };
    let make_prerelease = |raw: &Raw, n: Option<u64>| match raw {
        Raw::Alpha(a) if a.eq_ignore_ascii_case("alpha") => Prerelease::Alpha(n),
        Raw::Alpha(a) if a.eq_ignore_ascii_case("beta") => Prerelease::Beta(n),
        _ => Prerelease::Rc(n),
    };

    let mut prerelease = Prerelease::Final;
    let mut end = tokens.len();
    if end >= 1 && is_prerelease_token(&tokens[end - 1]) {
        prerelease = make_prerelease(&tokens[end - 1], None);
        end -= 1;
    } else if end >= 2 && is_prerelease_token(&tokens[end - 2]) {
        if let Raw::Num(n) = tokens[end - 1] {
            prerelease = make_prerelease(&tokens[end - 2], Some(n));
            end -= 2;
        }
    }

    let release: SmallVec<[VersionComponent; 4]> = tokens[..end]
        .iter()
        .map(|raw| match raw {
            Raw::Num(n) => VersionComponent::Numeral(*n),
            Raw::Alpha(a) => VersionComponent::from_token(a),
        })
        .collect();

    Ok(StandardVersion::new(s.into(), release, prerelease))
}

fn looks_like_git_ref(s: &str) -> bool {
    if s.starts_with("git.") {
        return true;
    }
    let head = &s.as_bytes()[..s.len().min(40)];
    head.len() == 40
        && head.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        && (s.len() == 40 || s.as_bytes()[40] == b'=')
}

fn parse_git_version(s: &str) -> Result<Version, ParseVersionError> {
    let (ref_part, version_part) = match s.split_once('=') {
        Some((r, v)) => (r, Some(v)),
        None => (s, None),
    };
    let ref_str = ref_part.strip_prefix("git.").unwrap_or(ref_part);
    if ref_str.is_empty() {
        return Err(ParseVersionError::new(s, ParseVersionErrorKind::InvalidGitRef));
    }
    let ref_version = version_part.map(parse_standard_version).transpose()?;
    Ok(Version::Git(GitVersion::new(ref_str, ref_version)))
}

/// Parses one element of a version list: `=X`, `X`, `X:`, `:Y`, `X:Y`,
/// `:` or a git ref.
pub(crate) fn parse_version_element(s: &str) -> Result<Version, ParseVersionError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseVersionError::new(s, ParseVersionErrorKind::Empty));
    }
    if let Some(exact) = s.strip_prefix('=') {
        return Ok(Version::Standard(parse_standard_version(exact)?));
    }
    if looks_like_git_ref(s) {
        return parse_git_version(s);
    }
    if s == ":" {
        return Ok(Version::Range(VersionRange::any()));
    }
    if s.contains(':') {
        let mut parts = s.splitn(3, ':');
        let lo_text = parts.next().unwrap_or("");
        let hi_text = parts.next().unwrap_or("");
        if parts.next().is_some() {
            return Err(ParseVersionError::new(s, ParseVersionErrorKind::TooManyColons));
        }
        let lo = if lo_text.is_empty() { None } else { Some(parse_standard_version(lo_text)?) };
        let hi = if hi_text.is_empty() { None } else { Some(parse_standard_version(hi_text)?) };
        return VersionRange::new(lo, hi).map(Version::Range);
    }
    Ok(Version::Range(VersionRange::prefix(parse_standard_version(s)?)))
}

/// Parses a comma-separated version list, the payload of an `@` clause.
pub(crate) fn parse_version_list(s: &str) -> Result<VersionList, ParseVersionError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseVersionError::new(s, ParseVersionErrorKind::Empty));
    }
    let mut list = VersionList::new();
    for element in s.split(',') {
        list.insert(parse_version_element(element)?);
    }
    Ok(list)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn prerelease_extraction() {
        let v = parse_standard_version("1.2.0-rc1").unwrap();
        assert_eq!(v.prerelease(), Prerelease::Rc(Some(1)));
        assert_eq!(v.release().len(), 3);

        let v = parse_standard_version("2.0alpha").unwrap();
        assert_eq!(v.prerelease(), Prerelease::Alpha(None));

        // `a` alone is not a prerelease token.
        let v = parse_standard_version("1.2a").unwrap();
        assert_eq!(v.prerelease(), Prerelease::Final);
        assert_eq!(v.release().len(), 3);
    }

    #[test]
    fn display_round_trips_the_original() {
        for text in ["1.2.0", "2.0-rc1", "1_0", "4.2.p1", "develop"] {
            assert_eq!(parse_standard_version(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn bad_version_strings() {
        assert_matches!(
            parse_standard_version(""),
            Err(ParseVersionError { kind: ParseVersionErrorKind::Empty, .. })
        );
        assert_matches!(
            parse_standard_version("1..2"),
            Err(ParseVersionError { kind: ParseVersionErrorKind::InvalidCharacter(_), .. })
        );
        assert_matches!(
            parse_standard_version("1.2 3"),
            Err(ParseVersionError { kind: ParseVersionErrorKind::InvalidCharacter(_), .. })
        );
    }

    #[test]
    fn list_element_shapes() {
        assert_matches!(parse_version_element("=1.2"), Ok(Version::Standard(_)));
        assert_matches!(parse_version_element("1.2"), Ok(Version::Range(_)));
        assert_matches!(parse_version_element("1.2:"), Ok(Version::Range(_)));
        assert_matches!(parse_version_element(":1.2"), Ok(Version::Range(_)));
        assert_matches!(parse_version_element(":"), Ok(Version::Range(_)));
        assert_matches!(parse_version_element("git.main"), Ok(Version::Git(_)));
        assert_matches!(
            parse_version_element("2:1"),
            Err(ParseVersionError { kind: ParseVersionErrorKind::EmptyRange, .. })
        );
    }

    #[test]
    fn git_ref_by_commit_sha() {
        let sha = "a6e8ab3c56eb332dd476dd9a3acbd3a1f103bda7";
        let parsed = parse_version_element(sha).unwrap();
        assert_matches!(&parsed, Version::Git(g) if g.ref_str() == sha && g.is_commit_sha());

        let asserted = parse_version_element(&format!("{sha}=3.2")).unwrap();
        assert_matches!(&asserted, Version::Git(g) if g.ref_version().is_some());
    }

    #[test]
    fn list_parsing_canonicalizes() {
        let list = parse_version_list("2.0,1.0,1.5:1.9").unwrap();
        assert_eq!(list.to_string(), "1.0,1.5:1.9,2.0");
    }
}
