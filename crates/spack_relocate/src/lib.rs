//! Relocation of installed prefixes.
//!
//! A binary package is built against one set of absolute paths and
//! extracted under another. This crate rewrites those paths: byte-level
//! substring replacement in text files, length-preserving replacement
//! in binaries, rpath/load-command rewriting in ELF and Mach-O images,
//! and symlink retargeting. Hardlinked files are patched at most once.
//!
//! The caller supplies a [`RelocationPlan`] (derived from the tarball's
//! buildinfo record); [`relocate`] applies it and removes the partially
//! relocated prefix if any step fails.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

mod elf;
mod links;
mod macho;
mod text;

pub use links::relocate_links;
pub use text::{relocate_text, relocate_text_bin};

#[derive(Debug, Error)]
pub enum RelocateError {
    /// The tarball predates `hash_to_prefix` buildinfo and cannot be
    /// relocated by this layout.
    #[error("buildcache entry was created with an incompatible layout: {0}")]
    NewLayoutIncompatible(String),
    #[error("failed to patch ELF binary `{path}`: {reason}")]
    ElfPatchFailure { path: PathBuf, reason: String },
    #[error("failed to patch Mach-O binary `{path}`: {reason}")]
    MachoPatchFailure { path: PathBuf, reason: String },
    #[error("failed to relocate symlink `{path}`: {reason}")]
    SymlinkRelocationFailure { path: PathBuf, reason: String },
    #[error("i/o error on `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RelocateError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        RelocateError::Io { path: path.to_owned(), source }
    }
}

/// An ordered mapping of old prefixes to new ones. Longest old prefix
/// wins, and identity entries are dropped on insert so that an
/// all-identity map is a guaranteed no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixMap {
    entries: Vec<(String, String)>,
}

impl PrefixMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old: impl Into<String>, new: impl Into<String>) {
        let (old, new) = (old.into(), new.into());
        if old == new || old.is_empty() {
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(o, _)| *o == old) {
            entry.1 = new;
            return;
        }
        self.entries.push((old, new));
        self.entries.sort_by_key(|(o, _)| std::cmp::Reverse(o.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(o, n)| (o.as_str(), n.as_str()))
    }

    /// The replacement for an exact old-prefix byte string.
    pub(crate) fn lookup(&self, old: &[u8]) -> Option<&str> {
        self.entries
            .iter()
            .find(|(o, _)| o.as_bytes() == old)
            .map(|(_, n)| n.as_str())
    }

    /// A single alternation regex matching every old prefix, longest
    /// alternative first.
    pub(crate) fn to_byte_regex(&self) -> Option<regex::bytes::Regex> {
        if self.is_empty() {
            return None;
        }
        let pattern = self
            .entries
            .iter()
            .map(|(old, _)| regex::escape(old))
            .collect::<Vec<_>>()
            .join("|");
        Some(regex::bytes::Regex::new(&pattern).expect("escaped alternation is valid"))
    }

    /// Replaces every occurrence of every old prefix in a string.
    pub fn apply_to_str(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for (old, new) in &self.entries {
            if out.contains(old.as_str()) {
                out = out.replace(old.as_str(), new);
            }
        }
        out
    }
}

/// What to rewrite inside an extracted prefix. Paths are relative to
/// the prefix, exactly as recorded in the buildinfo.
#[derive(Debug, Clone, Default)]
pub struct RelocationPlan {
    pub prefix_map: PrefixMap,
    pub binaries: Vec<PathBuf>,
    pub textfiles: Vec<PathBuf>,
    pub links: Vec<PathBuf>,
    /// Whether the tarball already stores hardlinks deduplicated.
    pub hardlinks_deduped: bool,
}

/// Applies a relocation plan to an extracted prefix.
///
/// An all-identity plan is a no-op. On failure the partially relocated
/// prefix is removed before the error is returned, so a broken install
/// never remains on disk.
pub fn relocate(prefix: &Path, plan: &RelocationPlan) -> Result<(), RelocateError> {
    if plan.prefix_map.is_empty() {
        debug!(prefix = %prefix.display(), "all prefix mappings are identities, nothing to do");
        return Ok(());
    }
    match apply(prefix, plan) {
        Ok(()) => Ok(()),
        Err(error) => {
            warn!(prefix = %prefix.display(), %error, "relocation failed, removing prefix");
            let _ = fs::remove_dir_all(prefix);
            Err(error)
        }
    }
}

fn apply(prefix: &Path, plan: &RelocationPlan) -> Result<(), RelocateError> {
    // Hardlinked files share an inode; patch each inode once.
    let mut seen = InodeSet::default();
    let binaries = dedupe(prefix, &plan.binaries, &mut seen)?;
    let textfiles = dedupe(prefix, &plan.textfiles, &mut seen)?;

    text::relocate_text(&textfiles, &plan.prefix_map)?;
    let needs_patching = text::relocate_text_bin(&binaries, &plan.prefix_map)?;
    for path in &needs_patching {
        debug!(path = %path.display(), "prefix grew, deferring to image patching");
    }

    for path in &binaries {
        match classify_image(path)? {
            Some(ImageKind::Elf) => elf::relocate_elf_binary(path, &plan.prefix_map)?,
            Some(ImageKind::MachO) => macho::relocate_macho_binary(path, &plan.prefix_map)?,
            None => {}
        }
    }

    let links: Vec<PathBuf> = plan.links.iter().map(|rel| prefix.join(rel)).collect();
    links::relocate_links(&links, &plan.prefix_map)?;
    Ok(())
}

#[derive(Default)]
struct InodeSet(HashSet<(u64, u64)>);

#[cfg(unix)]
fn inode_of(path: &Path) -> io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_of(_path: &Path) -> io::Result<(u64, u64)> {
    Ok((0, 0))
}

fn dedupe(
    prefix: &Path,
    relative: &[PathBuf],
    seen: &mut InodeSet,
) -> Result<Vec<PathBuf>, RelocateError> {
    let mut out = Vec::with_capacity(relative.len());
    for rel in relative {
        let path = prefix.join(rel);
        let inode = inode_of(&path).map_err(|e| RelocateError::io(&path, e))?;
        if cfg!(unix) && !seen.0.insert(inode) {
            continue;
        }
        out.push(path);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Elf,
    MachO,
}

/// Peeks at the magic bytes to decide how to patch a binary.
fn classify_image(path: &Path) -> Result<Option<ImageKind>, RelocateError> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|e| RelocateError::io(path, e))?;
    let n = io::Read::read(&mut file, &mut magic).map_err(|e| RelocateError::io(path, e))?;
    if n < 4 {
        return Ok(None);
    }
    Ok(match magic {
        [0x7f, b'E', b'L', b'F'] => Some(ImageKind::Elf),
        // 32/64-bit Mach-O, both endiannesses.
        [0xfe, 0xed, 0xfa, 0xce] | [0xfe, 0xed, 0xfa, 0xcf] => Some(ImageKind::MachO),
        [0xce, 0xfa, 0xed, 0xfe] | [0xcf, 0xfa, 0xed, 0xfe] => Some(ImageKind::MachO),
        _ => None,
    })
}

/// Writes new contents over an existing file through a temporary file,
/// preserving the original inode (hardlinks keep pointing at the
/// patched content).
pub(crate) fn write_preserving_inode(path: &Path, data: &[u8]) -> Result<(), RelocateError> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(directory).map_err(|e| RelocateError::io(path, e))?;
    io::Write::write_all(&mut tmp, data).map_err(|e| RelocateError::io(path, e))?;
    // Copy back over the original handle rather than renaming, so the
    // inode (and any hardlinks) survive.
    let mut source = fs::File::open(tmp.path()).map_err(|e| RelocateError::io(path, e))?;
    let mut dest = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| RelocateError::io(path, e))?;
    io::copy(&mut source, &mut dest).map_err(|e| RelocateError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_mappings_are_dropped() {
        let mut map = PrefixMap::new();
        map.insert("/opt/spack/pkg", "/opt/spack/pkg");
        assert!(map.is_empty());

        map.insert("/old/prefix", "/new/prefix");
        assert_eq!(map.apply_to_str("path=/old/prefix/lib"), "path=/new/prefix/lib");
    }

    #[test]
    fn longest_prefix_wins() {
        let mut map = PrefixMap::new();
        map.insert("/old", "/short");
        map.insert("/old/deeper", "/specific");
        assert_eq!(map.iter().next().unwrap().0, "/old/deeper");
        assert_eq!(map.apply_to_str("/old/deeper/file"), "/specific/file");
    }

    #[test]
    fn identity_plan_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.txt"), "/some/path").unwrap();
        let plan = RelocationPlan {
            textfiles: vec![PathBuf::from("data.txt")],
            ..Default::default()
        };
        relocate(dir.path(), &plan).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("data.txt")).unwrap(), "/some/path");
    }

    #[test]
    fn failed_relocation_removes_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("pkg");
        fs::create_dir(&prefix).unwrap();
        fs::write(prefix.join("present"), "x").unwrap();
        let mut plan = RelocationPlan::default();
        plan.prefix_map.insert("/old", "/new");
        // A recorded file that does not exist fails the plan.
        plan.textfiles.push(PathBuf::from("missing.txt"));
        assert!(relocate(&prefix, &plan).is_err());
        assert!(!prefix.exists());
    }

    #[test]
    fn magic_classification() {
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("elf");
        fs::write(&elf, [0x7f, b'E', b'L', b'F', 2, 1, 1]).unwrap();
        assert_eq!(classify_image(&elf).unwrap(), Some(ImageKind::Elf));

        let macho = dir.path().join("macho");
        fs::write(&macho, [0xcf, 0xfa, 0xed, 0xfe, 0, 0, 0]).unwrap();
        assert_eq!(classify_image(&macho).unwrap(), Some(ImageKind::MachO));

        let script = dir.path().join("script");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        assert_eq!(classify_image(&script).unwrap(), None);
    }
}
