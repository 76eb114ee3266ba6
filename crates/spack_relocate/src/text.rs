//! Byte-level prefix replacement.
//!
//! Text files may grow or shrink; binaries must not. For a binary, the
//! replaced prefix is the head of a C string: the new prefix is written
//! followed by the rest of the string and null padding, keeping every
//! offset after the string intact. A new prefix longer than the old one
//! cannot be patched this way; such files are returned to the caller
//! for proper image patching.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::{write_preserving_inode, PrefixMap, RelocateError};

/// Replaces every old prefix in the given text files.
pub fn relocate_text(files: &[PathBuf], map: &PrefixMap) -> Result<(), RelocateError> {
    let Some(regex) = map.to_byte_regex() else {
        return Ok(());
    };
    for path in files {
        let data = read(path)?;
        let replaced = regex.replace_all(&data, |captures: &regex::bytes::Captures<'_>| {
            let old = captures.get(0).expect("whole match").as_bytes();
            map.lookup(old).map(str::as_bytes).unwrap_or(old).to_vec()
        });
        if replaced.as_ref() != data.as_slice() {
            trace!(path = %path.display(), "rewrote text file");
            fs::write(path, replaced.as_ref()).map_err(|e| RelocateError::io(path, e))?;
        }
    }
    Ok(())
}

/// Replaces old prefixes in binary files, preserving file layout.
///
/// Returns the files containing a prefix that could not be replaced
/// because its new form is longer; those need ELF/Mach-O patching
/// instead of byte substitution.
pub fn relocate_text_bin(
    files: &[PathBuf],
    map: &PrefixMap,
) -> Result<Vec<PathBuf>, RelocateError> {
    let Some(regex) = map.to_byte_regex() else {
        return Ok(Vec::new());
    };
    let mut needs_patching = Vec::new();
    for path in files {
        let data = read(path)?;
        let mut out: Vec<u8> = Vec::with_capacity(data.len());
        let mut consumed = 0usize;
        let mut changed = false;
        let mut flagged = false;
        for found in regex.find_iter(&data) {
            // A second occurrence inside an already-consumed C string
            // was carried over verbatim with its suffix.
            if found.start() < consumed {
                continue;
            }
            let old = &data[found.start()..found.end()];
            let new = map.lookup(old).expect("regex only matches known prefixes").as_bytes();
            if new.len() > old.len() {
                flagged = true;
                continue;
            }
            // The suffix of the C string the prefix starts.
            let mut string_end = found.end();
            while string_end < data.len() && data[string_end] != 0 {
                string_end += 1;
            }
            out.extend_from_slice(&data[consumed..found.start()]);
            out.extend_from_slice(new);
            out.extend_from_slice(&data[found.end()..string_end]);
            out.resize(out.len() + (old.len() - new.len()), 0);
            consumed = string_end;
            changed = true;
        }
        out.extend_from_slice(&data[consumed..]);
        debug_assert_eq!(out.len(), data.len());
        if changed {
            trace!(path = %path.display(), "rewrote binary strings in place");
            write_preserving_inode(path, &out)?;
        }
        if flagged {
            needs_patching.push(path.clone());
        }
    }
    Ok(needs_patching)
}

fn read(path: &Path) -> Result<Vec<u8>, RelocateError> {
    let file = fs::File::open(path).map_err(|e| RelocateError::io(path, e))?;
    let mapped = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| RelocateError::io(path, e))?;
    Ok(mapped.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    fn map(old: &str, new: &str) -> PrefixMap {
        let mut m = PrefixMap::new();
        m.insert(old, new);
        m
    }

    #[test]
    fn text_replacement_may_change_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg");
        fs::write(&path, "prefix=/orig/opt/pkg-xyz\nlib=/orig/opt/pkg-xyz/lib\n").unwrap();
        relocate_text(
            &[path.clone()],
            &map("/orig/opt/pkg-xyz", "/new/opt/pkg-xyz-abcdef"),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "prefix=/new/opt/pkg-xyz-abcdef\nlib=/new/opt/pkg-xyz-abcdef/lib\n"
        );
    }

    #[test]
    fn binary_replacement_preserves_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        let mut data = b"head\0/old/prefix/lib/libz.so\0tail".to_vec();
        fs::write(&path, &data).unwrap();

        relocate_text_bin(&[path.clone()], &map("/old/prefix", "/np")).unwrap();
        let patched = fs::read(&path).unwrap();
        assert_eq!(patched.len(), data.len());
        assert!(patched.windows(17).any(|w| w == b"/np/lib/libz.so\0\0"));

        // Too-long replacements are flagged, not applied.
        data = fs::read(&path).unwrap();
        let flagged = relocate_text_bin(
            &[path.clone()],
            &map("/np", "/a/considerably/longer/prefix"),
        )
        .unwrap();
        assert_eq!(flagged, vec![path.clone()]);
        assert_eq!(fs::read(&path).unwrap(), data);
    }
}
