//! Mach-O load-command rewriting.
//!
//! LC_LOAD_DYLIB/LC_ID_DYLIB install names and LC_RPATH entries live
//! inside their load command, null padded up to `cmdsize`; rewriting in
//! place is safe as long as the new path fits the slot. On macOS the
//! modified image is re-signed with an ad-hoc signature, since any byte
//! change invalidates the existing one.

use std::fs;
use std::path::Path;

use goblin::mach::load_command::CommandVariant;
use goblin::mach::Mach;
use tracing::trace;

use crate::{write_preserving_inode, PrefixMap, RelocateError};

pub fn relocate_macho_binary(path: &Path, map: &PrefixMap) -> Result<(), RelocateError> {
    let mut data = fs::read(path).map_err(|e| RelocateError::io(path, e))?;
    let patches = collect_patches(path, &data, map)?;
    if patches.is_empty() {
        return Ok(());
    }
    for (offset, slot, replacement) in &patches {
        if replacement.len() > *slot {
            return Err(macho_error(
                path,
                format!("install name `{replacement}` does not fit its load command"),
            ));
        }
        let slot_bytes = &mut data[*offset..*offset + *slot];
        slot_bytes.fill(0);
        slot_bytes[..replacement.len()].copy_from_slice(replacement.as_bytes());
    }
    trace!(path = %path.display(), count = patches.len(), "rewrote Mach-O load commands");
    write_preserving_inode(path, &data)?;
    codesign_adhoc(path)
}

fn macho_error(path: &Path, reason: impl Into<String>) -> RelocateError {
    RelocateError::MachoPatchFailure { path: path.to_owned(), reason: reason.into() }
}

type StringPatch = (usize, usize, String);

fn collect_patches(
    path: &Path,
    data: &[u8],
    map: &PrefixMap,
) -> Result<Vec<StringPatch>, RelocateError> {
    let macho = match Mach::parse(data).map_err(|e| macho_error(path, e.to_string()))? {
        Mach::Binary(macho) => macho,
        Mach::Fat(_) => {
            return Err(macho_error(path, "fat binaries must be split before relocation"));
        }
    };
    let mut patches = Vec::new();
    for lc in &macho.load_commands {
        let (string_offset, cmdsize) = match &lc.command {
            CommandVariant::LoadDylib(cmd)
            | CommandVariant::IdDylib(cmd)
            | CommandVariant::LoadWeakDylib(cmd)
            | CommandVariant::ReexportDylib(cmd)
            | CommandVariant::LoadUpwardDylib(cmd)
            | CommandVariant::LazyLoadDylib(cmd) => (cmd.dylib.name as usize, cmd.cmdsize as usize),
            CommandVariant::Rpath(cmd) => (cmd.path as usize, cmd.cmdsize as usize),
            _ => continue,
        };
        let offset = lc.offset + string_offset;
        let slot = cmdsize.checked_sub(string_offset).ok_or_else(|| {
            macho_error(path, "load command string offset beyond command size")
        })?;
        let end = offset + slot;
        if end > data.len() {
            return Err(macho_error(path, "load command out of bounds"));
        }
        let string_end = data[offset..end]
            .iter()
            .position(|b| *b == 0)
            .map(|p| offset + p)
            .unwrap_or(end);
        let Ok(original) = std::str::from_utf8(&data[offset..string_end]) else {
            continue;
        };
        let rewritten = map.apply_to_str(original);
        if rewritten != original {
            patches.push((offset, slot, rewritten));
        }
    }
    Ok(patches)
}

#[cfg(target_os = "macos")]
fn codesign_adhoc(path: &Path) -> Result<(), RelocateError> {
    let status = std::process::Command::new("codesign")
        .args(["--force", "--sign", "-"])
        .arg(path)
        .status()
        .map_err(|e| macho_error(path, format!("failed to run codesign: {e}")))?;
    if !status.success() {
        return Err(macho_error(path, format!("codesign exited with {status}")));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn codesign_adhoc(_path: &Path) -> Result<(), RelocateError> {
    Ok(())
}
