//! ELF rpath and interpreter rewriting.
//!
//! DT_RPATH/DT_RUNPATH entries point into `.dynstr`, and PT_INTERP
//! names the loader; both are rewritten in place with null padding so
//! no section moves. Replacements that would outgrow the original
//! string slot are an error: growing string tables is patchelf
//! territory, and a silent truncation would be worse than failing.

use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::dynamic::{DT_RPATH, DT_RUNPATH, DT_STRTAB};
use goblin::elf::program_header::{PT_INTERP, PT_LOAD};
use goblin::elf::Elf;
use tracing::trace;

use crate::{write_preserving_inode, PrefixMap, RelocateError};

pub fn relocate_elf_binary(path: &Path, map: &PrefixMap) -> Result<(), RelocateError> {
    let mut data = fs::read(path).map_err(|e| RelocateError::io(path, e))?;
    let patches = collect_patches(path, &data, map)?;
    if patches.is_empty() {
        return Ok(());
    }
    for patch in &patches {
        apply_patch(&mut data, patch, path)?;
    }
    trace!(path = %path.display(), count = patches.len(), "rewrote ELF path entries");
    write_preserving_inode(path, &data)
}

struct Patch {
    offset: usize,
    /// Size of the original null-terminated slot.
    slot: usize,
    replacement: String,
}

fn elf_error(path: &Path, reason: impl Into<String>) -> RelocateError {
    RelocateError::ElfPatchFailure { path: path.to_owned(), reason: reason.into() }
}

fn collect_patches(
    path: &Path,
    data: &[u8],
    map: &PrefixMap,
) -> Result<Vec<Patch>, RelocateError> {
    let elf = Elf::parse(data).map_err(|e| elf_error(path, e.to_string()))?;
    let mut patches = Vec::new();

    if let Some(dynamic) = &elf.dynamic {
        let strtab_vaddr = dynamic
            .dyns
            .iter()
            .find(|d| d.d_tag == DT_STRTAB)
            .map(|d| d.d_val)
            .ok_or_else(|| elf_error(path, "dynamic section without DT_STRTAB"))?;
        let strtab_offset = vaddr_to_offset(&elf, strtab_vaddr)
            .ok_or_else(|| elf_error(path, "DT_STRTAB outside any PT_LOAD segment"))?;
        for entry in &dynamic.dyns {
            if entry.d_tag != DT_RPATH && entry.d_tag != DT_RUNPATH {
                continue;
            }
            let offset = (strtab_offset + entry.d_val) as usize;
            let original = read_cstr(data, offset)
                .ok_or_else(|| elf_error(path, "rpath string out of bounds"))?;
            let rewritten = rewrite_rpath(original, map);
            if rewritten != original {
                patches.push(Patch {
                    offset,
                    slot: original.len(),
                    replacement: rewritten,
                });
            }
        }
    }

    if let Some(interpreter) = elf.interpreter {
        let rewritten = map.apply_to_str(interpreter);
        if rewritten != interpreter {
            let header = elf
                .program_headers
                .iter()
                .find(|ph| ph.p_type == PT_INTERP)
                .ok_or_else(|| elf_error(path, "interpreter without PT_INTERP header"))?;
            patches.push(Patch {
                offset: header.p_offset as usize,
                slot: interpreter.len(),
                replacement: rewritten,
            });
        }
    }
    Ok(patches)
}

fn apply_patch(data: &mut [u8], patch: &Patch, path: &Path) -> Result<(), RelocateError> {
    if patch.replacement.len() > patch.slot {
        return Err(elf_error(
            path,
            format!(
                "replacement `{}` does not fit the {}-byte slot",
                patch.replacement, patch.slot
            ),
        ));
    }
    let end = patch.offset + patch.slot;
    if end > data.len() {
        return Err(elf_error(path, "patch out of bounds"));
    }
    let slot = &mut data[patch.offset..end];
    slot.fill(0);
    slot[..patch.replacement.len()].copy_from_slice(patch.replacement.as_bytes());
    Ok(())
}

/// Applies the prefix map to each `:`-separated rpath component.
fn rewrite_rpath(rpath: &str, map: &PrefixMap) -> String {
    rpath
        .split(':')
        .map(|component| map.apply_to_str(component))
        .collect::<Vec<_>>()
        .join(":")
}

fn vaddr_to_offset(elf: &Elf<'_>, vaddr: u64) -> Option<u64> {
    elf.program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .find(|ph| vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr + ph.p_memsz)
        .map(|ph| vaddr - ph.p_vaddr + ph.p_offset)
}

fn read_cstr(data: &[u8], offset: usize) -> Option<&str> {
    if offset >= data.len() {
        return None;
    }
    let end = data[offset..].iter().position(|b| *b == 0)? + offset;
    std::str::from_utf8(&data[offset..end]).ok()
}

/// The rpath components recorded in an ELF image, for tests and
/// diagnostics.
pub fn elf_rpaths(path: &PathBuf) -> Result<Vec<String>, RelocateError> {
    let data = fs::read(path).map_err(|e| RelocateError::io(path, e))?;
    let elf = Elf::parse(&data).map_err(|e| elf_error(path, e.to_string()))?;
    Ok(elf
        .runpaths
        .iter()
        .chain(elf.rpaths.iter())
        .flat_map(|rp| rp.split(':'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rpath_components_are_rewritten_independently() {
        let mut map = PrefixMap::new();
        map.insert("/orig/opt/pkg", "/new/pkg");
        assert_eq!(
            rewrite_rpath("/orig/opt/pkg/lib:/usr/lib:/orig/opt/pkg/lib64", &map),
            "/new/pkg/lib:/usr/lib:/new/pkg/lib64"
        );
    }

    #[test]
    fn patches_pad_with_nulls_and_refuse_to_grow() {
        let mut data = b"....../orig/lib\0......".to_vec();
        let patch = Patch { offset: 6, slot: 9, replacement: "/new/l".to_owned() };
        apply_patch(&mut data, &patch, Path::new("x")).unwrap();
        assert_eq!(&data[6..16], b"/new/l\0\0\0\0");

        let grown = Patch { offset: 6, slot: 9, replacement: "/much/longer".to_owned() };
        assert_matches::assert_matches!(
            apply_patch(&mut data, &grown, Path::new("x")),
            Err(RelocateError::ElfPatchFailure { .. })
        );
    }

    #[test]
    fn cstr_reading() {
        let data = b"abc\0def";
        assert_eq!(read_cstr(data, 0), Some("abc"));
        assert_eq!(read_cstr(data, 4), None); // no terminator
        assert_eq!(read_cstr(data, 42), None);
    }
}
