//! Reproducible tarball creation and safe extraction.
//!
//! The archive layout is one top-level directory named after the
//! install prefix, the prefix tree below it, and a generated
//! `.spack/binary_distribution` buildinfo record. Entry metadata is
//! normalized (uid/gid/mtime zero, empty owner names, 0755/0644 modes)
//! and entries are emitted in sorted order, so two archives of the same
//! tree are byte identical. Both the gzipped and the uncompressed
//! digest are computed in the same pass; the latter is the OCI rootfs
//! diff id.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

use crate::buildinfo::{BuildInfo, BUILDINFO_FILE};
use crate::error::BuildcacheError;
use spack_digest::{HashingWriter, Sha256};

/// Digests and size of a finished tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballSummary {
    pub path: PathBuf,
    /// SHA-256 of the gzipped archive: the blob digest.
    pub compressed_sha256: String,
    /// SHA-256 of the raw tar stream: the OCI diff id.
    pub uncompressed_sha256: String,
    pub content_length: u64,
}

/// Creates the tarball of `prefix` at `out_path`, filling the
/// buildinfo's relocation lists while walking the tree.
pub fn create_tarball(
    out_path: &Path,
    prefix: &Path,
    mut buildinfo: BuildInfo,
) -> Result<TarballSummary, BuildcacheError> {
    let prefixes = buildinfo.prefixes_to_relocate();
    let top = prefix
        .file_name()
        .ok_or_else(|| BuildcacheError::InvalidMetadataFile("prefix has no basename".into()))?
        .to_string_lossy()
        .into_owned();

    let file = File::create(out_path)?;
    let compressed = HashingWriter::<_, Sha256>::new(file);
    let gz = GzEncoder::new(compressed, Compression::default());
    let uncompressed = HashingWriter::<_, Sha256>::new(gz);
    let mut tar = Builder::new(uncompressed);
    tar.follow_symlinks(false);

    append_dir(&mut tar, &top)?;

    // First hardlink of an inode carries the data, later ones are
    // link entries.
    let mut inodes: HashMap<(u64, u64), String> = HashMap::new();

    let mut walker: Vec<walkdir::DirEntry> = Vec::new();
    for entry in WalkDir::new(prefix).min_depth(1).sort_by_file_name() {
        walker.push(entry.map_err(|e| io_of_walk(e))?);
    }
    for entry in walker {
        let rel = entry
            .path()
            .strip_prefix(prefix)
            .expect("walkdir stays under the prefix")
            .to_path_buf();
        let rel_str = rel.to_string_lossy().into_owned();
        if rel_str == BUILDINFO_FILE {
            // Regenerated below from the buildinfo we are filling in.
            continue;
        }
        let arcname = format!("{top}/{rel_str}");
        let file_type = entry.file_type();

        if file_type.is_dir() {
            append_dir(&mut tar, &arcname)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target_str = target.to_string_lossy();
            if prefixes.iter().any(|p| target_str.starts_with(p.as_str())) {
                buildinfo.relocate_links.push(rel_str.clone());
            }
            let mut header = normalized_header(EntryType::Symlink, 0, 0o755);
            tar.append_link(&mut header, &arcname, &target)?;
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(io_of_walk)?;
            let inode = inode_of(&meta);
            if let Some(first) = inode.and_then(|ino| inodes.get(&ino)) {
                let mut header = normalized_header(EntryType::Link, 0, 0o644);
                tar.append_link(&mut header, &arcname, first)?;
                continue;
            }
            if let Some(ino) = inode {
                if nlink_of(&meta) > 1 {
                    inodes.insert(ino, arcname.clone());
                }
            }

            let data = fs::read(entry.path())?;
            match classify(&data) {
                FileKind::Binary => buildinfo.relocate_binaries.push(rel_str.clone()),
                FileKind::Text => {
                    if prefixes.iter().any(|p| contains_bytes(&data, p.as_bytes())) {
                        buildinfo.relocate_textfiles.push(rel_str.clone());
                    }
                }
                FileKind::Other => {}
            }
            let mode = if executable(&meta) { 0o755 } else { 0o644 };
            let mut header = normalized_header(EntryType::Regular, data.len() as u64, mode);
            tar.append_data(&mut header, &arcname, data.as_slice())?;
        }
    }

    append_dir(&mut tar, &format!("{top}/.spack"))?;
    let record = buildinfo.to_yaml();
    let mut header = normalized_header(EntryType::Regular, record.len() as u64, 0o644);
    tar.append_data(&mut header, format!("{top}/{BUILDINFO_FILE}"), record.as_bytes())?;

    let uncompressed = tar.into_inner()?;
    let (gz, uncompressed_digest) = uncompressed.finalize();
    let compressed = gz.finish()?;
    let (file, compressed_digest) = compressed.finalize();
    let content_length = file.metadata()?.len();
    drop(file);

    debug!(path = %out_path.display(), size = content_length, "created tarball");
    Ok(TarballSummary {
        path: out_path.to_owned(),
        compressed_sha256: hex::encode(compressed_digest),
        uncompressed_sha256: hex::encode(uncompressed_digest),
        content_length,
    })
}

fn append_dir<W: io::Write>(tar: &mut Builder<W>, arcname: &str) -> Result<(), BuildcacheError> {
    let mut header = normalized_header(EntryType::Directory, 0, 0o755);
    tar.append_data(&mut header, format!("{arcname}/"), io::empty())?;
    Ok(())
}

/// An entry header with all machine- and time-dependent fields zeroed.
fn normalized_header(entry_type: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    let _ = header.set_username("");
    let _ = header.set_groupname("");
    header
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Binary,
    Text,
    Other,
}

/// Binary means ELF or Mach-O by magic; text means UTF-8 or Latin-1
/// with no control bytes besides whitespace.
fn classify(data: &[u8]) -> FileKind {
    if data.len() >= 4 {
        let magic = [data[0], data[1], data[2], data[3]];
        let is_binary = matches!(
            magic,
            [0x7f, b'E', b'L', b'F']
                | [0xfe, 0xed, 0xfa, 0xce]
                | [0xfe, 0xed, 0xfa, 0xcf]
                | [0xce, 0xfa, 0xed, 0xfe]
                | [0xcf, 0xfa, 0xed, 0xfe]
        );
        if is_binary {
            return FileKind::Binary;
        }
    }
    let textual = data
        .iter()
        .all(|b| *b >= 0x20 || matches!(b, 0x09 | 0x0a | 0x0c | 0x0d));
    if textual {
        FileKind::Text
    } else {
        FileKind::Other
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(unix)]
fn inode_of(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_of(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
fn nlink_of(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn nlink_of(_meta: &fs::Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn executable(_meta: &fs::Metadata) -> bool {
    false
}

fn io_of_walk(error: walkdir::Error) -> BuildcacheError {
    BuildcacheError::Io(
        error
            .into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walkdir error")),
    )
}

/// Extracts a buildcache tarball into `dest`, stripping the single
/// top-level package directory and refusing anything that would land
/// outside `dest`.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<BuildInfo, BuildcacheError> {
    // Pass 1: find the package prefix directory.
    let mut tops: Vec<String> = Vec::new();
    let mut buildinfo_tops: Vec<String> = Vec::new();
    {
        let mut tar = open_archive(archive)?;
        for entry in tar.entries()? {
            let entry = entry?;
            let path = entry.path()?.into_owned();
            let Some(Component::Normal(first)) = path.components().next() else {
                continue;
            };
            let first = first.to_string_lossy().into_owned();
            if !tops.contains(&first) {
                tops.push(first.clone());
            }
            if path == Path::new(&first).join(BUILDINFO_FILE) && !buildinfo_tops.contains(&first) {
                buildinfo_tops.push(first);
            }
        }
    }
    if buildinfo_tops.is_empty() {
        return Err(BuildcacheError::MissingBuildinfo);
    }
    if buildinfo_tops.len() > 1 || tops.len() > 1 {
        return Err(BuildcacheError::MultiplePrefixes);
    }
    let top = PathBuf::from(&buildinfo_tops[0]);

    // Pass 2: extract with the prefix stripped.
    fs::create_dir_all(dest)?;
    let mut tar = open_archive(archive)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let rel = match path.strip_prefix(&top) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return Err(BuildcacheError::EntryEscapesPrefix(path.display().to_string())),
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(BuildcacheError::EntryEscapesPrefix(path.display().to_string()));
        }
        let out_path = dest.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => fs::create_dir_all(&out_path)?,
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| {
                        BuildcacheError::InvalidMetadataFile("symlink without target".into())
                    })?
                    .into_owned();
                let target = strip_top(&target, &top);
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                make_symlink(&target, &out_path)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| {
                        BuildcacheError::InvalidMetadataFile("hardlink without target".into())
                    })?
                    .into_owned();
                let target = dest.join(strip_top(&target, &top));
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(target, &out_path)?;
            }
            _ => {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                fs::write(&out_path, &data)?;
                set_mode(&out_path, entry.header().mode().unwrap_or(0o644))?;
            }
        }
    }
    BuildInfo::read(dest)
}

fn open_archive(path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<File>>, BuildcacheError> {
    let file = File::open(path)?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn strip_top(target: &Path, top: &Path) -> PathBuf {
    target.strip_prefix(top).map(Path::to_path_buf).unwrap_or_else(|_| target.to_path_buf())
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> io::Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Computes both digests of an existing blob file.
pub fn digest_file(path: &Path) -> Result<(String, u64), BuildcacheError> {
    let digest = spack_digest::hash_file::<Sha256>(path)?;
    let length = fs::metadata(path)?.len();
    Ok((hex::encode(digest), length))
}

#[cfg(all(unix, test))]
mod test {
    use super::*;
    use std::os::unix::fs::symlink;

    fn make_prefix(dir: &Path) -> PathBuf {
        let prefix = dir.join("pkg-xyz");
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::create_dir_all(prefix.join("share")).unwrap();
        // A fake ELF binary referencing the old prefix.
        let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        elf.extend_from_slice(b"/orig/opt/pkg-xyz/lib\0");
        fs::write(prefix.join("bin/app"), &elf).unwrap();
        symlink("app", prefix.join("bin/relative")).unwrap();
        symlink("/orig/opt/pkg-xyz/bin/app", prefix.join("bin/absolute")).unwrap();
        fs::write(prefix.join("share/cfg"), "prefix=/orig/opt/pkg-xyz\n").unwrap();
        prefix
    }

    fn buildinfo() -> BuildInfo {
        BuildInfo {
            buildpath: "/orig/opt".to_owned(),
            spackprefix: "/orig/opt".to_owned(),
            sbang_install_path: "/orig/opt/bin/sbang".to_owned(),
            relative_prefix: "pkg-xyz".to_owned(),
            hardlinks_deduped: true,
            hash_to_prefix: [("abcd1234".to_owned(), "/orig/opt/pkg-xyz".to_owned())]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn tarball_creation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = make_prefix(dir.path());
        let a = create_tarball(&dir.path().join("a.tar.gz"), &prefix, buildinfo()).unwrap();
        let b = create_tarball(&dir.path().join("b.tar.gz"), &prefix, buildinfo()).unwrap();
        assert_eq!(a.compressed_sha256, b.compressed_sha256);
        assert_eq!(a.uncompressed_sha256, b.uncompressed_sha256);
        assert_eq!(
            fs::read(dir.path().join("a.tar.gz")).unwrap(),
            fs::read(dir.path().join("b.tar.gz")).unwrap()
        );
    }

    #[test]
    fn classification_fills_relocation_lists() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = make_prefix(dir.path());
        let out = dir.path().join("pkg.tar.gz");
        create_tarball(&out, &prefix, buildinfo()).unwrap();

        let dest = dir.path().join("extracted");
        let info = extract_tarball(&out, &dest).unwrap();
        assert_eq!(info.relocate_binaries, ["bin/app"]);
        assert_eq!(info.relocate_textfiles, ["share/cfg"]);
        assert_eq!(info.relocate_links, ["bin/absolute"]);
    }

    #[test]
    fn extraction_round_trips_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = make_prefix(dir.path());
        let out = dir.path().join("pkg.tar.gz");
        create_tarball(&out, &prefix, buildinfo()).unwrap();

        let dest = dir.path().join("new-prefix");
        extract_tarball(&out, &dest).unwrap();
        assert!(dest.join("bin/app").is_file());
        assert_eq!(fs::read_link(dest.join("bin/relative")).unwrap(), Path::new("app"));
        assert_eq!(
            fs::read_link(dest.join("bin/absolute")).unwrap(),
            Path::new("/orig/opt/pkg-xyz/bin/app")
        );
        assert_eq!(
            fs::read_to_string(dest.join("share/cfg")).unwrap(),
            "prefix=/orig/opt/pkg-xyz\n"
        );
        assert!(dest.join(BUILDINFO_FILE).is_file());
    }

    #[test]
    fn hardlinks_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("pkg");
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join("one"), "shared contents").unwrap();
        fs::hard_link(prefix.join("one"), prefix.join("two")).unwrap();

        let out = dir.path().join("pkg.tar.gz");
        create_tarball(&out, &prefix, buildinfo()).unwrap();
        let dest = dir.path().join("x");
        extract_tarball(&out, &dest).unwrap();

        use std::os::unix::fs::MetadataExt;
        let a = fs::metadata(dest.join("one")).unwrap();
        let b = fs::metadata(dest.join("two")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn archives_with_multiple_prefixes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("two-tops.tar.gz");
        let file = File::create(&out).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut tar = Builder::new(gz);
        let info = buildinfo().to_yaml();
        let mut header = normalized_header(EntryType::Regular, info.len() as u64, 0o644);
        tar.append_data(&mut header, format!("pkg/{BUILDINFO_FILE}"), info.as_bytes())
            .unwrap();
        let mut header = normalized_header(EntryType::Regular, 4, 0o644);
        tar.append_data(&mut header, "stray/file", &b"data"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap();

        assert_matches::assert_matches!(
            extract_tarball(&out, &dir.path().join("dest")),
            Err(BuildcacheError::MultiplePrefixes)
        );
    }

    #[test]
    fn archives_without_buildinfo_are_rejected(){
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bad.tar.gz");
        let file = File::create(&out).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut tar = Builder::new(gz);
        let mut header = normalized_header(EntryType::Regular, 4, 0o644);
        tar.append_data(&mut header, "pkg/file", &b"data"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap();

        assert_matches::assert_matches!(
            extract_tarball(&out, &dir.path().join("dest")),
            Err(BuildcacheError::MissingBuildinfo)
        );
    }
}
