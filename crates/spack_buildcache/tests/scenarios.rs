//! End-to-end scenarios: tarball + relocation, push idempotence, and
//! conditional index fetches against an in-process HTTP mirror.
#![cfg(unix)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use spack_buildcache::{
    conditional_fetch_index, create_tarball, extract_tarball, generate_index, layout,
    push_binaries, BlobRecord, BuildInfo, BuildcacheComponent, BuildcacheManifest, CachedIndex,
    Mirror, PushOptions,
};
use spack_relocate::relocate;
use spack_spec::testing;
use spack_spec::{Context, StoreLayout};

fn count_files(root: &Path) -> usize {
    walkdir(root).len()
}

fn walkdir(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !root.exists() {
        return out;
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                out.push(entry.path());
            }
        }
    }
    out
}

/// S5, without the ELF leg: tarball a prefix with text files and
/// symlinks, extract elsewhere, relocate, and observe the rewritten
/// contents.
#[test]
fn tarball_and_relocation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let orig = dir.path().join("orig/opt/pkg-xyz");
    fs::create_dir_all(orig.join("bin")).unwrap();
    fs::create_dir_all(orig.join("share")).unwrap();
    fs::write(orig.join("bin/app"), "#!/bin/sh\necho app\n").unwrap();
    std::os::unix::fs::symlink("app", orig.join("bin/relative")).unwrap();
    std::os::unix::fs::symlink(
        dir.path().join("orig/opt/pkg-xyz/bin/app"),
        orig.join("bin/absolute"),
    )
    .unwrap();
    fs::write(
        orig.join("share/cfg"),
        format!("prefix={}\n", dir.path().join("orig/opt/pkg-xyz").display()),
    )
    .unwrap();

    let old_prefix = dir.path().join("orig/opt/pkg-xyz").display().to_string();
    let buildinfo = BuildInfo {
        buildpath: dir.path().join("orig/opt").display().to_string(),
        spackprefix: dir.path().join("orig/opt").display().to_string(),
        sbang_install_path: dir.path().join("orig/opt/bin/sbang").display().to_string(),
        relative_prefix: "pkg-xyz".to_owned(),
        hardlinks_deduped: true,
        hash_to_prefix: [("roothash".to_owned(), old_prefix.clone())].into_iter().collect(),
        ..Default::default()
    };

    let archive = dir.path().join("pkg.tar.gz");
    create_tarball(&archive, &orig, buildinfo).unwrap();

    let new_prefix = dir.path().join("new/opt/pkg-xyz-abcd");
    let info = extract_tarball(&archive, &new_prefix).unwrap();
    assert_eq!(info.relocate_textfiles, ["share/cfg"]);
    assert_eq!(info.relocate_links, ["bin/absolute"]);

    let mut plan = spack_relocate::RelocationPlan {
        binaries: Vec::new(),
        textfiles: info.relocate_textfiles.iter().map(PathBuf::from).collect(),
        links: info.relocate_links.iter().map(PathBuf::from).collect(),
        hardlinks_deduped: true,
        ..Default::default()
    };
    plan.prefix_map.insert(old_prefix, new_prefix.display().to_string());
    relocate(&new_prefix, &plan).unwrap();

    // Absolute symlink retargeted, relative one untouched.
    assert_eq!(
        fs::read_link(new_prefix.join("bin/absolute")).unwrap(),
        new_prefix.join("bin/app")
    );
    assert_eq!(
        fs::read_link(new_prefix.join("bin/relative")).unwrap(),
        Path::new("app")
    );
    // Text file rewritten to the new prefix.
    let cfg = fs::read_to_string(new_prefix.join("share/cfg")).unwrap();
    assert_eq!(cfg, format!("prefix={}\n", new_prefix.display()));
}

/// S6: pushing the same spec twice creates no new objects; a forced
/// push rewrites the tarball blob but the manifests stay identical.
#[tokio::test]
async fn push_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store_root = dir.path().join("store");
    let ctx = Context { store: StoreLayout::new(&store_root), ..Context::default() };
    let spec = testing::concretize("zlib@=1.3");

    // Materialize the install prefix the pipeline will archive.
    let prefix = ctx.store.prefix_for(&spec).unwrap();
    fs::create_dir_all(prefix.join("lib")).unwrap();
    fs::write(prefix.join("lib/libz.a"), "not really an archive").unwrap();

    let mirror_dir = dir.path().join("mirror");
    let mirror = Mirror::local(&mirror_dir);

    let result = push_binaries(&ctx, &mirror, std::slice::from_ref(&spec), &PushOptions::default(), None)
        .await
        .unwrap();
    assert_eq!(result.pushed.len(), 1);
    assert!(result.failed.is_empty());

    // layout.json + tarball blob + tarball manifest + spec blob + spec
    // manifest.
    assert!(mirror_dir.join("layout.json").is_file());
    let objects_after_first = count_files(&mirror_dir);
    assert_eq!(objects_after_first, 5);
    let snapshot: Vec<(PathBuf, Vec<u8>)> = walkdir(&mirror_dir)
        .into_iter()
        .map(|p| (p.clone(), fs::read(&p).unwrap()))
        .collect();

    // Second push: everything skipped, nothing written.
    let result = push_binaries(&ctx, &mirror, std::slice::from_ref(&spec), &PushOptions::default(), None)
        .await
        .unwrap();
    assert_eq!(result.skipped.len(), 1);
    assert!(result.pushed.is_empty());
    assert_eq!(count_files(&mirror_dir), objects_after_first);

    // Forced push: same content, so every object is byte-identical.
    let options = PushOptions { force: true, ..Default::default() };
    let result = push_binaries(&ctx, &mirror, std::slice::from_ref(&spec), &options, None)
        .await
        .unwrap();
    assert_eq!(result.pushed.len(), 1);
    assert_eq!(count_files(&mirror_dir), objects_after_first);
    for (path, contents) in snapshot {
        assert_eq!(fs::read(&path).unwrap(), contents, "{} changed", path.display());
    }
}

#[tokio::test]
async fn push_collects_failures_instead_of_raising() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context {
        store: StoreLayout::new(dir.path().join("store")),
        ..Context::default()
    };
    let good = testing::concretize("zlib@=1.3");
    let prefix = ctx.store.prefix_for(&good).unwrap();
    fs::create_dir_all(&prefix).unwrap();
    fs::write(prefix.join("file"), "x").unwrap();
    // This spec has no install prefix on disk, so its tarball fails.
    let bad = testing::concretize("mpileaks@=2.3");

    let mirror = Mirror::local(dir.path().join("mirror"));
    let result = push_binaries(
        &ctx,
        &mirror,
        &[good.clone(), bad.clone()],
        &PushOptions::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(result.pushed.len(), 1);
    assert_eq!(result.failed.len(), 1);
    assert!(result.failed[0].0.contains("mpileaks"));
}

#[tokio::test]
async fn index_generation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context {
        store: StoreLayout::new(dir.path().join("store")),
        ..Context::default()
    };
    let spec = testing::concretize("zlib@=1.3");
    let prefix = ctx.store.prefix_for(&spec).unwrap();
    fs::create_dir_all(&prefix).unwrap();
    fs::write(prefix.join("file"), "x").unwrap();

    let mirror = Mirror::local(dir.path().join("mirror"));
    let options = PushOptions { update_index: true, ..Default::default() };
    push_binaries(&ctx, &mirror, std::slice::from_ref(&spec), &options, None).await.unwrap();

    let result = conditional_fetch_index(&mirror, &CachedIndex::default()).await.unwrap();
    assert!(!result.fresh);
    let database =
        spack_buildcache::BuildCacheDatabase::from_json(&result.data.unwrap()).unwrap();
    let hash = spec.dag_hash().unwrap();
    let restored = database.get(hash).unwrap().unwrap();
    assert_eq!(restored.dag_hash().unwrap(), hash);

    // Regenerating produces the same index, and the cached digest now
    // reports fresh.
    generate_index(&mirror).await.unwrap();
    let cached = CachedIndex { digest: result.hash.clone(), etag: None };
    let again = conditional_fetch_index(&mirror, &cached).await.unwrap();
    assert!(again.fresh);
}

// An in-process HTTP mirror with ETag handling for the index manifest.
#[derive(Clone)]
struct HttpMirrorState {
    root: Arc<PathBuf>,
    etag: &'static str,
}

async fn serve_object(
    State(state): State<HttpMirrorState>,
    headers: HeaderMap,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> impl IntoResponse {
    if path.ends_with("index.manifest.json") {
        if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
            if if_none_match.to_str().unwrap_or("").trim_matches('"') == state.etag {
                return (StatusCode::NOT_MODIFIED, HeaderMap::new(), Vec::new());
            }
        }
    }
    match fs::read(state.root.join(&path)) {
        Ok(data) => {
            let mut headers = HeaderMap::new();
            if path.ends_with("index.manifest.json") {
                headers
                    .insert(header::ETAG, format!("\"{}\"", state.etag).parse().unwrap());
            }
            (StatusCode::OK, headers, data)
        }
        Err(_) => (StatusCode::NOT_FOUND, HeaderMap::new(), Vec::new()),
    }
}

async fn spawn_http_mirror(root: PathBuf, etag: &'static str) -> SocketAddr {
    let state = HttpMirrorState { root: Arc::new(root), etag };
    let app = Router::new().route("/*path", get(serve_object)).with_state(state);
    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn publish_index(root: &Path, body: &[u8]) -> String {
    let digest = spack_digest::sha256_hex(body);
    let blob_rel = layout::blob_path(&digest);
    let blob_path = root.join(&blob_rel);
    fs::create_dir_all(blob_path.parent().unwrap()).unwrap();
    fs::write(&blob_path, body).unwrap();
    let manifest = BuildcacheManifest::new(vec![BlobRecord::new(
        BuildcacheComponent::Index,
        "none",
        body.len() as u64,
        digest.clone(),
    )]);
    let manifest_path = root.join(layout::index_manifest_path());
    fs::create_dir_all(manifest_path.parent().unwrap()).unwrap();
    fs::write(manifest_path, manifest.to_json()).unwrap();
    digest
}

/// S7: a matching ETag answers 304 and no blob is transferred.
#[tokio::test]
async fn conditional_fetch_not_modified() {
    let dir = tempfile::tempdir().unwrap();
    let body = br#"{"database": {"version": "8", "installs": {}}}"#;
    let digest = publish_index(dir.path(), body);
    let addr = spawn_http_mirror(dir.path().to_path_buf(), "etag-one").await;
    let mirror = Mirror::from_url(&format!("http://{addr}")).unwrap();

    let cached = CachedIndex { digest: Some(digest), etag: Some("etag-one".to_owned()) };
    let result = conditional_fetch_index(&mirror, &cached).await.unwrap();
    assert!(result.fresh);
    assert!(result.data.is_none());
}

/// S8: a changed remote blob digest triggers manifest + blob fetch and
/// reports the new digest and etag.
#[tokio::test]
async fn conditional_fetch_updated_index() {
    let dir = tempfile::tempdir().unwrap();
    let old_body = br#"{"database": {"version": "8", "installs": {}}}"#;
    let old_digest = spack_digest::sha256_hex(old_body);
    let new_body = br#"{"database": {"version": "8", "installs": {}}, "pad": 1}"#;
    let new_digest = publish_index(dir.path(), new_body);
    assert_ne!(old_digest, new_digest);

    let addr = spawn_http_mirror(dir.path().to_path_buf(), "etag-two").await;
    let mirror = Mirror::from_url(&format!("http://{addr}")).unwrap();

    // The cache holds the old digest and a stale etag.
    let cached = CachedIndex { digest: Some(old_digest), etag: Some("etag-stale".to_owned()) };
    let result = conditional_fetch_index(&mirror, &cached).await.unwrap();
    assert!(!result.fresh);
    assert_eq!(result.hash.as_deref(), Some(new_digest.as_str()));
    assert_eq!(result.etag.as_deref(), Some("etag-two"));
    assert_eq!(result.data.as_deref(), Some(std::str::from_utf8(new_body).unwrap()));
}
