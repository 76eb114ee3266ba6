//! The specfile codec: canonical JSON serialization of specs.
//!
//! The writer always emits the current format:
//!
//! ```json
//! {"spec": {"_meta": {"version": 5}, "nodes": [ ... ]}}
//! ```
//!
//! The reader accepts every prior format, translating as it goes:
//! format 1 keys nodes by name, 2 and 3 promote the name into a field,
//! 4 moves deptypes and virtuals into dependency `parameters`, and 5
//! drops the per-node compiler in favor of a direct build dependency
//! providing the `c`/`cxx`/`fortran` virtuals.
//!
//! Dependency records reference children by hash; edges are rebuilt by
//! a lookup pass once all nodes are loaded. A clear-signed envelope
//! (the output of `gpg --clearsign`) is detected and unwrapped
//! transparently.

use fxhash::FxHashMap;
use serde_json::{json, Map, Value};
use smallvec::SmallVec;
use thiserror::Error;

use crate::arch::{ArchSpec, ParseArchError, TargetSpec};
use crate::spec::traverse::TraverseOptions;
use crate::spec::{DepFlags, Edge, External, NodeId, Spec, SpecError, SpecNode};
use crate::variant::{FlagKind, Variant, VariantError, VariantValue};
use crate::version::{ParseVersionError, Version, VersionList};

/// The format version the writer emits.
pub const SPECFILE_FORMAT_VERSION: u64 = 5;

/// Virtuals attributed to the compiler dependency when translating
/// pre-v5 compiler fields.
const COMPILER_VIRTUALS: &[&str] = &["c", "cxx", "fortran"];

#[derive(Debug, Error)]
pub enum SpecfileError {
    #[error("invalid specfile: {0}")]
    InvalidSpecfileFormat(String),
    #[error("unsupported specfile format version {0}")]
    UnsupportedSpecfileVersion(u64),
    #[error("specfile is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Version(#[from] ParseVersionError),
    #[error(transparent)]
    Arch(#[from] ParseArchError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error(transparent)]
    Spec(#[from] SpecError),
}

fn invalid(message: impl Into<String>) -> SpecfileError {
    SpecfileError::InvalidSpecfileFormat(message.into())
}

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const CLEARSIGN_SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----";

/// Extracts the payload of a clear-signed envelope, or returns the
/// input unchanged when it is not clear-signed.
pub fn extract_clearsigned(text: &str) -> &str {
    let Some(header) = text.find(CLEARSIGN_HEADER) else {
        return text;
    };
    let body_start = &text[header..];
    // Armor headers (e.g. "Hash: SHA256") end at the first blank line.
    let Some(blank) = body_start.find("\n\n") else {
        return text;
    };
    let payload = &body_start[blank + 2..];
    match payload.find(CLEARSIGN_SIGNATURE) {
        Some(end) => payload[..end].trim_end(),
        None => text,
    }
}

/// Is this text a clear-signed envelope?
pub fn is_clearsigned(text: &str) -> bool {
    text.trim_start().starts_with(CLEARSIGN_HEADER)
}

impl Spec {
    /// Serializes into the current specfile format. All dependency
    /// records are keyed by hash, so every node with dependencies must
    /// carry one.
    pub fn to_specfile(&self) -> Result<Value, SpecfileError> {
        let mut nodes: Vec<Value> = Vec::new();
        let mut written: Vec<String> = Vec::new();
        self.write_nodes(&mut nodes, &mut written)?;
        Ok(json!({
            "spec": {
                "_meta": { "version": SPECFILE_FORMAT_VERSION },
                "nodes": nodes,
            }
        }))
    }

    pub fn to_specfile_string(&self) -> Result<String, SpecfileError> {
        Ok(serde_json::to_string_pretty(&self.to_specfile()?)?)
    }

    fn write_nodes(
        &self,
        nodes: &mut Vec<Value>,
        written: &mut Vec<String>,
    ) -> Result<(), SpecfileError> {
        for item in self.traverse(TraverseOptions::default()) {
            let node = self.node(item.node);
            if let Some(hash) = &node.dag_hash {
                if written.contains(hash) {
                    continue;
                }
                written.push(hash.clone());
            }
            nodes.push(self.node_record(item.node)?);
            // A spliced spec also records its provenance nodes so the
            // file is self-contained.
            if let Some(build_spec) = &node.build_spec {
                build_spec.write_nodes(nodes, written)?;
            }
        }
        Ok(())
    }

    fn node_record(&self, id: NodeId) -> Result<Value, SpecfileError> {
        let node = self.node(id);
        let mut record = Map::new();
        if let Some(name) = &node.name {
            record.insert("name".to_owned(), json!(name));
        }
        if let Some(namespace) = &node.namespace {
            record.insert("namespace".to_owned(), json!(namespace));
        }
        let versions: Vec<String> =
            node.versions.elements().iter().map(ToString::to_string).collect();
        record.insert("versions".to_owned(), json!(versions));
        if !node.arch.is_empty() {
            let mut arch = Map::new();
            if let Some(platform) = node.arch.platform {
                arch.insert("platform".to_owned(), json!(platform.to_string()));
            }
            if let Some(os) = &node.arch.os {
                arch.insert("platform_os".to_owned(), json!(os));
            }
            if let Some(target) = &node.arch.target {
                arch.insert("target".to_owned(), json!(target.to_string()));
            }
            record.insert("arch".to_owned(), Value::Object(arch));
        }

        let mut parameters = Map::new();
        for variant in node.variants.iter() {
            let value = match &variant.value {
                VariantValue::Bool(b) => json!(b),
                VariantValue::Single(s) => json!(s),
                VariantValue::Multi(set) => json!(set.iter().collect::<Vec<_>>()),
                VariantValue::Any => json!("*"),
            };
            parameters.insert(variant.name().to_owned(), value);
        }
        for (kind, flags) in node.flags.iter() {
            let values: Vec<&str> = flags.iter().map(|f| f.value.as_str()).collect();
            parameters.insert(kind.to_string(), json!(values));
        }
        if !parameters.is_empty() {
            record.insert("parameters".to_owned(), Value::Object(parameters));
        }

        if let Some(external) = &node.external {
            record.insert(
                "external".to_owned(),
                json!({
                    "path": external.path,
                    "module": external.modules,
                }),
            );
        }
        if let Some(hash) = &node.dag_hash {
            record.insert("hash".to_owned(), json!(hash));
        }
        if let Some(package_hash) = &node.package_hash {
            record.insert("package_hash".to_owned(), json!(package_hash));
        }

        let mut dependencies: Vec<Value> = Vec::new();
        for eid in self.dependencies(id) {
            let edge = self.edge(eid);
            let child = self.node(edge.child);
            let hash = child.dag_hash.clone().ok_or_else(|| {
                SpecError::SpecNotConcrete(child.name_or_empty().to_owned())
            })?;
            let deptypes: Vec<&str> = edge.depflag.names().collect();
            let mut parameters = Map::new();
            parameters.insert("deptypes".to_owned(), json!(deptypes));
            parameters.insert("virtuals".to_owned(), json!(edge.virtuals.to_vec()));
            parameters.insert("direct".to_owned(), json!(edge.direct));
            dependencies.push(json!({
                "name": child.name_or_empty(),
                "hash": hash,
                "parameters": Value::Object(parameters),
            }));
        }
        if !dependencies.is_empty() {
            record.insert("dependencies".to_owned(), Value::Array(dependencies));
        }

        if let Some(build_spec) = &node.build_spec {
            record.insert(
                "build_spec".to_owned(),
                json!({
                    "name": build_spec.root_node().name_or_empty(),
                    "hash": build_spec.root_node().dag_hash.clone().unwrap_or_default(),
                }),
            );
        }
        Ok(Value::Object(record))
    }

    /// Reads a specfile in any supported format, unwrapping a
    /// clear-signed envelope when present.
    pub fn from_specfile_str(text: &str) -> Result<Spec, SpecfileError> {
        let value: Value = serde_json::from_str(extract_clearsigned(text))?;
        Self::from_specfile_value(&value)
    }

    pub fn from_specfile_value(value: &Value) -> Result<Spec, SpecfileError> {
        let spec_obj = value.get("spec").ok_or_else(|| invalid("missing `spec` key"))?;
        let version = specfile_version(spec_obj)?;
        if version > SPECFILE_FORMAT_VERSION {
            return Err(SpecfileError::UnsupportedSpecfileVersion(version));
        }

        let records = node_records(spec_obj, version)?;
        if records.is_empty() {
            return Err(invalid("specfile has no nodes"));
        }

        let mut spec = Spec::default();
        let mut by_hash: FxHashMap<String, NodeId> = FxHashMap::default();
        let mut by_name: FxHashMap<String, NodeId> = FxHashMap::default();
        for (name, body) in &records {
            let id = spec.add_node(read_node(name.as_deref(), body, version)?);
            if let Some(hash) = &spec.node(id).dag_hash {
                by_hash.insert(hash.clone(), id);
            }
            if let Some(name) = &spec.node(id).name {
                by_name.entry(name.clone()).or_insert(id);
            }
        }

        // Second pass: rebuild edges from the hash references.
        for (index, (_, body)) in records.iter().enumerate() {
            read_dependencies(&mut spec, index, body, version, &by_hash, &by_name)?;
            // Pre-v5 compiler fields become direct build dependencies.
            if version < SPECFILE_FORMAT_VERSION {
                translate_compiler(&mut spec, index, body)?;
            }
        }

        // Resolve build_spec provenance references.
        for (index, (_, body)) in records.iter().enumerate() {
            let Some(reference) = body.get("build_spec") else { continue };
            let hash = reference
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("build_spec reference without hash"))?;
            if let Some(&target) = by_hash.get(hash) {
                let provenance = spec.subspec(target);
                spec.node_mut(index).build_spec = Some(Box::new(provenance));
            }
        }

        // The root is the node nothing depends on.
        spec.root = (0..spec.nodes.len())
            .find(|id| spec.dependents(*id).next().is_none())
            .ok_or_else(|| invalid("specfile has no root node"))?;
        spec.compact();
        Ok(spec)
    }
}

fn specfile_version(spec_obj: &Value) -> Result<u64, SpecfileError> {
    if let Some(meta) = spec_obj.get("_meta") {
        return meta
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid("malformed _meta"));
    }
    if spec_obj.get("nodes").is_some() {
        return Ok(2);
    }
    if spec_obj.is_object() {
        return Ok(1);
    }
    Err(invalid("unrecognized specfile layout"))
}

type NamedRecord = (Option<String>, Value);

fn node_records(spec_obj: &Value, version: u64) -> Result<Vec<NamedRecord>, SpecfileError> {
    if version == 1 {
        let map = spec_obj.as_object().ok_or_else(|| invalid("format 1 expects an object"))?;
        return Ok(map
            .iter()
            .filter(|(key, _)| *key != "_meta")
            .map(|(name, body)| (Some(name.clone()), body.clone()))
            .collect());
    }
    let nodes = spec_obj
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing `nodes` list"))?;
    nodes
        .iter()
        .map(|body| {
            let name = body.get("name").and_then(Value::as_str).map(str::to_owned);
            Ok((name, body.clone()))
        })
        .collect()
}

fn read_node(
    name: Option<&str>,
    body: &Value,
    version: u64,
) -> Result<SpecNode, SpecfileError> {
    let mut node = SpecNode::default();
    node.name = name.map(str::to_owned);
    node.namespace = body.get("namespace").and_then(Value::as_str).map(str::to_owned);
    node.dag_hash = body.get("hash").and_then(Value::as_str).map(str::to_owned);
    node.package_hash = body.get("package_hash").and_then(Value::as_str).map(str::to_owned);
    node.concrete = node.dag_hash.is_some();
    node.original_specfile_version = Some(version);

    let concrete = node.concrete;
    let mut versions = VersionList::new();
    if let Some(list) = body.get("versions").and_then(Value::as_array) {
        for element in list {
            let text = element.as_str().ok_or_else(|| invalid("non-string version"))?;
            versions.insert(parse_recorded_version(text, concrete)?);
        }
    } else if let Some(single) = body.get("version").and_then(Value::as_str) {
        versions.insert(parse_recorded_version(single, concrete)?);
    }
    node.versions = versions;

    if let Some(arch) = body.get("arch") {
        node.arch = read_arch(arch)?;
    }

    if let Some(parameters) = body.get("parameters").and_then(Value::as_object) {
        for (key, value) in parameters {
            if matches!(key.as_str(), "deptypes" | "virtuals" | "direct" | "patches") {
                continue;
            }
            if let Ok(kind) = key.parse::<FlagKind>() {
                if let Some(tokens) = value.as_array() {
                    let joined: Vec<&str> =
                        tokens.iter().filter_map(Value::as_str).collect();
                    if !joined.is_empty() {
                        node.flags.add_flags(kind, &joined.join(" "), false);
                    }
                }
                continue;
            }
            let variant_value = match value {
                Value::Bool(b) => VariantValue::Bool(*b),
                Value::String(s) if s == "*" => VariantValue::Any,
                Value::String(s) => VariantValue::from_payload(s)?,
                Value::Array(values) => VariantValue::Multi(
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect(),
                ),
                other => return Err(invalid(format!("bad variant value `{other}`"))),
            };
            node.variants.insert(Variant::new(key.clone(), variant_value, false)?);
        }
    }

    if let Some(external) = body.get("external").and_then(Value::as_object) {
        node.external = Some(External {
            path: external.get("path").and_then(Value::as_str).map(str::to_owned),
            modules: external
                .get("module")
                .and_then(Value::as_array)
                .map(|m| m.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                .unwrap_or_default(),
        });
    }
    if let Some(compiler) = body.get("compiler").and_then(Value::as_object) {
        let name = compiler.get("name").and_then(Value::as_str).unwrap_or("");
        let version = compiler.get("version").and_then(Value::as_str).unwrap_or("");
        node.legacy_compiler = Some(format!("{name}@{version}"));
    }
    if let Some(annotations) = body.get("annotations").and_then(Value::as_object) {
        if let Some(original) =
            annotations.get("original_specfile_version").and_then(Value::as_u64)
        {
            node.original_specfile_version = Some(original);
        }
        if let Some(compiler) = annotations.get("compiler").and_then(Value::as_str) {
            node.legacy_compiler = Some(compiler.to_owned());
        }
    }
    Ok(node)
}

/// In a concrete node record a bare `3.2` is the pinned version, not
/// the prefix range the surface syntax would make of it.
fn parse_recorded_version(text: &str, concrete: bool) -> Result<Version, SpecfileError> {
    let version: Version = text.parse()?;
    if concrete {
        if let Version::Range(range) = &version {
            if let (Some(lo), Some(hi)) = (range.lo(), range.hi()) {
                if lo == hi {
                    return Ok(Version::Standard(lo.clone()));
                }
            }
        }
    }
    Ok(version)
}

fn read_arch(value: &Value) -> Result<ArchSpec, SpecfileError> {
    let object = value.as_object().ok_or_else(|| invalid("arch must be an object"))?;
    let mut arch = ArchSpec::default();
    if let Some(platform) = object.get("platform").and_then(Value::as_str) {
        arch.platform = Some(
            platform
                .parse()
                .map_err(|_| ParseArchError::UnknownPlatform(platform.to_owned()))?,
        );
    }
    if let Some(os) = object.get("platform_os").and_then(Value::as_str) {
        arch.os = Some(os.to_owned());
    }
    match object.get("target") {
        Some(Value::String(target)) => arch.target = Some(target.parse()?),
        // Microarchitecture dict form: only the name matters here.
        Some(Value::Object(target)) => {
            let name = target
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("target dict without name"))?;
            arch.target = Some(TargetSpec::single(name));
        }
        _ => {}
    }
    Ok(arch)
}

fn read_dependencies(
    spec: &mut Spec,
    parent: NodeId,
    body: &Value,
    version: u64,
    by_hash: &FxHashMap<String, NodeId>,
    by_name: &FxHashMap<String, NodeId>,
) -> Result<(), SpecfileError> {
    let Some(dependencies) = body.get("dependencies") else {
        return Ok(());
    };
    // Format 1 keys dependencies by name; later formats use a list.
    let entries: Vec<(Option<&str>, &Value)> = match dependencies {
        Value::Object(map) => map.iter().map(|(name, v)| (Some(name.as_str()), v)).collect(),
        Value::Array(list) => list
            .iter()
            .map(|v| (v.get("name").and_then(Value::as_str), v))
            .collect(),
        _ => return Err(invalid("malformed dependencies")),
    };
    for (name, entry) in entries {
        let hash = entry.get("hash").and_then(Value::as_str);
        let child = hash
            .and_then(|h| by_hash.get(h).copied())
            .or_else(|| name.and_then(|n| by_name.get(n).copied()))
            .ok_or_else(|| {
                invalid(format!("dangling dependency reference `{}`", name.unwrap_or("?")))
            })?;
        let (depflag, virtuals, direct) = if version >= 4 {
            let parameters = entry.get("parameters").and_then(Value::as_object);
            let depflag = parameters
                .and_then(|p| p.get("deptypes"))
                .map(read_depflag)
                .transpose()?
                .unwrap_or(DepFlags::DEFAULT);
            let virtuals: SmallVec<[String; 2]> = parameters
                .and_then(|p| p.get("virtuals"))
                .and_then(Value::as_array)
                .map(|v| v.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                .unwrap_or_default();
            let direct = parameters
                .and_then(|p| p.get("direct"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (depflag, virtuals, direct)
        } else {
            let depflag = entry
                .get("type")
                .map(read_depflag)
                .transpose()?
                .unwrap_or(DepFlags::DEFAULT);
            (depflag, SmallVec::new(), false)
        };
        let mut virtuals = virtuals;
        virtuals.sort();
        spec.push_edge(Edge { parent, child, depflag, virtuals, direct, when: None });
    }
    Ok(())
}

fn read_depflag(value: &Value) -> Result<DepFlags, SpecfileError> {
    let names = value
        .as_array()
        .ok_or_else(|| invalid("dependency types must be a list"))?;
    let mut flags = DepFlags::NONE;
    for name in names.iter().filter_map(Value::as_str) {
        flags = flags.union(
            name.parse()
                .map_err(|_| invalid(format!("unknown dependency type `{name}`")))?,
        );
    }
    Ok(if flags.is_empty() { DepFlags::DEFAULT } else { flags })
}

/// Turns a pre-v5 `compiler` field into a direct build dependency
/// providing the compiler virtuals.
fn translate_compiler(
    spec: &mut Spec,
    parent: NodeId,
    body: &Value,
) -> Result<(), SpecfileError> {
    let Some(compiler) = body.get("compiler").and_then(Value::as_object) else {
        return Ok(());
    };
    let name = compiler
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("compiler without name"))?;
    // The compiler node may already exist as a real dependency.
    let existing = spec
        .dependencies(parent)
        .find(|eid| spec.node(spec.edge(*eid).child).name.as_deref() == Some(name));
    if existing.is_some() {
        return Ok(());
    }
    let mut node = SpecNode::named(name);
    if let Some(version) = compiler.get("version").and_then(Value::as_str) {
        let mut versions = VersionList::new();
        versions.insert(parse_recorded_version(version, true)?);
        node.versions = versions;
    }
    node.concrete = spec.node(parent).concrete;
    let child = spec.add_node(node);
    let virtuals: SmallVec<[String; 2]> =
        COMPILER_VIRTUALS.iter().map(|v| (*v).to_owned()).collect();
    spec.push_edge(Edge {
        parent,
        child,
        depflag: DepFlags::BUILD,
        virtuals,
        direct: true,
        when: None,
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;

    #[test]
    fn round_trip_preserves_equality_and_hash() {
        let spec = testing::concretize("mpileaks@=2.3+shared^callpath@=1.0^[virtuals=mpi]mpich@=3.2");
        let text = spec.to_specfile_string().unwrap();
        let decoded = Spec::from_specfile_str(&text).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(decoded.dag_hash().unwrap(), spec.dag_hash().unwrap());

        let mpich = decoded.find_by_name("mpich").unwrap();
        assert!(decoded.node(mpich).concrete);
        assert_eq!(decoded.find_provider("mpi"), Some(mpich));
    }

    #[test]
    fn writer_emits_current_format() {
        let spec = testing::concretize("zlib@=1.3");
        let value = spec.to_specfile().unwrap();
        assert_eq!(value["spec"]["_meta"]["version"], SPECFILE_FORMAT_VERSION);
        assert!(value["spec"]["nodes"].as_array().unwrap().len() == 1);
    }

    #[test]
    fn reads_format_one_dict() {
        let text = r#"{
            "spec": {
                "mpileaks": {
                    "version": "2.3",
                    "hash": "rootrootrootroot",
                    "dependencies": {
                        "mpich": {"hash": "depdepdepdepdep", "type": ["build", "link"]}
                    }
                },
                "mpich": {
                    "version": "3.2",
                    "hash": "depdepdepdepdep"
                }
            }
        }"#;
        let spec = Spec::from_specfile_str(text).unwrap();
        assert_eq!(spec.name(), Some("mpileaks"));
        assert_eq!(spec.root_node().versions.to_string(), "=2.3");
        let mpich = spec.find_by_name("mpich").unwrap();
        assert_eq!(spec.node(mpich).versions.to_string(), "=3.2");
        assert_eq!(spec.root_node().original_specfile_version, Some(1));
    }

    #[test]
    fn reads_format_four_with_compiler_translation() {
        let text = r#"{
            "spec": {
                "_meta": {"version": 4},
                "nodes": [
                    {
                        "name": "libelf",
                        "versions": ["0.8.13"],
                        "hash": "libelfhashhhhhhh",
                        "compiler": {"name": "gcc", "version": "12.3.0"},
                        "parameters": {"shared": true, "cflags": ["-O2"]}
                    }
                ]
            }
        }"#;
        let spec = Spec::from_specfile_str(text).unwrap();
        let gcc = spec.find_by_name("gcc").unwrap();
        assert_eq!(spec.node(gcc).versions.to_string(), "=12.3.0");
        let edge_id = spec.dependencies(spec.root()).next().unwrap();
        let edge = spec.edge(edge_id);
        assert!(edge.direct);
        assert_eq!(edge.virtuals.as_slice(), ["c", "cxx", "fortran"]);
        assert_eq!(spec.root_node().legacy_compiler.as_deref(), Some("gcc@12.3.0"));
        // Compilers provide the language virtuals after translation.
        assert_eq!(spec.find_provider("c"), Some(gcc));
    }

    #[test]
    fn rejects_future_versions() {
        let text = r#"{"spec": {"_meta": {"version": 99}, "nodes": []}}"#;
        assert!(matches!(
            Spec::from_specfile_str(text),
            Err(SpecfileError::UnsupportedSpecfileVersion(99))
        ));
    }

    #[test]
    fn clearsign_envelope_is_unwrapped() {
        let spec = testing::concretize("zlib@=1.3");
        let json = spec.to_specfile_string().unwrap();
        let signed = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\n{json}\n-----BEGIN PGP SIGNATURE-----\n\nxyzzy\n-----END PGP SIGNATURE-----\n"
        );
        assert!(is_clearsigned(&signed));
        let decoded = Spec::from_specfile_str(&signed).unwrap();
        assert_eq!(decoded, spec);
    }
}
