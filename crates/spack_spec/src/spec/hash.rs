//! DAG hashes and the concretization stamp.
//!
//! The hash of a node is the SHA-256 of a canonical JSON record of the
//! node and its link/run/test plus direct-build dependency closure,
//! rendered in base-32. `serde_json` maps sort their keys, which makes
//! the serialization canonical without further ceremony.
//!
//! A spliced node's hash ends with the last seven characters of its
//! `build_spec`'s hash, keeping relocation targets recognizable across
//! the splice ("frankenhash").

use fxhash::FxHashMap;
use serde_json::{json, Map, Value};
use spack_digest::Digest as _;

use super::{DepFlags, NodeId, Spec, SpecError};
use crate::arch::microarch::microarch;
use crate::context::Context;
use crate::variant::VariantValue;
use crate::version::Version;

/// Characters of the hash shared between a spliced spec and its build
/// provenance.
pub const SPLICED_HASH_SUFFIX_LEN: usize = 7;

/// Display truncation used by `{hash}` and install layouts.
pub const DISPLAY_HASH_LEN: usize = 32;

impl Spec {
    /// Marks the spec concrete in a single pass: resolves git refs,
    /// validates that every axis of every node is pinned, stamps
    /// `package_hash` from the repository, and computes DAG hashes.
    pub fn mark_concrete(&mut self, ctx: &Context) -> Result<(), SpecError> {
        for id in self.reachable_nodes() {
            let name = match self.nodes[id].name.clone() {
                Some(name) => name,
                None => return Err(SpecError::SpecNotConcrete("anonymous node".to_owned())),
            };
            // Resolve git refs through the repository before checking
            // version concreteness.
            for element in self.nodes[id].versions.elements_mut() {
                if let Version::Git(git) = element {
                    if !git.is_resolved() {
                        if let Some((tag, distance)) =
                            ctx.repo.resolve_git_ref(&name, git.ref_str())
                        {
                            git.resolve(tag, distance);
                        }
                    }
                }
            }
            let node = &mut self.nodes[id];
            let pinned = node.versions.is_concrete()
                && node.variants.is_fully_defined()
                && node.arch.is_concrete();
            if !pinned {
                return Err(SpecError::SpecNotConcrete(name));
            }
            if let Version::Git(git) = &node.versions.elements()[0] {
                if !git.is_resolved() {
                    return Err(SpecError::SpecNotConcrete(name));
                }
            }
            // The package hash is fixed at this moment and never
            // recomputed.
            if node.package_hash.is_none() {
                node.package_hash = ctx.repo.package_hash(&name);
            }
            node.concrete = true;
        }
        self.compute_dag_hashes();
        tracing::debug!(spec = %self, "marked spec concrete");
        Ok(())
    }

    /// Recomputes and stamps the hash of every reachable node.
    pub(crate) fn compute_dag_hashes(&mut self) {
        let mut memo: FxHashMap<NodeId, String> = FxHashMap::default();
        for id in self.reachable_nodes() {
            self.hash_of(id, &mut memo);
        }
        for (id, hash) in memo {
            self.nodes[id].dag_hash = Some(hash);
        }
    }

    fn hash_of(&self, id: NodeId, memo: &mut FxHashMap<NodeId, String>) -> String {
        if let Some(hash) = memo.get(&id) {
            return hash.clone();
        }
        let record = self.node_hash_record(id, memo);
        let serialized = serde_json::to_string(&record).expect("hash record serialization");
        let mut hash = spack_digest::encode_b32(&spack_digest::Sha256::digest(
            serialized.as_bytes(),
        ));
        if let Some(build_spec) = &self.nodes[id].build_spec {
            if let Some(provenance) = &build_spec.root_node().dag_hash {
                overwrite_suffix(&mut hash, provenance);
            }
        }
        memo.insert(id, hash.clone());
        hash
    }

    /// Edges that participate in the hash: link/run/test closure plus
    /// direct build dependencies.
    pub(crate) fn hash_edges(&self, id: NodeId) -> Vec<super::EdgeId> {
        self.nodes[id]
            .out_edges
            .iter()
            .copied()
            .filter(|eid| {
                self.edges[*eid]
                    .as_ref()
                    .map(|e| {
                        e.depflag.intersects(
                            DepFlags::LINK.union(DepFlags::RUN).union(DepFlags::TEST),
                        ) || (e.depflag.intersects(DepFlags::BUILD) && e.direct)
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    fn node_hash_record(&self, id: NodeId, memo: &mut FxHashMap<NodeId, String>) -> Value {
        let node = &self.nodes[id];
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
            record.insert("arch".to_owned(), arch_record(&node.arch));
        }
        record.insert("parameters".to_owned(), parameters_record(node));
        if let Some(package_hash) = &node.package_hash {
            record.insert("package_hash".to_owned(), json!(package_hash));
        }

        let mut deps: Vec<Value> = Vec::new();
        for eid in self.hash_edges(id) {
            let edge = self.edge(eid);
            let child_hash = self.hash_of(edge.child, memo);
            let deptypes: Vec<&str> = edge.depflag.names().collect();
            let mut parameters = Map::new();
            parameters.insert("deptypes".to_owned(), json!(deptypes));
            parameters.insert("virtuals".to_owned(), json!(edge.virtuals.to_vec()));
            if edge.direct {
                parameters.insert("direct".to_owned(), json!(true));
            }
            deps.push(json!({
                "name": self.nodes[edge.child].name_or_empty(),
                "hash": child_hash,
                "parameters": Value::Object(parameters),
            }));
        }
        deps.sort_by(|a, b| {
            let key = |v: &Value| {
                (
                    v["name"].as_str().unwrap_or("").to_owned(),
                    v["hash"].as_str().unwrap_or("").to_owned(),
                )
            };
            key(a).cmp(&key(b))
        });
        if !deps.is_empty() {
            record.insert("dependencies".to_owned(), Value::Array(deps));
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
        Value::Object(record)
    }
}

/// Replaces the trailing characters of `hash` with the tail of the
/// provenance hash.
pub(crate) fn overwrite_suffix(hash: &mut String, provenance: &str) {
    if hash.len() < SPLICED_HASH_SUFFIX_LEN || provenance.len() < SPLICED_HASH_SUFFIX_LEN {
        return;
    }
    let keep = hash.len() - SPLICED_HASH_SUFFIX_LEN;
    let suffix = &provenance[provenance.len() - SPLICED_HASH_SUFFIX_LEN..];
    hash.truncate(keep);
    hash.push_str(suffix);
}

fn arch_record(arch: &crate::arch::ArchSpec) -> Value {
    let mut record = Map::new();
    if let Some(platform) = arch.platform {
        record.insert("platform".to_owned(), json!(platform.to_string()));
    }
    if let Some(os) = &arch.os {
        record.insert("platform_os".to_owned(), json!(os));
    }
    if let Some(target) = &arch.target {
        let value = match target.as_single().and_then(microarch) {
            // Vendor chips serialize as a full microarchitecture
            // record, generic levels as a bare name.
            Some(uarch) if !uarch.is_generic() => json!({
                "name": uarch.name,
                "vendor": uarch.vendor,
                "features": Vec::<String>::new(),
                "generation": 0,
                "parents": uarch.parents.to_vec(),
            }),
            _ => json!(target.to_string()),
        };
        record.insert("target".to_owned(), value);
    }
    Value::Object(record)
}

fn parameters_record(node: &super::SpecNode) -> Value {
    use crate::variant::FlagKind;
    use strum::IntoEnumIterator;

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
    for kind in FlagKind::iter() {
        let flags: Vec<&str> = node.flags.get(kind).iter().map(|f| f.value.as_str()).collect();
        parameters.insert(kind.to_string(), json!(flags));
    }
    Value::Object(parameters)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;

    #[test]
    fn concrete_specs_get_stable_hashes() {
        let a = testing::concretize("mpileaks@=2.3+shared");
        let b = testing::concretize("mpileaks@=2.3+shared");
        assert_eq!(a.dag_hash().unwrap(), b.dag_hash().unwrap());

        let different = testing::concretize("mpileaks@=2.4+shared");
        assert_ne!(a.dag_hash().unwrap(), different.dag_hash().unwrap());
    }

    #[test]
    fn hash_covers_dependencies() {
        let a = testing::concretize("mpileaks@=2.3^mpich@=3.2");
        let b = testing::concretize("mpileaks@=2.3^mpich@=3.3");
        assert_ne!(a.dag_hash().unwrap(), b.dag_hash().unwrap());
    }

    #[test]
    fn abstract_specs_have_no_hash() {
        let spec: Spec = "mpileaks@2.3".parse().unwrap();
        assert!(matches!(spec.dag_hash(), Err(SpecError::SpecNotConcrete(_))));
    }

    #[test]
    fn suffix_overwrite() {
        let mut hash = "abcdefghijklmnop".to_owned();
        overwrite_suffix(&mut hash, "zzzzzzzzz1234567");
        assert_eq!(hash, "abcdefghi1234567");
    }

    #[test]
    fn concrete_identity_property() {
        let spec = testing::concretize("mpileaks@=2.3");
        assert!(spec.satisfies(&spec.clone()));
        let other = testing::concretize("mpileaks@=2.3");
        assert_eq!(
            spec.satisfies(&other),
            spec.dag_hash().unwrap() == other.dag_hash().unwrap()
        );
    }
}
