//! Test support: a mock concretizer.
//!
//! The real concretizer is an external solver; tests need concrete
//! specs without one. [`concretize`] pins every unset axis with
//! deterministic defaults and stamps the result through
//! [`Spec::mark_concrete`](crate::spec::Spec::mark_concrete).

use smallvec::SmallVec;

use crate::arch::{Platform, TargetSpec};
use crate::context::Context;
use crate::spec::Spec;
use crate::version::{StandardVersion, Version, VersionList};

/// Parses `text` and concretizes it with defaults: version `1.0` when
/// unconstrained (or the lower bound of a range), platform
/// `linux-ubuntu22.04-x86_64`.
pub fn concretize(text: &str) -> Spec {
    concretize_with(&Context::default(), text)
}

pub fn concretize_with(ctx: &Context, text: &str) -> Spec {
    let mut spec: Spec = text.parse().unwrap_or_else(|e| panic!("bad spec `{text}`: {e}"));
    for id in spec.reachable_nodes() {
        let node = spec.node_mut(id);
        if !node.versions.is_concrete() {
            let pinned = pick_version(&node.versions);
            node.versions = VersionList::from_version(Version::Standard(pinned));
        }
        if !node.arch.is_concrete() {
            if node.arch.platform.is_none() {
                node.arch.platform = Some(Platform::Linux);
            }
            if node.arch.os.is_none() {
                node.arch.os = Some("ubuntu22.04".to_owned());
            }
            node.arch.target = Some(match &node.arch.target {
                None => TargetSpec::single("x86_64"),
                Some(target) => match target.as_single() {
                    Some(single) => TargetSpec::single(single),
                    // Pin a range to one of its bounds.
                    None => match target.elements().first() {
                        Some(crate::arch::TargetElement::Range { lo: Some(lo), .. }) => {
                            TargetSpec::single(lo.clone())
                        }
                        Some(crate::arch::TargetElement::Range { hi: Some(hi), .. }) => {
                            TargetSpec::single(hi.clone())
                        }
                        _ => TargetSpec::single("x86_64"),
                    },
                },
            });
        }
    }
    spec.mark_concrete(ctx).expect("mock concretization failed");
    spec
}

fn pick_version(versions: &VersionList) -> StandardVersion {
    let fallback = || "1.0".parse::<StandardVersion>().unwrap();
    match versions.elements() {
        [] => fallback(),
        elements => match &elements[0] {
            Version::Standard(v) => v.clone(),
            Version::Git(g) => g.ref_version().cloned().unwrap_or_else(fallback),
            Version::Range(r) => {
                r.lo().or(r.hi()).cloned().unwrap_or_else(fallback)
            }
            Version::List(_) => fallback(),
        },
    }
}

/// A version list pinned to exactly `version`.
pub fn pinned(version: &str) -> VersionList {
    let v: StandardVersion = version.parse().unwrap();
    VersionList::from_version(Version::Standard(v))
}

/// Sorted virtuals list helper for edge construction.
pub fn virtuals(names: &[&str]) -> SmallVec<[String; 2]> {
    let mut list: SmallVec<[String; 2]> = names.iter().map(|n| (*n).to_owned()).collect();
    list.sort();
    list
}
