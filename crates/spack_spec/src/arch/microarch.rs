//! A reduced microarchitecture family graph.
//!
//! Targets form a partial order: `a <= b` when `a` is an ancestor of
//! `b`, i.e. anything compiled for `a` runs on `b`. Generic levels
//! (`x86_64`, `x86_64_v2`, ...) and vendor chips live in the same graph;
//! vendor nodes additionally point at the generic level they implement.

use std::cmp::Ordering;

pub const GENERIC_VENDOR: &str = "generic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Microarchitecture {
    pub name: &'static str,
    pub parents: &'static [&'static str],
    pub vendor: &'static str,
}

impl Microarchitecture {
    pub fn is_generic(&self) -> bool {
        self.vendor == GENERIC_VENDOR
    }

    /// All transitive ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<&'static Microarchitecture> {
        let mut out: Vec<&'static Microarchitecture> = Vec::new();
        let mut queue: Vec<&'static str> = self.parents.to_vec();
        while let Some(name) = queue.pop() {
            if let Some(parent) = microarch(name) {
                if !out.iter().any(|a| a.name == parent.name) {
                    queue.extend(parent.parents.iter().copied());
                    out.push(parent);
                }
            }
        }
        out
    }

    /// The generic root this chip descends from (itself for roots).
    pub fn family(&self) -> &'static Microarchitecture {
        self.ancestors()
            .into_iter()
            .find(|a| a.is_generic() && a.parents.is_empty())
            .unwrap_or_else(|| microarch(self.name).expect("family of unregistered microarch"))
    }
}

macro_rules! uarch {
    ($name:literal, [$($parent:literal),*], $vendor:literal) => {
        Microarchitecture { name: $name, parents: &[$($parent),*], vendor: $vendor }
    };
}

static MICROARCHITECTURES: &[Microarchitecture] = &[
    // x86_64 generic levels
    uarch!("x86_64", [], "generic"),
    uarch!("x86_64_v2", ["x86_64"], "generic"),
    uarch!("x86_64_v3", ["x86_64_v2"], "generic"),
    uarch!("x86_64_v4", ["x86_64_v3"], "generic"),
    // Intel
    uarch!("nehalem", ["x86_64"], "GenuineIntel"),
    uarch!("westmere", ["nehalem"], "GenuineIntel"),
    uarch!("sandybridge", ["westmere"], "GenuineIntel"),
    uarch!("ivybridge", ["sandybridge"], "GenuineIntel"),
    uarch!("haswell", ["ivybridge", "x86_64_v3"], "GenuineIntel"),
    uarch!("broadwell", ["haswell"], "GenuineIntel"),
    uarch!("skylake", ["broadwell"], "GenuineIntel"),
    uarch!("skylake_avx512", ["skylake"], "GenuineIntel"),
    uarch!("icelake", ["skylake_avx512", "x86_64_v4"], "GenuineIntel"),
    // AMD
    uarch!("zen", ["x86_64_v2"], "AuthenticAMD"),
    uarch!("zen2", ["zen"], "AuthenticAMD"),
    uarch!("zen3", ["zen2", "x86_64_v3"], "AuthenticAMD"),
    uarch!("zen4", ["zen3", "x86_64_v4"], "AuthenticAMD"),
    // aarch64
    uarch!("aarch64", [], "generic"),
    uarch!("neoverse_n1", ["aarch64"], "ARM"),
    uarch!("neoverse_v1", ["neoverse_n1"], "ARM"),
    uarch!("m1", ["aarch64"], "Apple"),
    uarch!("m2", ["m1"], "Apple"),
    // ppc64le
    uarch!("ppc64le", [], "generic"),
    uarch!("power8le", ["ppc64le"], "IBM"),
    uarch!("power9le", ["power8le"], "IBM"),
    uarch!("power10le", ["power9le"], "IBM"),
    // riscv
    uarch!("riscv64", [], "generic"),
];

/// Looks up a microarchitecture by name.
pub fn microarch(name: &str) -> Option<&'static Microarchitecture> {
    MICROARCHITECTURES.iter().find(|m| m.name == name)
}

/// The partial order on targets. `Less` means "older / runs on fewer
/// machines"; unrelated chips are incomparable. Unregistered names are
/// comparable only to themselves.
pub fn target_cmp(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    let (ma, mb) = (microarch(a)?, microarch(b)?);
    if mb.ancestors().iter().any(|anc| anc.name == ma.name) {
        return Some(Ordering::Less);
    }
    if ma.ancestors().iter().any(|anc| anc.name == mb.name) {
        return Some(Ordering::Greater);
    }
    None
}

/// `a <= b` under the family order.
pub fn target_le(a: &str, b: &str) -> bool {
    matches!(target_cmp(a, b), Some(Ordering::Less | Ordering::Equal))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generic_levels_are_ordered() {
        assert!(target_le("x86_64", "x86_64_v3"));
        assert!(target_le("x86_64_v2", "x86_64_v4"));
        assert!(!target_le("x86_64_v4", "x86_64"));
    }

    #[test]
    fn vendor_chips_descend_from_generic_levels() {
        assert!(target_le("x86_64", "haswell"));
        assert!(target_le("x86_64_v3", "skylake"));
        assert!(target_le("x86_64_v3", "zen4"));
        assert_eq!(microarch("skylake").unwrap().family().name, "x86_64");
    }

    #[test]
    fn unrelated_chips_are_incomparable() {
        assert_eq!(target_cmp("zen2", "skylake"), None);
        assert_eq!(target_cmp("aarch64", "x86_64"), None);
        assert_eq!(target_cmp("m1", "neoverse_n1"), None);
    }

    #[test]
    fn unknown_names_compare_only_to_themselves() {
        assert_eq!(target_cmp("fancychip", "fancychip"), Some(Ordering::Equal));
        assert_eq!(target_cmp("fancychip", "x86_64"), None);
    }
}
