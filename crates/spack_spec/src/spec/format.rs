//! The spec format template language and `Display`.
//!
//! A template is literal text with `{...}` fields. A field is an
//! optional literal prefix, an optional sigil (`@`, `%`, `/`) and an
//! attribute path; prefix and sigil print only when the attribute
//! resolves to something non-empty:
//!
//! ```text
//! {name}{@versions}{variants}{ arch=architecture}{/abstract_hash}
//! ```
//!
//! `{/hash:7}` truncates the hash, `{^mpi.version}` reaches into the
//! dependency providing `mpi`, and `\{` escapes a literal brace. With
//! color enabled each field class gets its own ANSI color.

use ansi_term::Colour;
use lazy_regex::regex_captures;

use super::hash::DISPLAY_HASH_LEN;
use super::traverse::TraverseOptions;
use super::{DepFlags, NodeId, Spec, SpecError};

/// The default rendering of a spec's root node.
pub const DEFAULT_FORMAT: &str =
    "{name}{@versions}{ compiler_flags}{variants}{ arch=architecture}{/abstract_hash}";

impl Spec {
    /// Renders the root node with the given template.
    pub fn format(&self, template: &str) -> Result<String, SpecError> {
        self.format_node(self.root, template, false)
    }

    /// As [`format`](Self::format), with ANSI colors per field class.
    pub fn format_colored(&self, template: &str) -> Result<String, SpecError> {
        self.format_node(self.root, template, true)
    }

    fn format_node(&self, node: NodeId, template: &str, color: bool) -> Result<String, SpecError> {
        let bad = |msg: &str| SpecError::BadFormatTemplate(format!("{msg} in `{template}`"));
        let mut out = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => return Err(bad("dangling escape")),
                },
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(inner) => field.push(inner),
                            None => return Err(bad("unbalanced `{`")),
                        }
                    }
                    out.push_str(&self.expand_field(node, &field, color, template)?);
                }
                '}' => return Err(bad("unbalanced `}`")),
                literal => out.push(literal),
            }
        }
        Ok(out)
    }

    fn expand_field(
        &self,
        node: NodeId,
        field: &str,
        color: bool,
        template: &str,
    ) -> Result<String, SpecError> {
        let bad = || SpecError::BadFormatTemplate(format!("bad field `{{{field}}}` in `{template}`"));

        // Dependency access: {^mpi.version}.
        if let Some(rest) = field.strip_prefix('^') {
            let (dep, attr) = rest.split_once('.').ok_or_else(bad)?;
            let target = self
                .find_by_name(dep)
                .or_else(|| self.find_provider(dep))
                .ok_or_else(bad)?;
            return self.expand_field(target, attr, color, template);
        }

        let (_, prefix, sigil, attr) =
            regex_captures!(r"^(.*?)([@%/])?([A-Za-z_][A-Za-z0-9_.:]*)$", field).ok_or_else(bad)?;
        let value = self.resolve_attribute(node, attr).ok_or_else(bad)?;
        if value.is_empty() {
            return Ok(String::new());
        }
        let painted = if color {
            let colour = match (sigil, attr) {
                ("@", _) => Some(Colour::Cyan),
                ("%", _) => Some(Colour::Green),
                ("/", _) => Some(Colour::Fixed(8)),
                (_, "architecture" | "arch") => Some(Colour::Purple),
                _ => None,
            };
            match colour {
                Some(colour) => colour.paint(format!("{sigil}{value}")).to_string(),
                None => format!("{sigil}{value}"),
            }
        } else {
            format!("{sigil}{value}")
        };
        Ok(format!("{prefix}{painted}"))
    }

    /// Resolves one attribute path on a node; `None` means the
    /// attribute does not exist (a template error), an empty string
    /// means it exists but has nothing to print.
    fn resolve_attribute(&self, id: NodeId, attr: &str) -> Option<String> {
        let node = self.node(id);
        let (head, rest) = match attr.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (attr, None),
        };
        match (head, rest) {
            ("name", None) => Some(node.name.clone().unwrap_or_default()),
            ("namespace", None) => Some(node.namespace.clone().unwrap_or_default()),
            ("versions", None) => Some(node.versions.to_string()),
            ("version", None) => Some(match node.versions.as_concrete() {
                Some(crate::version::Version::Standard(v)) => v.to_string(),
                Some(other) => other.to_string(),
                None => node.versions.to_string(),
            }),
            ("variants", None) => Some(node.variants.to_string()),
            ("variants", Some(name)) => {
                Some(node.variants.get(name).map(ToString::to_string).unwrap_or_default())
            }
            ("compiler_flags", None) => Some(node.flags.to_string()),
            ("arch" | "architecture", None) => {
                Some(if node.arch.is_empty() { String::new() } else { node.arch.to_string() })
            }
            ("arch" | "architecture", Some(axis)) => match axis {
                "platform" => Some(node.arch.platform.map(|p| p.to_string()).unwrap_or_default()),
                "os" => Some(node.arch.os.clone().unwrap_or_default()),
                "target" => {
                    Some(node.arch.target.as_ref().map(ToString::to_string).unwrap_or_default())
                }
                _ => None,
            },
            ("platform", None) => Some(node.arch.platform.map(|p| p.to_string()).unwrap_or_default()),
            ("os", None) => Some(node.arch.os.clone().unwrap_or_default()),
            ("target", None) => {
                Some(node.arch.target.as_ref().map(ToString::to_string).unwrap_or_default())
            }
            ("abstract_hash", None) => Some(node.abstract_hash.clone().unwrap_or_default()),
            ("package_hash", None) => Some(node.package_hash.clone().unwrap_or_default()),
            // The legacy compiler field: the direct build dependency.
            ("compiler", rest) => {
                let compiler = node.out_edges.iter().find_map(|eid| {
                    let edge = self.edges[*eid].as_ref()?;
                    (edge.direct && edge.depflag.contains(DepFlags::BUILD))
                        .then_some(edge.child)
                });
                match (compiler, rest) {
                    (Some(dep), None) => self.resolve_attribute(dep, "name"),
                    (Some(dep), Some(rest)) => self.resolve_attribute(dep, rest),
                    (None, _) => Some(String::new()),
                }
            }
            _ => {
                // {hash} and {hash:n}
                if let Some((_, len)) = regex_captures!(r"^hash(?::([0-9]+))?$", attr) {
                    let hash = node.dag_hash.clone().unwrap_or_default();
                    let take = if len.is_empty() {
                        DISPLAY_HASH_LEN
                    } else {
                        len.parse().unwrap_or(DISPLAY_HASH_LEN)
                    };
                    return Some(hash.chars().take(take).collect());
                }
                None
            }
        }
    }

    /// Renders the whole DAG, flattened the way the parser accepts it
    /// back: the root (with its `%` compilers inline, since `%` binds
    /// to the preceding node), then each remaining dependency as a
    /// root-level `^` clause, compilers again inline.
    fn display_string(&self) -> String {
        let mut inlined: Vec<NodeId> = Vec::new();
        let mut out = self.render_with_compilers(self.root, &mut inlined);
        for item in self.traverse(TraverseOptions { root: false, ..Default::default() }) {
            let Some(eid) = item.edge else { continue };
            if inlined.contains(&item.node) {
                continue;
            }
            let edge = self.edge(eid);
            out.push_str(" ^");
            let mut attrs: Vec<String> = Vec::new();
            if edge.depflag != DepFlags::DEFAULT && !edge.depflag.is_empty() {
                attrs.push(format!("deptypes={}", edge.depflag));
            }
            if !edge.virtuals.is_empty() {
                attrs.push(format!("virtuals={}", edge.virtuals.join(",")));
            }
            if let Some(when) = &edge.when {
                attrs.push(format!("when='{when}'"));
            }
            if !attrs.is_empty() {
                out.push_str(&format!("[{}] ", attrs.join(" ")));
            }
            let rendered = self.render_with_compilers(item.node, &mut inlined);
            out.push_str(&rendered);
        }
        out
    }

    /// A node followed by its direct build dependencies as `%` clauses.
    fn render_with_compilers(&self, node: NodeId, inlined: &mut Vec<NodeId>) -> String {
        let mut out = self
            .format_node(node, DEFAULT_FORMAT, false)
            .unwrap_or_else(|_| self.node(node).name_or_empty().to_owned());
        for eid in self.nodes[node].out_edges.clone() {
            let Some(edge) = self.edges[eid].as_ref() else { continue };
            if edge.direct
                && edge.depflag == DepFlags::BUILD
                && edge.virtuals.is_empty()
                && edge.when.is_none()
                && !inlined.contains(&edge.child)
            {
                let child = edge.child;
                inlined.push(child);
                out.push('%');
                out.push_str(&self.render_with_compilers(child, inlined));
            }
        }
        out
    }
}

impl std::fmt::Display for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_string())
    }
}

impl Spec {
    /// Renders the DAG as an indented tree, one node per line, with an
    /// optional hash column. Shared nodes appear once per distinct
    /// parent chain prefix.
    pub fn tree(&self, hashes: bool) -> String {
        let mut out = String::new();
        for item in self.traverse(TraverseOptions { cover: super::traverse::Cover::Edges, ..Default::default() })
        {
            if hashes {
                let hash = self
                    .node(item.node)
                    .dag_hash
                    .as_deref()
                    .map(|h| &h[..7.min(h.len())])
                    .unwrap_or("-------");
                out.push_str(hash);
                out.push(' ');
            }
            for _ in 0..item.depth {
                out.push_str("    ");
            }
            if item.edge.is_some() {
                out.push('^');
            }
            let line = self
                .format_node(item.node, DEFAULT_FORMAT, false)
                .unwrap_or_else(|_| self.node(item.node).name_or_empty().to_owned());
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;

    fn spec(text: &str) -> Spec {
        text.parse().unwrap()
    }

    #[test]
    fn default_format_round_trips() {
        // S1-style round trip through the default template.
        let original = spec("mpileaks@=2.3 +shared cflags=\"-O2 -g\" ^callpath@=1.0 ^[virtuals=mpi] mpich@=3.2");
        let rendered = original.to_string();
        let reparsed: Spec = rendered.parse().unwrap();
        assert_eq!(reparsed, original, "`{rendered}` should reparse equal");
    }

    #[test]
    fn compilers_stay_attached_to_their_node_through_display() {
        // `%` binds to the preceding node, so the root's compiler must
        // print before any `^` clause.
        let original = spec("mpileaks@2.3%gcc@12^mpich%clang");
        let reparsed: Spec = original.to_string().parse().unwrap();
        assert_eq!(reparsed, original, "`{original}` should reparse equal");

        let root_compiler = reparsed
            .dependencies(reparsed.root())
            .map(|eid| reparsed.edge(eid))
            .find(|e| e.direct)
            .expect("root keeps a direct build dep");
        assert_eq!(reparsed.node(root_compiler.child).name.as_deref(), Some("gcc"));
        let mpich = reparsed.find_by_name("mpich").unwrap();
        let clang = reparsed.find_by_name("clang").unwrap();
        assert!(reparsed.dependencies(mpich).any(|eid| reparsed.edge(eid).child == clang));
    }

    #[test]
    fn sigils_print_only_with_values() {
        let bare = spec("zlib");
        assert_eq!(bare.format(DEFAULT_FORMAT).unwrap(), "zlib");
        let versioned = spec("zlib@1.2:1.3");
        assert_eq!(versioned.format(DEFAULT_FORMAT).unwrap(), "zlib@1.2:1.3");
    }

    #[test]
    fn field_access() {
        let s = spec("hdf5@1.10+mpi arch=linux-ubuntu22.04-x86_64");
        assert_eq!(s.format("{name}").unwrap(), "hdf5");
        assert_eq!(s.format("{architecture.platform}").unwrap(), "linux");
        assert_eq!(s.format("{variants.mpi}").unwrap(), "+mpi");
        assert_eq!(s.format("{name}-{version}").unwrap(), "hdf5-1.10");
    }

    #[test]
    fn dependency_field_access() {
        let s = spec("mpileaks^[virtuals=mpi]mpich@=3.2");
        assert_eq!(s.format("{^mpi.version}").unwrap(), "3.2");
        assert_eq!(s.format("{^mpich.name}").unwrap(), "mpich");
    }

    #[test]
    fn hash_field_truncates() {
        let s = testing::concretize("zlib@=1.3");
        let full = s.dag_hash().unwrap().to_owned();
        assert_eq!(s.format("{/hash:7}").unwrap(), format!("/{}", &full[..7]));
        assert_eq!(s.format("{hash}").unwrap(), full[..DISPLAY_HASH_LEN].to_owned());
    }

    #[test]
    fn escapes_and_errors() {
        let s = spec("zlib");
        assert_eq!(s.format("\\{{name}\\}").unwrap(), "{zlib}");
        assert!(s.format("{nonsense_field}").is_err());
        assert!(s.format("{name").is_err());
    }

    #[test]
    fn tree_rendering() {
        let s = spec("mpileaks@2.3^callpath^mpich");
        let tree = s.tree(false);
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines[0], "mpileaks@2.3");
        assert!(lines[1..].iter().all(|l| l.trim_start().starts_with('^')));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn prefixed_field_suppressed_when_empty() {
        let s = spec("zlib");
        assert_eq!(s.format("{name}{ arch=architecture}").unwrap(), "zlib");
        let with_arch = spec("zlib arch=linux-ubuntu22.04-x86_64");
        assert_eq!(
            with_arch.format("{name}{ arch=architecture}").unwrap(),
            "zlib arch=linux-ubuntu22.04-x86_64"
        );
    }
}
