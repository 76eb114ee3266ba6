//! Parsing of spec strings.
//!
//! The full surface syntax is supported:
//!
//! ```text
//! namespace.name@ver +bool ~bool key=val key==val cflags="-O2 -g"
//!     %compiler@ver ^dep ^[deptypes=build,link virtuals=mpi when='@2:'] dep /hashpfx
//! ```
//!
//! `^` always attaches to the root; `%` attaches a direct build
//! dependency to the node being parsed; `==` (and `++`/`~~`) request
//! propagation.

use lazy_regex::{lazy_regex, Lazy, Regex};
use smallvec::SmallVec;
use thiserror::Error;

use super::{DepFlags, NodeId, ParseDepFlagError, Spec, SpecError, SpecNode};
use crate::arch::ParseArchError;
use crate::variant::{FlagKind, Variant, VariantError, VariantValue};
use crate::version::ParseVersionError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseSpecError {
    #[error("invalid spec at offset {offset}: {message}")]
    Invalid { offset: usize, message: String },
    #[error(transparent)]
    Version(#[from] ParseVersionError),
    #[error(transparent)]
    Arch(#[from] ParseArchError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error(transparent)]
    DepType(#[from] ParseDepFlagError),
    #[error(transparent)]
    Graph(#[from] SpecError),
}

impl ParseSpecError {
    fn at(offset: usize, message: impl Into<String>) -> Self {
        ParseSpecError::Invalid { offset, message: message.into() }
    }
}

static NAME_RE: Lazy<Regex> = lazy_regex!(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*");
static IDENT_RE: Lazy<Regex> = lazy_regex!(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*");
static VERSION_RE: Lazy<Regex> = lazy_regex!(r"^[A-Za-z0-9_.,:=\-]+");
static VALUE_RE: Lazy<Regex> = lazy_regex!(r"^[A-Za-z0-9_.,:*/\-]+");
static HASH_RE: Lazy<Regex> = lazy_regex!(r"^[a-z0-9]+");
static QUOTED_RE: Lazy<Regex> = lazy_regex!(r#"^("[^"]*"|'[^']*')"#);

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Cursor { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn take(&mut self, re: &Regex) -> Option<&'a str> {
        let matched = re.find(self.rest())?;
        debug_assert_eq!(matched.start(), 0);
        let text = matched.as_str();
        self.pos += text.len();
        Some(text)
    }
}

/// Parses a complete spec string.
pub(crate) fn parse_spec(input: &str) -> Result<Spec, ParseSpecError> {
    let mut cur = Cursor::new(input);
    cur.skip_ws();
    if cur.rest().is_empty() {
        return Err(ParseSpecError::at(0, "empty spec string"));
    }
    let mut spec = Spec::new(None);
    let root = spec.root;
    parse_node_body(&mut spec, root, &mut cur)?;

    loop {
        cur.skip_ws();
        match cur.peek() {
            None => break,
            Some('^') => {
                cur.bump();
                let (depflag, virtuals, when) = if cur.eat('[') {
                    parse_edge_attrs(&mut cur)?
                } else {
                    (DepFlags::DEFAULT, SmallVec::new(), None)
                };
                cur.skip_ws();
                let child = spec.add_node(SpecNode::default());
                parse_node_body(&mut spec, child, &mut cur)?;
                if spec.node(child).name.is_none() && spec.node(child).abstract_hash.is_none() {
                    return Err(ParseSpecError::at(
                        cur.pos,
                        "dependency must have a name or a hash",
                    ));
                }
                spec.add_edge(root, child, depflag, virtuals, false, when)?;
            }
            Some(other) => {
                return Err(ParseSpecError::at(cur.pos, format!("unexpected `{other}`")));
            }
        }
    }
    Ok(spec)
}

fn parse_node_body(
    spec: &mut Spec,
    node: NodeId,
    cur: &mut Cursor<'_>,
) -> Result<(), ParseSpecError> {
    // A leading identifier is the (possibly namespaced) package name,
    // unless it turns out to be a `key=value` clause.
    let saved = cur.pos;
    if let Some(token) = cur.take(&NAME_RE) {
        if cur.peek() == Some('=') {
            cur.pos = saved;
        } else {
            let (namespace, name) = match token.rsplit_once('.') {
                Some((namespace, name)) => (Some(namespace.to_owned()), name),
                None => (None, token),
            };
            spec.node_mut(node).namespace = namespace;
            spec.node_mut(node).name = Some(name.to_owned());
        }
    }

    loop {
        cur.skip_ws();
        match cur.peek() {
            None | Some('^') | Some(']') => break,
            Some('@') => {
                cur.bump();
                let offset = cur.pos;
                let payload = cur
                    .take(&VERSION_RE)
                    .ok_or_else(|| ParseSpecError::at(offset, "expected versions after `@`"))?;
                if !spec.node(node).versions.is_empty() {
                    return Err(ParseSpecError::at(offset, "more than one `@` clause"));
                }
                spec.node_mut(node).versions = payload.parse()?;
            }
            Some(sigil @ ('+' | '~')) => {
                cur.bump();
                let propagate = cur.eat(sigil);
                let offset = cur.pos;
                let name = cur
                    .take(&IDENT_RE)
                    .ok_or_else(|| ParseSpecError::at(offset, "expected a variant name"))?;
                let variant =
                    Variant::new(name, VariantValue::Bool(sigil == '+'), propagate)?;
                spec.node_mut(node).variants.insert(variant);
            }
            Some('/') => {
                cur.bump();
                let offset = cur.pos;
                let hash = cur
                    .take(&HASH_RE)
                    .ok_or_else(|| ParseSpecError::at(offset, "expected a hash prefix"))?;
                spec.node_mut(node).abstract_hash = Some(hash.to_owned());
            }
            Some('%') => {
                cur.bump();
                cur.skip_ws();
                let child = spec.add_node(SpecNode::default());
                parse_node_body(spec, child, cur)?;
                if spec.node(child).name.is_none() {
                    return Err(ParseSpecError::at(cur.pos, "expected a package after `%`"));
                }
                spec.add_edge(node, child, DepFlags::BUILD, SmallVec::new(), true, None)?;
            }
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                let offset = cur.pos;
                let key = cur.take(&IDENT_RE).expect("alphanumeric lookahead");
                if !cur.eat('=') {
                    return Err(ParseSpecError::at(offset, format!("unexpected token `{key}`")));
                }
                let propagate = cur.eat('=');
                let value_offset = cur.pos;
                let value = take_value(cur).ok_or_else(|| {
                    ParseSpecError::at(value_offset, format!("expected a value for `{key}`"))
                })?;
                apply_key_value(spec, node, key, &value, propagate, offset)?;
            }
            Some(other) => {
                return Err(ParseSpecError::at(cur.pos, format!("unexpected `{other}`")));
            }
        }
    }
    Ok(())
}

fn take_value(cur: &mut Cursor<'_>) -> Option<String> {
    if let Some(quoted) = cur.take(&QUOTED_RE) {
        return Some(quoted[1..quoted.len() - 1].to_owned());
    }
    cur.take(&VALUE_RE).map(str::to_owned)
}

fn apply_key_value(
    spec: &mut Spec,
    node: NodeId,
    key: &str,
    value: &str,
    propagate: bool,
    offset: usize,
) -> Result<(), ParseSpecError> {
    let arch_axis = matches!(key, "arch" | "architecture" | "platform" | "os" | "target");
    if propagate && (arch_axis || key == "namespace") {
        return Err(VariantError::PropagationOnReserved(key.to_owned()).into());
    }
    match key {
        "arch" | "architecture" => {
            if !spec.node(node).arch.is_empty() {
                return Err(SpecError::DuplicateArchitecture(value.to_owned()).into());
            }
            spec.node_mut(node).arch = value.parse()?;
        }
        "platform" => {
            let arch = &mut spec.node_mut(node).arch;
            if arch.platform.is_some() {
                return Err(SpecError::DuplicateArchitecture(value.to_owned()).into());
            }
            arch.platform = Some(value.parse().map_err(|_| {
                ParseSpecError::from(ParseArchError::UnknownPlatform(value.to_owned()))
            })?);
        }
        "os" => {
            let arch = &mut spec.node_mut(node).arch;
            if arch.os.is_some() {
                return Err(SpecError::DuplicateArchitecture(value.to_owned()).into());
            }
            arch.os = Some(value.to_owned());
        }
        "target" => {
            let arch = &mut spec.node_mut(node).arch;
            if arch.target.is_some() {
                return Err(SpecError::DuplicateArchitecture(value.to_owned()).into());
            }
            arch.target = Some(value.parse()?);
        }
        "namespace" => {
            spec.node_mut(node).namespace = Some(value.to_owned());
        }
        _ if FlagKind::is_flag_name(key) => {
            let kind: FlagKind = key.parse().expect("validated flag name");
            spec.node_mut(node).flags.add_flags(kind, value, propagate);
        }
        _ => {
            if key.is_empty() {
                return Err(ParseSpecError::at(offset, "empty variant name"));
            }
            let variant = Variant::new(key, VariantValue::from_payload(value)?, propagate)?;
            spec.node_mut(node).variants.insert(variant);
        }
    }
    Ok(())
}

type EdgeAttrs = (DepFlags, SmallVec<[String; 2]>, Option<Box<Spec>>);

fn parse_edge_attrs(cur: &mut Cursor<'_>) -> Result<EdgeAttrs, ParseSpecError> {
    let mut depflag = DepFlags::DEFAULT;
    let mut virtuals: SmallVec<[String; 2]> = SmallVec::new();
    let mut when: Option<Box<Spec>> = None;
    loop {
        cur.skip_ws();
        while cur.eat(',') {
            cur.skip_ws();
        }
        if cur.eat(']') {
            break;
        }
        let offset = cur.pos;
        let key = cur
            .take(&IDENT_RE)
            .ok_or_else(|| ParseSpecError::at(offset, "expected an edge attribute"))?;
        if !cur.eat('=') {
            return Err(ParseSpecError::at(cur.pos, format!("expected `=` after `{key}`")));
        }
        match key {
            "deptypes" => {
                let value = cur
                    .take(&VALUE_RE)
                    .ok_or_else(|| ParseSpecError::at(cur.pos, "expected dependency types"))?;
                depflag = DepFlags::parse_list(value)?;
            }
            "virtuals" => {
                let value = cur
                    .take(&VALUE_RE)
                    .ok_or_else(|| ParseSpecError::at(cur.pos, "expected virtual names"))?;
                for name in value.split(',').filter(|v| !v.is_empty()) {
                    virtuals.push(name.to_owned());
                }
                virtuals.sort();
            }
            "when" => {
                let quoted = cur
                    .take(&QUOTED_RE)
                    .ok_or_else(|| ParseSpecError::at(cur.pos, "expected a quoted spec"))?;
                let inner = &quoted[1..quoted.len() - 1];
                when = Some(Box::new(parse_spec(inner)?));
            }
            other => {
                return Err(ParseSpecError::at(offset, format!("unknown edge attribute `{other}`")));
            }
        }
    }
    Ok((depflag, virtuals, when))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variant::VariantValue;
    use assert_matches::assert_matches;

    fn parse(text: &str) -> Spec {
        parse_spec(text).unwrap_or_else(|e| panic!("`{text}` failed to parse: {e}"))
    }

    #[test]
    fn full_surface_syntax() {
        let spec = parse(
            "mpileaks@=2.3 +shared cflags=\"-O2 -g\" ^callpath@=1.0 ^[virtuals=mpi] mpich@=3.2",
        );
        assert_eq!(spec.name(), Some("mpileaks"));
        assert_eq!(spec.root_node().versions.to_string(), "=2.3");
        assert_matches!(
            spec.root_node().variants.get("shared").map(|v| &v.value),
            Some(VariantValue::Bool(true))
        );
        assert_eq!(spec.root_node().flags.get(FlagKind::Cflags).len(), 2);

        let mpich = spec.find_by_name("mpich").unwrap();
        assert_eq!(spec.node(mpich).versions.to_string(), "=3.2");
        assert_eq!(spec.find_provider("mpi"), Some(mpich));
        assert!(spec.find_by_name("callpath").is_some());
    }

    #[test]
    fn namespaced_name() {
        let spec = parse("builtin.mpich@3.2");
        assert_eq!(spec.name(), Some("mpich"));
        assert_eq!(spec.root_node().namespace.as_deref(), Some("builtin"));
    }

    #[test]
    fn compiler_attaches_to_the_preceding_node() {
        let spec = parse("libelf@0:2.5%gcc@2:4.6");
        let gcc = spec.find_by_name("gcc").unwrap();
        let edge_id = spec.dependencies(spec.root()).next().unwrap();
        let edge = spec.edge(edge_id);
        assert_eq!(edge.child, gcc);
        assert!(edge.direct);
        assert_eq!(edge.depflag, DepFlags::BUILD);
        assert_eq!(spec.node(gcc).versions.to_string(), "2:4.6");

        // A compiler of a dependency hangs off the dependency.
        let nested = parse("mpileaks^mpich%gcc");
        let mpich = nested.find_by_name("mpich").unwrap();
        let gcc = nested.find_by_name("gcc").unwrap();
        assert!(nested
            .dependencies(mpich)
            .any(|eid| nested.edge(eid).child == gcc));
    }

    #[test]
    fn edge_attributes() {
        let spec = parse("x^[deptypes=build,test virtuals=mpi when='@2:'] mpich");
        let edge_id = spec.dependencies(spec.root()).next().unwrap();
        let edge = spec.edge(edge_id);
        assert_eq!(edge.depflag, DepFlags::BUILD.union(DepFlags::TEST));
        assert_eq!(edge.virtuals.as_slice(), ["mpi"]);
        let when = edge.when.as_deref().unwrap();
        assert_eq!(when.root_node().versions.to_string(), "2:");
    }

    #[test]
    fn propagation_sigils() {
        let spec = parse("dray++cuda foo==bar cflags==-O2");
        assert!(spec.root_node().variants.get("cuda").unwrap().propagate);
        assert!(spec.root_node().variants.get("foo").unwrap().propagate);
        assert!(spec.root_node().flags.get(FlagKind::Cflags)[0].propagate);
    }

    #[test]
    fn hash_prefix_clause() {
        let spec = parse("mpileaks/abc123");
        assert_eq!(spec.root_node().abstract_hash.as_deref(), Some("abc123"));
        let anon = parse("/abc123");
        assert_eq!(anon.root_node().abstract_hash.as_deref(), Some("abc123"));
        assert_eq!(anon.name(), None);
    }

    #[test]
    fn anonymous_specs() {
        let spec = parse("@1.2: +shared");
        assert_eq!(spec.name(), None);
        assert_eq!(spec.root_node().versions.to_string(), "1.2:");
    }

    #[test]
    fn arch_clauses() {
        let spec = parse("zlib arch=linux-ubuntu22.04-x86_64");
        assert!(spec.root_node().arch.is_concrete());

        let split = parse("zlib platform=linux os=ubuntu22.04 target=x86_64:haswell");
        assert_eq!(split.root_node().arch.platform, Some(crate::arch::Platform::Linux));

        assert_matches!(
            parse_spec("zlib arch=linux-a-b arch=linux-c-d"),
            Err(ParseSpecError::Graph(SpecError::DuplicateArchitecture(_)))
        );
    }

    #[test]
    fn reserved_propagation_is_rejected() {
        assert_matches!(
            parse_spec("zlib target==x86_64"),
            Err(ParseSpecError::Variant(VariantError::PropagationOnReserved(_)))
        );
    }

    #[test]
    fn bad_spec_strings() {
        assert_matches!(parse_spec(""), Err(ParseSpecError::Invalid { .. }));
        assert_matches!(parse_spec("zlib ^"), Err(ParseSpecError::Invalid { .. }));
        assert_matches!(parse_spec("zlib @"), Err(ParseSpecError::Invalid { .. }));
        assert_matches!(parse_spec("zlib $$"), Err(ParseSpecError::Invalid { .. }));
        // Offsets point at the offending character.
        match parse_spec("zlib $$") {
            Err(ParseSpecError::Invalid { offset, .. }) => assert_eq!(offset, 5),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn wildcard_value() {
        let spec = parse("hdf5 foo=*");
        assert_matches!(
            spec.root_node().variants.get("foo").map(|v| &v.value),
            Some(VariantValue::Any)
        );
        assert_matches!(
            parse_spec("hdf5 foo=a,*"),
            Err(ParseSpecError::Variant(VariantError::ReservedValue))
        );
    }
}
