use anyhow::Context as _;
use std::fs;
use std::path::Path;
use xmltree::{Element, EmitterConfig, XMLNode};

/// Parse an XML document from disk into an element tree.
pub fn load_document(path: &Path) -> anyhow::Result<Element> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Element::parse(raw.as_slice()).with_context(|| format!("parse XML {}", path.display()))
}

/// Serialize the tree (pretty-printed, two-space indent) and overwrite `path`.
pub fn write_document(path: &Path, root: &Element) -> anyhow::Result<()> {
    let bytes = render_document(root)?;
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

pub fn render_document(root: &Element) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let cfg = EmitterConfig::new()
        .perform_indent(true)
        .indent_string("  ");
    root.write_with_config(&mut out, cfg)
        .context("serialize XML document")?;
    out.push(b'\n');
    Ok(out)
}

pub fn attr<'a>(el: &'a Element, name: &str) -> Option<&'a str> {
    el.attributes.get(name).map(String::as_str)
}

pub fn set_attr(el: &mut Element, name: &str, value: impl Into<String>) {
    el.attributes.insert(name.to_string(), value.into());
}

/// Direct child elements named `name`.
pub fn children_named<'a>(el: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    el.children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(move |c| c.name == name)
}

/// Index path (child positions) of the first element, depth-first in document order,
/// that satisfies `pred`. The root itself is a candidate.
fn find_path(el: &Element, pred: &dyn Fn(&Element) -> bool) -> Option<Vec<usize>> {
    if pred(el) {
        return Some(Vec::new());
    }
    for (idx, node) in el.children.iter().enumerate() {
        if let XMLNode::Element(child) = node
            && let Some(mut rest) = find_path(child, pred)
        {
            rest.insert(0, idx);
            return Some(rest);
        }
    }
    None
}

fn element_at_mut<'a>(mut el: &'a mut Element, path: &[usize]) -> Option<&'a mut Element> {
    for idx in path {
        el = match el.children.get_mut(*idx) {
            Some(XMLNode::Element(child)) => child,
            _ => return None,
        };
    }
    Some(el)
}

/// First descendant-or-self element matching `pred`.
pub fn find_first<'a>(el: &'a Element, pred: &dyn Fn(&Element) -> bool) -> Option<&'a Element> {
    if pred(el) {
        return Some(el);
    }
    el.children
        .iter()
        .filter_map(XMLNode::as_element)
        .find_map(|c| find_first(c, pred))
}

/// Mutable variant of [`find_first`].
pub fn find_first_mut<'a>(
    el: &'a mut Element,
    pred: &dyn Fn(&Element) -> bool,
) -> Option<&'a mut Element> {
    let path = find_path(el, pred)?;
    element_at_mut(el, &path)
}

/// Visit every descendant-or-self element named `name`, in document order.
pub fn for_each_named_mut(el: &mut Element, name: &str, f: &mut dyn FnMut(&mut Element)) {
    if el.name == name {
        f(el);
    }
    for node in el.children.iter_mut() {
        if let XMLNode::Element(child) = node {
            for_each_named_mut(child, name, f);
        }
    }
}

/// Predicate: element `name` whose attribute `key` equals `value`.
pub fn named_with_attr<'a>(
    name: &'a str,
    key: &'a str,
    value: &'a str,
) -> impl Fn(&Element) -> bool + 'a {
    move |e: &Element| e.name == name && attr(e, key) == Some(value)
}

/// Find the direct child `name` with `key=value` or append a new one carrying that attribute.
pub fn upsert_child_by_attr<'a>(
    parent: &'a mut Element,
    name: &str,
    key: &str,
    value: &str,
) -> &'a mut Element {
    let pos = parent.children.iter().position(|n| {
        n.as_element()
            .is_some_and(|e| e.name == name && attr(e, key) == Some(value))
    });
    let idx = match pos {
        Some(idx) => idx,
        None => {
            let mut el = Element::new(name);
            set_attr(&mut el, key, value);
            parent.children.push(XMLNode::Element(el));
            parent.children.len() - 1
        }
    };
    match &mut parent.children[idx] {
        XMLNode::Element(e) => e,
        _ => unreachable!("index points at an element node"),
    }
}

/// Find the first descendant (not only direct children) `name` with `key=value`;
/// append a new direct child when none exists.
pub fn upsert_descendant_by_attr<'a>(
    parent: &'a mut Element,
    name: &str,
    key: &str,
    value: &str,
) -> &'a mut Element {
    let pred = named_with_attr(name, key, value);
    let found = parent
        .children
        .iter()
        .enumerate()
        .find_map(|(idx, node)| {
            let child = node.as_element()?;
            let mut rest = find_path(child, &pred)?;
            rest.insert(0, idx);
            Some(rest)
        });
    match found {
        Some(path) => match element_at_mut(parent, &path) {
            Some(el) => el,
            None => unreachable!("path was computed from the same tree"),
        },
        None => upsert_child_by_attr(parent, name, key, value),
    }
}

/// Remove every direct child element named `name`; returns how many were removed.
pub fn remove_children_named(parent: &mut Element, name: &str) -> usize {
    let before = parent.children.len();
    parent
        .children
        .retain(|n| !n.as_element().is_some_and(|e| e.name == name));
    before - parent.children.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<root>
  <a key="1"><b key="x"/></a>
  <a key="2"/>
  <c/>
</root>"#;

    fn parse(s: &str) -> Element {
        Element::parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_find_first_is_depth_first_in_document_order() {
        let root = parse(DOC);
        let b = find_first(&root, &named_with_attr("b", "key", "x")).unwrap();
        assert_eq!(b.name, "b");
        let a = find_first(&root, &|e: &Element| e.name == "a").unwrap();
        assert_eq!(attr(a, "key"), Some("1"));
    }

    #[test]
    fn test_find_first_mut_edits_in_place() {
        let mut root = parse(DOC);
        let a2 = find_first_mut(&mut root, &named_with_attr("a", "key", "2")).unwrap();
        set_attr(a2, "seen", "yes");
        let a2 = find_first(&root, &named_with_attr("a", "key", "2")).unwrap();
        assert_eq!(attr(a2, "seen"), Some("yes"));
    }

    #[test]
    fn test_upsert_child_updates_existing_or_appends() {
        let mut root = parse(DOC);
        set_attr(upsert_child_by_attr(&mut root, "a", "key", "2"), "v", "updated");
        set_attr(upsert_child_by_attr(&mut root, "a", "key", "3"), "v", "new");
        let keys: Vec<_> = children_named(&root, "a")
            .map(|e| attr(e, "key").unwrap_or_default().to_string())
            .collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
        let a2 = find_first(&root, &named_with_attr("a", "key", "2")).unwrap();
        assert_eq!(attr(a2, "v"), Some("updated"));
    }

    #[test]
    fn test_upsert_descendant_finds_nested() {
        let mut root = parse(DOC);
        let a1 = find_first_mut(&mut root, &named_with_attr("a", "key", "1")).unwrap();
        set_attr(upsert_descendant_by_attr(a1, "b", "key", "x"), "path", "/bin/x");
        let a1 = find_first(&root, &named_with_attr("a", "key", "1")).unwrap();
        assert_eq!(children_named(a1, "b").count(), 1);
        assert_eq!(
            attr(children_named(a1, "b").next().unwrap(), "path"),
            Some("/bin/x")
        );
    }

    #[test]
    fn test_remove_children_named() {
        let mut root = parse(DOC);
        assert_eq!(remove_children_named(&mut root, "a"), 2);
        assert_eq!(children_named(&root, "a").count(), 0);
        assert_eq!(children_named(&root, "c").count(), 1);
    }

    #[test]
    fn test_render_round_trip_is_stable() {
        let root = parse(DOC);
        let once = render_document(&root).unwrap();
        let twice = render_document(&parse(std::str::from_utf8(&once).unwrap())).unwrap();
        assert_eq!(once, twice);
    }
}
