//! Arena-backed XML document model.
//!
//! Nodes live in a single `Vec` and are addressed by [`NodeId`]. Structural
//! edits (remove, replace, insert) only rewrite parent/child links, so an id
//! obtained before an edit keeps pointing at the same node afterwards. Cloning
//! a document therefore yields a copy whose ids line up one to one with the
//! original, which is what result substitution relies on.

use std::fmt;

use quick_xml::{
    NsReader,
    escape::{escape, partial_escape},
    events::{BytesStart, Event},
    name::ResolveResult,
};

use super::error::DomainError;

const DOCUMENT_NODE: NodeId = NodeId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written in the source, prefix included.
    pub name: String,
    /// Resolved namespace URI, if the element is bound to one.
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|attr| attr.name == name) {
            Some(attr) => attr.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction { target: String, content: String },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document: a document node without children.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Document holding a single root element.
    pub fn with_root(element: Element) -> Self {
        let mut doc = Self::new();
        let root = doc.create(NodeKind::Element(element));
        doc.append_child(DOCUMENT_NODE, root);
        doc
    }

    pub fn parse(source: &str) -> Result<Self, DomainError> {
        let mut reader = NsReader::from_str(source);
        let mut doc = Self::new();
        let mut stack = vec![DOCUMENT_NODE];

        loop {
            let (resolved, event) = reader
                .read_resolved_event()
                .map_err(|err| DomainError::parse(err.to_string()))?;
            let parent = stack.last().copied().unwrap_or(DOCUMENT_NODE);

            match event {
                Event::Start(start) => {
                    let element = element_from_start(&start, resolved)?;
                    let id = doc.create(NodeKind::Element(element));
                    doc.append_child(parent, id);
                    stack.push(id);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start, resolved)?;
                    let id = doc.create(NodeKind::Element(element));
                    doc.append_child(parent, id);
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(DomainError::parse("unbalanced closing tag"));
                    }
                    stack.pop();
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|err| DomainError::parse(err.to_string()))?;
                    if parent == DOCUMENT_NODE {
                        if value.trim().is_empty() {
                            continue;
                        }
                        return Err(DomainError::parse("text content outside the root element"));
                    }
                    let id = doc.create(NodeKind::Text(value.into_owned()));
                    doc.append_child(parent, id);
                }
                Event::CData(data) => {
                    let id = doc.create(NodeKind::CData(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                    doc.append_child(parent, id);
                }
                Event::Comment(comment) => {
                    let id = doc.create(NodeKind::Comment(
                        String::from_utf8_lossy(&comment).into_owned(),
                    ));
                    doc.append_child(parent, id);
                }
                Event::PI(pi) => {
                    let target = String::from_utf8_lossy(pi.target()).into_owned();
                    let content = String::from_utf8_lossy(pi.content())
                        .trim_start()
                        .to_string();
                    let id = doc.create(NodeKind::ProcessingInstruction { target, content });
                    doc.append_child(parent, id);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(DomainError::parse("unexpected end of input inside an element"));
        }
        if doc.root_element().is_none() {
            return Err(DomainError::parse("document has no root element"));
        }
        Ok(doc)
    }

    pub fn document_node(&self) -> NodeId {
        DOCUMENT_NODE
    }

    pub fn root_element(&self) -> Option<NodeId> {
        self.children(DOCUMENT_NODE)
            .iter()
            .copied()
            .find(|id| matches!(self.kind(*id), NodeKind::Element(_)))
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.node(id).kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.node_mut(id).kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// Whether the node is reachable from the document node.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == DOCUMENT_NODE {
                return true;
            }
            match self.node(current).parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Add a detached node to the arena.
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    pub fn create_element(&mut self, element: Element) -> NodeId {
        self.create(NodeKind::Element(element))
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.create(NodeKind::Text(text.into()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    /// Unlink a node (and its subtree) from its parent.
    pub fn remove(&mut self, id: NodeId) {
        self.detach(id);
    }

    /// Put `nodes` where `at` currently sits and unlink `at`.
    pub fn replace_with(&mut self, at: NodeId, nodes: &[NodeId]) {
        let Some(parent) = self.node(at).parent else {
            return;
        };
        for &node in nodes {
            self.detach(node);
        }
        let Some(position) = self.position_in_parent(parent, at) else {
            return;
        };
        for &node in nodes {
            self.node_mut(node).parent = Some(parent);
        }
        self.node_mut(parent)
            .children
            .splice(position..=position, nodes.iter().copied());
        self.node_mut(at).parent = None;
    }

    /// Insert `nodes` as consecutive following siblings of `at`.
    pub fn insert_after(&mut self, at: NodeId, nodes: &[NodeId]) {
        let Some(parent) = self.node(at).parent else {
            return;
        };
        for &node in nodes {
            self.detach(node);
        }
        let Some(position) = self.position_in_parent(parent, at) else {
            return;
        };
        for &node in nodes {
            self.node_mut(node).parent = Some(parent);
        }
        self.node_mut(parent)
            .children
            .splice(position + 1..position + 1, nodes.iter().copied());
    }

    /// Deep-copy `node` from `from` into this arena; the copy is detached.
    pub fn import_subtree(&mut self, from: &Document, node: NodeId) -> NodeId {
        let root = self.create(from.kind(node).clone());
        let mut pending = vec![(node, root)];
        while let Some((source, target)) = pending.pop() {
            for &child in from.children(source) {
                let copy = self.create(from.kind(child).clone());
                self.node_mut(copy).parent = Some(target);
                self.node_mut(target).children.push(copy);
                pending.push((child, copy));
            }
        }
        root
    }

    /// Concatenated text of the node and its descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            match &self.node(current).kind {
                NodeKind::Text(text) | NodeKind::CData(text) => out.push_str(text),
                _ => pending.extend(self.children(current).iter().rev().copied()),
            }
        }
        out
    }

    /// All descendants of `id` in document order, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(current) = pending.pop() {
            out.push(current);
            pending.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        for &child in self.children(DOCUMENT_NODE) {
            self.write_node(&mut out, child);
        }
        out
    }

    pub fn node_to_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(&mut out, id);
        out
    }

    fn write_node(&self, out: &mut String, id: NodeId) {
        match &self.node(id).kind {
            NodeKind::Document => {
                for &child in self.children(id) {
                    self.write_node(out, child);
                }
            }
            NodeKind::Element(element) => {
                out.push('<');
                out.push_str(&element.name);
                for attr in &element.attributes {
                    out.push(' ');
                    out.push_str(&attr.name);
                    out.push_str("=\"");
                    out.push_str(&escape(attr.value.as_str()));
                    out.push('"');
                }
                let children = self.children(id);
                if children.is_empty() {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for &child in children {
                    self.write_node(out, child);
                }
                out.push_str("</");
                out.push_str(&element.name);
                out.push('>');
            }
            NodeKind::Text(text) => out.push_str(&partial_escape(text.as_str())),
            NodeKind::CData(text) => {
                out.push_str("<![CDATA[");
                out.push_str(text);
                out.push_str("]]>");
            }
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::ProcessingInstruction { target, content } => {
                out.push_str("<?");
                out.push_str(target);
                if !content.is_empty() {
                    out.push(' ');
                    out.push_str(content);
                }
                out.push_str("?>");
            }
        }
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node_mut(id).parent.take() {
            self.node_mut(parent).children.retain(|child| *child != id);
        }
    }

    fn position_in_parent(&self, parent: NodeId, id: NodeId) -> Option<usize> {
        self.children(parent).iter().position(|child| *child == id)
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn element_from_start(start: &BytesStart<'_>, resolved: ResolveResult<'_>) -> Result<Element, DomainError> {
    let namespace = match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => None,
        ResolveResult::Unknown(prefix) => {
            return Err(DomainError::parse(format!(
                "undeclared namespace prefix `{}`",
                String::from_utf8_lossy(&prefix)
            )));
        }
    };

    let mut element = Element {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        namespace,
        attributes: Vec::new(),
    };
    for attr in start.attributes() {
        let attr = attr.map_err(|err| DomainError::parse(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| DomainError::parse(err.to_string()))?;
        element.attributes.push(Attribute {
            name: String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value: value.into_owned(),
        });
    }
    Ok(element)
}
