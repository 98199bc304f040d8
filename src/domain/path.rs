//! Path expressions used to narrow a block result before it is spliced in.
//!
//! Supported: absolute and relative location paths, `//`, `*`, `text()`,
//! `node()`, `@name` / `@*`, `.` and `..`, and the predicates `[n]`,
//! `[last()]`, `[@a]`, `[@a='v']` and `[child='v']`. Expressions are compiled
//! once when the owning script is parsed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::{
    document::{Document, NodeId, NodeKind},
    error::DomainError,
};

const STRIP_EXPRESSION: &str = "/..";

#[derive(Debug, Clone)]
pub struct PathExpr {
    source: String,
    steps: Option<Vec<Step>>,
}

/// One item selected by a path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Node(NodeId),
    /// Attribute selections are spliced in as their text value.
    Attribute { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Axis {
    Child,
    SelfNode,
    Parent,
    DescendantOrSelf,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Name(String),
    AnyElement,
    Text,
    AnyNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Position(usize),
    Last,
    HasAttribute(String),
    AttributeEquals(String, String),
    ChildEquals(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Self {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::AnyNode,
            predicates: Vec::new(),
        }
    }
}

impl PathExpr {
    pub fn compile(source: &str) -> Result<Self, DomainError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(DomainError::path(source, "expression is empty"));
        }
        if strips_all_output(trimmed) {
            return Ok(Self {
                source: trimmed.to_string(),
                steps: None,
            });
        }

        let steps = Parser::new(trimmed)
            .parse_location()
            .map_err(|reason| DomainError::path(trimmed, reason))?;
        Ok(Self {
            source: trimmed.to_string(),
            steps: Some(steps),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Expressions that can never select anything: the node is dropped.
    pub fn is_strip(&self) -> bool {
        self.steps.is_none()
    }

    /// Evaluate against `doc`, with the document node as the context node.
    pub fn select(&self, doc: &Document) -> Vec<Selection> {
        match &self.steps {
            Some(steps) => evaluate(doc, steps),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn strips_all_output(expr: &str) -> bool {
    if expr.starts_with(STRIP_EXPRESSION) || expr.starts_with("..") {
        return true;
    }
    matches!(expr, "." | "/" | "/.")
}

fn evaluate(doc: &Document, steps: &[Step]) -> Vec<Selection> {
    let order = document_order(doc);
    let mut context = vec![doc.document_node()];

    for (index, step) in steps.iter().enumerate() {
        if let Axis::Attribute(name) = &step.axis {
            if index + 1 != steps.len() {
                return Vec::new();
            }
            return select_attributes(doc, &context, name);
        }

        let mut next = Vec::new();
        let mut seen = HashSet::new();
        for &node in &context {
            let candidates = candidates(doc, step, node);
            for id in apply_predicates(doc, &step.predicates, candidates) {
                if seen.insert(id) {
                    next.push(id);
                }
            }
        }
        next.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
        context = next;
        if context.is_empty() {
            break;
        }
    }

    let document_node = doc.document_node();
    context
        .into_iter()
        .filter(|id| *id != document_node)
        .map(Selection::Node)
        .collect()
}

fn document_order(doc: &Document) -> HashMap<NodeId, usize> {
    let document_node = doc.document_node();
    std::iter::once(document_node)
        .chain(doc.descendants(document_node))
        .enumerate()
        .map(|(position, id)| (id, position))
        .collect()
}

fn candidates(doc: &Document, step: &Step, node: NodeId) -> Vec<NodeId> {
    let pool: Vec<NodeId> = match step.axis {
        Axis::Child => doc.children(node).to_vec(),
        Axis::SelfNode => vec![node],
        Axis::Parent => doc.parent(node).into_iter().collect(),
        Axis::DescendantOrSelf => std::iter::once(node)
            .chain(doc.descendants(node))
            .collect(),
        Axis::Attribute(_) => Vec::new(),
    };
    pool.into_iter()
        .filter(|id| matches_test(doc, &step.test, *id))
        .collect()
}

fn matches_test(doc: &Document, test: &NodeTest, id: NodeId) -> bool {
    match (test, doc.kind(id)) {
        (NodeTest::AnyNode, _) => true,
        (NodeTest::AnyElement, NodeKind::Element(_)) => true,
        (NodeTest::Name(name), NodeKind::Element(element)) => element.name == *name,
        (NodeTest::Text, NodeKind::Text(_) | NodeKind::CData(_)) => true,
        _ => false,
    }
}

fn apply_predicates(doc: &Document, predicates: &[Predicate], mut nodes: Vec<NodeId>) -> Vec<NodeId> {
    for predicate in predicates {
        nodes = match predicate {
            Predicate::Position(position) => nodes
                .get(position.saturating_sub(1))
                .copied()
                .filter(|_| *position > 0)
                .into_iter()
                .collect(),
            Predicate::Last => nodes.last().copied().into_iter().collect(),
            Predicate::HasAttribute(name) => nodes
                .into_iter()
                .filter(|id| {
                    doc.element(*id)
                        .is_some_and(|element| element.attribute(name).is_some())
                })
                .collect(),
            Predicate::AttributeEquals(name, value) => nodes
                .into_iter()
                .filter(|id| {
                    doc.element(*id)
                        .and_then(|element| element.attribute(name))
                        .is_some_and(|actual| actual == value)
                })
                .collect(),
            Predicate::ChildEquals(name, value) => nodes
                .into_iter()
                .filter(|id| {
                    doc.children(*id).iter().any(|child| {
                        doc.element(*child).is_some_and(|element| element.name == *name)
                            && doc.text_content(*child) == *value
                    })
                })
                .collect(),
        };
    }
    nodes
}

fn select_attributes(doc: &Document, context: &[NodeId], name: &str) -> Vec<Selection> {
    context
        .iter()
        .filter_map(|id| doc.element(*id))
        .flat_map(|element| element.attributes.iter())
        .filter(|attr| name == "*" || attr.name == name)
        .map(|attr| Selection::Attribute {
            name: attr.name.clone(),
            value: attr.value.clone(),
        })
        .collect()
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn parse_location(&mut self) -> Result<Vec<Step>, String> {
        let mut steps = Vec::new();
        if self.eat("//") {
            steps.push(Step::descendant_or_self());
        } else {
            self.eat("/");
        }

        loop {
            steps.push(self.parse_step()?);
            if self.at_end() {
                return Ok(steps);
            }
            if self.eat("//") {
                steps.push(Step::descendant_or_self());
            } else if !self.eat("/") {
                return Err(format!("unexpected input `{}`", self.rest()));
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        let (axis, test) = if self.eat("..") {
            (Axis::Parent, NodeTest::AnyNode)
        } else if self.eat(".") {
            (Axis::SelfNode, NodeTest::AnyNode)
        } else if self.eat("@") {
            let name = if self.eat("*") {
                "*".to_string()
            } else {
                self.parse_name()?
            };
            (Axis::Attribute(name), NodeTest::AnyNode)
        } else if self.eat("*") {
            (Axis::Child, NodeTest::AnyElement)
        } else {
            let name = self.parse_name()?;
            let test = match name.as_str() {
                "text" if self.eat("()") => NodeTest::Text,
                "node" if self.eat("()") => NodeTest::AnyNode,
                _ => NodeTest::Name(name),
            };
            (Axis::Child, test)
        };

        let mut predicates = Vec::new();
        while self.eat("[") {
            self.skip_whitespace();
            predicates.push(self.parse_predicate()?);
            self.skip_whitespace();
            if !self.eat("]") {
                return Err("unterminated predicate".to_string());
            }
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_predicate(&mut self) -> Result<Predicate, String> {
        let digits: String = self.rest().chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            self.pos += digits.len();
            let position = digits
                .parse::<usize>()
                .map_err(|err| format!("invalid position `{digits}`: {err}"))?;
            return Ok(Predicate::Position(position));
        }
        if self.eat("last()") {
            return Ok(Predicate::Last);
        }

        let attribute = self.eat("@");
        let name = self.parse_name()?;
        self.skip_whitespace();
        if !self.eat("=") {
            return if attribute {
                Ok(Predicate::HasAttribute(name))
            } else {
                Err(format!("predicate on `{name}` needs a comparison"))
            };
        }
        self.skip_whitespace();
        let value = self.parse_literal()?;
        Ok(if attribute {
            Predicate::AttributeEquals(name, value)
        } else {
            Predicate::ChildEquals(name, value)
        })
    }

    fn parse_name(&mut self) -> Result<String, String> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, ch)) if ch.is_alphabetic() || ch == '_' => {}
            _ => return Err(format!("expected a name at `{rest}`")),
        }
        let end = chars
            .find(|(_, ch)| !(ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':')))
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn parse_literal(&mut self) -> Result<String, String> {
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(quote @ ('\'' | '"')) => quote,
            _ => return Err(format!("expected a quoted literal at `{rest}`")),
        };
        let body = &rest[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| "unterminated literal".to_string())?;
        self.pos += end + 2;
        Ok(body[..end].to_string())
    }
}
