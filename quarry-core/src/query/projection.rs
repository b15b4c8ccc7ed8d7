// quarry-core/src/query/projection.rs
//! Inclusion and exclusion projections, shared by `find` and `$project`.

use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::pipeline::expression::{Expression, Variables};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionKind {
    Inclusion,
    Exclusion,
}

#[derive(Debug, Clone)]
enum Node {
    Include,
    Exclude,
    Computed(Expression),
    Nested(Vec<(String, Node)>),
}

#[derive(Debug, Clone)]
pub struct Projection {
    kind: ProjectionKind,
    include_id: bool,
    fields: Vec<(String, Node)>,
}

fn is_flag(value: &Value) -> bool {
    value.is_number() || matches!(value, Value::Bool(_))
}

fn insert_node(nodes: &mut Vec<(String, Node)>, path: &str, node: Node) -> Result<()> {
    match path.split_once('.') {
        None => {
            if nodes.iter().any(|(name, _)| name == path) {
                return Err(QuarryError::BadValue(format!("path collision at {}", path)));
            }
            nodes.push((path.to_string(), node));
            Ok(())
        }
        Some((head, rest)) => {
            let position = match nodes.iter().position(|(name, _)| name == head) {
                Some(p) => p,
                None => {
                    nodes.push((head.to_string(), Node::Nested(Vec::new())));
                    nodes.len() - 1
                }
            };
            match &mut nodes[position].1 {
                Node::Nested(children) => insert_node(children, rest, node),
                _ => Err(QuarryError::BadValue(format!("path collision at {}", path))),
            }
        }
    }
}

impl Projection {
    /// Parse a projection spec. An empty spec is rejected; callers treat an
    /// empty `find` projection as "no projection".
    pub fn parse(spec: &Document) -> Result<Self> {
        if spec.is_empty() {
            return Err(QuarryError::BadValue("projection specification must have at least one field".into()));
        }
        let mut kind = None;
        let mut include_id = true;
        let mut fields = Vec::new();
        Projection::parse_into(spec, "", &mut kind, &mut include_id, &mut fields)?;
        let kind = kind.unwrap_or(if include_id { ProjectionKind::Inclusion } else { ProjectionKind::Exclusion });
        Ok(Projection {
            kind,
            include_id,
            fields,
        })
    }

    fn parse_into(
        spec: &Document,
        prefix: &str,
        kind: &mut Option<ProjectionKind>,
        include_id: &mut bool,
        fields: &mut Vec<(String, Node)>,
    ) -> Result<()> {
        for (key, value) in spec.iter() {
            if key.starts_with('$') {
                return Err(QuarryError::BadValue(format!("field path '{}' may not start with '$'", key)));
            }
            let path = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
            if path == "_id" && is_flag(value) {
                *include_id = value.truthy();
                continue;
            }
            let (node, node_kind) = match value {
                v if is_flag(v) => {
                    if v.truthy() {
                        (Node::Include, ProjectionKind::Inclusion)
                    } else {
                        (Node::Exclude, ProjectionKind::Exclusion)
                    }
                }
                Value::Document(inner) if !inner.keys().next().map(|k| k.starts_with('$')).unwrap_or(true) => {
                    Projection::parse_into(inner, &path, kind, include_id, fields)?;
                    continue;
                }
                other => (Node::Computed(Expression::parse(other)?), ProjectionKind::Inclusion),
            };
            match kind {
                Some(existing) if *existing != node_kind => {
                    return Err(QuarryError::BadValue(match existing {
                        ProjectionKind::Inclusion => {
                            format!("cannot do exclusion on field {} in inclusion projection", path)
                        }
                        ProjectionKind::Exclusion => {
                            format!("cannot do inclusion on field {} in exclusion projection", path)
                        }
                    }))
                }
                _ => *kind = Some(node_kind),
            }
            insert_node(fields, &path, node)?;
        }
        Ok(())
    }

    /// Exclusion projection over a list of paths, as used by `$unset`.
    pub fn exclusion(paths: &[String]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut include_id = true;
        for path in paths {
            if path == "_id" {
                include_id = false;
                continue;
            }
            insert_node(&mut fields, path, Node::Exclude)?;
        }
        Ok(Projection {
            kind: ProjectionKind::Exclusion,
            include_id,
            fields,
        })
    }

    pub fn kind(&self) -> ProjectionKind {
        self.kind
    }

    pub fn apply(&self, doc: &Document, vars: &Variables) -> Result<Document> {
        match self.kind {
            ProjectionKind::Inclusion => {
                let mut out = Document::new();
                if self.include_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id", id.clone());
                    }
                }
                include(doc, &self.fields, doc, vars, &mut out)?;
                Ok(out)
            }
            ProjectionKind::Exclusion => {
                let mut out = doc.clone();
                if !self.include_id {
                    out.remove("_id");
                }
                exclude(&mut out, &self.fields);
                Ok(out)
            }
        }
    }
}

fn include(src: &Document, nodes: &[(String, Node)], root: &Document, vars: &Variables, out: &mut Document) -> Result<()> {
    for (name, value) in src.iter() {
        let Some((_, node)) = nodes.iter().find(|(n, _)| n == name) else {
            continue;
        };
        match node {
            Node::Include => {
                out.insert(name.clone(), value.clone());
            }
            Node::Nested(children) => {
                if let Some(projected) = include_nested(value, children, root, vars)? {
                    out.insert(name.clone(), projected);
                }
            }
            Node::Computed(_) | Node::Exclude => {}
        }
    }
    for (name, node) in nodes {
        match node {
            Node::Computed(expr) => {
                if let Some(value) = expr.evaluate_opt(root, vars)? {
                    out.insert(name.clone(), value);
                }
            }
            Node::Nested(children) if !src.contains_key(name) && has_computed(children) => {
                let mut sub = Document::new();
                include(&Document::new(), children, root, vars, &mut sub)?;
                out.insert(name.clone(), sub);
            }
            _ => {}
        }
    }
    Ok(())
}

fn include_nested(value: &Value, children: &[(String, Node)], root: &Document, vars: &Variables) -> Result<Option<Value>> {
    match value {
        Value::Document(inner) => {
            let mut sub = Document::new();
            include(inner, children, root, vars, &mut sub)?;
            Ok(Some(Value::Document(sub)))
        }
        Value::Array(items) => {
            let mut projected = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = include_nested(item, children, root, vars)? {
                    projected.push(v);
                }
            }
            Ok(Some(Value::Array(projected)))
        }
        _ if has_computed(children) => {
            let mut sub = Document::new();
            include(&Document::new(), children, root, vars, &mut sub)?;
            Ok(Some(Value::Document(sub)))
        }
        _ => Ok(None),
    }
}

fn has_computed(nodes: &[(String, Node)]) -> bool {
    nodes.iter().any(|(_, node)| match node {
        Node::Computed(_) => true,
        Node::Nested(children) => has_computed(children),
        _ => false,
    })
}

fn exclude(doc: &mut Document, nodes: &[(String, Node)]) {
    for (name, node) in nodes {
        match node {
            Node::Exclude => {
                doc.remove(name);
            }
            Node::Nested(children) => {
                if let Some(value) = doc.get_mut(name) {
                    exclude_nested(value, children);
                }
            }
            _ => {}
        }
    }
}

fn exclude_nested(value: &mut Value, children: &[(String, Node)]) {
    match value {
        Value::Document(inner) => exclude(inner, children),
        Value::Array(items) => items.iter_mut().for_each(|item| exclude_nested(item, children)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn project(spec: Document, doc: Document) -> Document {
        Projection::parse(&spec).unwrap().apply(&doc, &Variables::default()).unwrap()
    }

    #[test]
    fn test_inclusion_keeps_id_and_document_order() {
        let out = project(doc!({"b": 1, "a": 1}), doc!({"_id": 1, "a": 1, "b": 2, "c": 3}));
        assert_eq!(out, doc!({"_id": 1, "a": 1, "b": 2}));
        let keys: Vec<&String> = out.keys().collect();
        assert_eq!(keys, vec!["_id", "a", "b"]);
    }

    #[test]
    fn test_exclusion_and_nested_paths() {
        let out = project(doc!({"a.x": 0, "_id": 0}), doc!({"_id": 1, "a": {"x": 1, "y": 2}, "b": 3}));
        assert_eq!(out, doc!({"a": {"y": 2}, "b": 3}));
        let out = project(doc!({"items.q": 1}), doc!({"_id": 1, "items": [{"q": 1, "r": 2}, {"r": 3}, 7]}));
        assert_eq!(out, doc!({"_id": 1, "items": [{"q": 1}, {}]}));
    }

    #[test]
    fn test_computed_fields() {
        let out = project(doc!({"total": {"$add": ["$a", "$b"]}, "a": 1}), doc!({"_id": 9, "a": 1, "b": 2}));
        assert_eq!(out, doc!({"_id": 9, "a": 1, "total": 3}));
    }

    #[test]
    fn test_mixed_projection_rejected() {
        assert!(Projection::parse(&doc!({"a": 1, "b": 0})).is_err());
        assert!(Projection::parse(&doc!({"a": 1, "_id": 0})).is_ok());
        assert!(Projection::parse(&doc!({})).is_err());
    }
}
