/*!
 * @file projection.rs
 * @brief Projection document validation and application
 */

use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::error::CommandError;
use crate::expression::{self, EvalContext, Expr};
use crate::ordering::{numeric_value, set_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

#[derive(Debug, Default)]
struct PathTree {
    leaf: bool,
    children: IndexMap<String, PathTree>,
}

impl PathTree {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        for seg in path.split('.') {
            node = node.children.entry(seg.to_string()).or_default();
        }
        node.leaf = true;
    }
}

/// A validated projection, applicable to any number of documents.
#[derive(Debug)]
pub struct Projection {
    mode: Mode,
    tree: PathTree,
    computed: Vec<(String, Expr)>,
    id_excluded: bool,
}

impl Projection {
    /// Parses and validates a projection document. `require_field` is set for
    /// the `$project` stage, which rejects an empty specification; `find`
    /// treats it as "everything".
    pub fn parse(spec: &Document, require_field: bool) -> Result<Self, CommandError> {
        if spec.is_empty() && require_field {
            return Err(CommandError::location(
                51272,
                "Invalid $project :: caused by :: projection specification must have at least one field",
            ));
        }

        let mut mode: Option<Mode> = None;
        let mut tree = PathTree::default();
        let mut computed = Vec::new();
        let mut id_excluded = false;
        let mut id_included_explicitly = false;

        for (key, value) in spec {
            if key == "$" || key.ends_with(".$") || key.contains(".$.") {
                return Err(CommandError::location(
                    31324,
                    "Cannot use positional projection in aggregation projection",
                ));
            }
            if key.starts_with('$') {
                return Err(CommandError::location(
                    16410,
                    format!("FieldPath field names may not start with '$'. Consider using $getField or $setField."),
                ));
            }

            let kind = classify(value)?;
            if key == "_id" {
                match kind {
                    FieldKind::Exclude => id_excluded = true,
                    FieldKind::Include => id_included_explicitly = true,
                    FieldKind::Computed(expr) => computed.push((key.clone(), expr)),
                }
                continue;
            }

            match kind {
                FieldKind::Exclude => match mode {
                    Some(Mode::Include) => {
                        return Err(CommandError::location(
                            31254,
                            format!(
                                "Cannot do exclusion on field {} in inclusion projection",
                                key
                            ),
                        ))
                    }
                    _ => {
                        mode = Some(Mode::Exclude);
                        tree.insert(key);
                    }
                },
                FieldKind::Include => match mode {
                    Some(Mode::Exclude) => {
                        return Err(CommandError::location(
                            31253,
                            format!(
                                "Cannot do inclusion on field {} in exclusion projection",
                                key
                            ),
                        ))
                    }
                    _ => {
                        mode = Some(Mode::Include);
                        tree.insert(key);
                    }
                },
                FieldKind::Computed(expr) => match mode {
                    Some(Mode::Exclude) => {
                        return Err(CommandError::location(
                            31253,
                            format!(
                                "Cannot do inclusion on field {} in exclusion projection",
                                key
                            ),
                        ))
                    }
                    _ => {
                        mode = Some(Mode::Include);
                        computed.push((key.clone(), expr));
                    }
                },
            }
        }

        // A projection mentioning only `_id` takes its polarity from it.
        let mode = mode.unwrap_or(if id_excluded || !id_included_explicitly {
            Mode::Exclude
        } else {
            Mode::Include
        });
        if mode == Mode::Include && id_included_explicitly {
            tree.insert("_id");
        }

        Ok(Self {
            mode,
            tree,
            computed,
            id_excluded,
        })
    }

    pub fn apply(&self, doc: &Document) -> Result<Document, CommandError> {
        let mut out = match self.mode {
            Mode::Include => {
                let mut projected = Document::new();
                if !self.id_excluded {
                    if let Some(id) = doc.get("_id") {
                        projected.insert("_id", id.clone());
                    }
                }
                let body = prune_include(doc, &self.tree);
                for (k, v) in body {
                    if k != "_id" || !projected.contains_key("_id") {
                        projected.insert(k, v);
                    }
                }
                projected
            }
            Mode::Exclude => {
                let mut projected = prune_exclude(doc, &self.tree);
                if self.id_excluded {
                    projected.remove("_id");
                }
                projected
            }
        };

        if !self.computed.is_empty() {
            let ctx = EvalContext::new(doc.clone());
            for (path, expr) in &self.computed {
                if let Some(v) = expression::eval(expr, &ctx)? {
                    set_path(&mut out, path, v)?;
                }
            }
        }
        Ok(out)
    }
}

enum FieldKind {
    Include,
    Exclude,
    Computed(Expr),
}

fn classify(value: &Bson) -> Result<FieldKind, CommandError> {
    match value {
        Bson::Boolean(true) => Ok(FieldKind::Include),
        Bson::Boolean(false) => Ok(FieldKind::Exclude),
        v if numeric_value(v).is_some() => {
            if numeric_value(v) == Some(0.0) {
                Ok(FieldKind::Exclude)
            } else {
                Ok(FieldKind::Include)
            }
        }
        other => Ok(FieldKind::Computed(expression::parse(other)?)),
    }
}

fn prune_include(doc: &Document, tree: &PathTree) -> Document {
    let mut out = Document::new();
    for (k, v) in doc {
        let Some(node) = tree.children.get(k.as_str()) else {
            continue;
        };
        if node.leaf {
            out.insert(k.clone(), v.clone());
            continue;
        }
        match v {
            Bson::Document(sub) => {
                out.insert(k.clone(), prune_include(sub, node));
            }
            Bson::Array(arr) => {
                let projected: Vec<Bson> = arr
                    .iter()
                    .filter_map(|el| match el {
                        Bson::Document(d) => Some(Bson::Document(prune_include(d, node))),
                        _ => None,
                    })
                    .collect();
                out.insert(k.clone(), projected);
            }
            _ => {}
        }
    }
    out
}

fn prune_exclude(doc: &Document, tree: &PathTree) -> Document {
    let mut out = Document::new();
    for (k, v) in doc {
        match tree.children.get(k.as_str()) {
            None => {
                out.insert(k.clone(), v.clone());
            }
            Some(node) if node.leaf => {}
            Some(node) => match v {
                Bson::Document(sub) => {
                    out.insert(k.clone(), prune_exclude(sub, node));
                }
                Bson::Array(arr) => {
                    let kept: Vec<Bson> = arr
                        .iter()
                        .map(|el| match el {
                            Bson::Document(d) => Bson::Document(prune_exclude(d, node)),
                            other => other.clone(),
                        })
                        .collect();
                    out.insert(k.clone(), kept);
                }
                other => {
                    out.insert(k.clone(), other.clone());
                }
            },
        }
    }
    out
}
