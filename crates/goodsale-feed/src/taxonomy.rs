use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One `<category id=".." parentId="..">name</category>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
}

impl CategoryNode {
    pub fn new(id: impl Into<String>, parent_id: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            name: name.into(),
        }
    }
}

/// Category hierarchy for a single feed read. Owned by the reader and dropped with it.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    nodes: HashMap<String, CategoryNode>,
}

impl Taxonomy {
    pub fn build(nodes: impl IntoIterator<Item = CategoryNode>) -> Self {
        let mut taxonomy = Self::default();
        taxonomy.extend(nodes);
        taxonomy
    }

    /// Merge nodes in feed order; a repeated id replaces the earlier definition.
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = CategoryNode>) {
        for node in nodes {
            self.nodes.insert(node.id.clone(), node);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CategoryNode> {
        self.nodes.get(id)
    }

    /// Category names from the root down to `id`.
    ///
    /// Unknown ids give an empty path. The walk stops at the first missing parent or at
    /// the first id it has already visited, returning whatever was collected so far.
    pub fn path_of(&self, id: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if !visited.insert(current) {
                debug!(category_id = id, repeated = current, "category cycle, truncating path");
                break;
            }
            let Some(node) = self.nodes.get(current) else {
                break;
            };
            path.push(node.name.clone());
            cursor = node.parent_id.as_deref();
        }

        path.reverse();
        path
    }
}
