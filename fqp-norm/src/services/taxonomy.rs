//! Taxonomy playbooks
//!
//! A playbook is a multi-document YAML file; each document names one
//! statement tree:
//!
//! ```yaml
//! statement: pnl
//! nodes:
//!   - id: revenue
//!   - id: opex
//!     children:
//!       - id: staff_cost
//!       - id: other_exp
//! ```
//!
//! Nodes with children are groupings and are never collected. Childless
//! nodes are mapping targets; they also count toward completeness unless
//! marked `extractable: false`.

use fqp_common::config::TomlConfig;
use fqp_common::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::StatementKind;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaxonomyNode {
    pub id: String,
    #[serde(default)]
    pub children: Vec<TaxonomyNode>,
    #[serde(default)]
    pub extractable: Option<bool>,
}

impl TaxonomyNode {
    pub fn is_group(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_extractable(&self) -> bool {
        self.extractable.unwrap_or(true)
    }
}

/// Collect childless nodes in pre-order, keeping those accepted by `include`
pub fn collect_leaves<'a, P>(nodes: &'a [TaxonomyNode], include: P) -> Vec<&'a str>
where
    P: Fn(&TaxonomyNode) -> bool,
{
    fn walk<'a, P>(nodes: &'a [TaxonomyNode], include: &P, out: &mut Vec<&'a str>)
    where
        P: Fn(&TaxonomyNode) -> bool,
    {
        for node in nodes {
            if node.is_group() {
                walk(&node.children, include, out);
            } else if include(node) {
                out.push(node.id.as_str());
            }
        }
    }

    let mut out = Vec::new();
    walk(nodes, &include, &mut out);
    out
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatementTree {
    pub statement: String,
    #[serde(default)]
    pub nodes: Vec<TaxonomyNode>,
}

/// All statement trees for one domain category
#[derive(Debug, Clone)]
pub struct Playbook {
    pub domain_category: String,
    pub source: PathBuf,
    trees: Vec<StatementTree>,
}

impl Playbook {
    pub fn load(domain_category: &str, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Taxonomy(format!(
                "Cannot read playbook for '{}' at {}: {}",
                domain_category,
                path.display(),
                e
            ))
        })?;
        let mut playbook = Self::from_yaml_str(domain_category, &text)?;
        playbook.source = path.to_path_buf();
        Ok(playbook)
    }

    pub fn from_yaml_str(domain_category: &str, text: &str) -> Result<Self> {
        let mut trees = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let tree = Option::<StatementTree>::deserialize(document).map_err(|e| {
                Error::Taxonomy(format!("Invalid playbook for '{}': {}", domain_category, e))
            })?;
            // Blank documents (e.g. a trailing `---`) carry nothing
            if let Some(tree) = tree.filter(|t| !t.nodes.is_empty()) {
                trees.push(tree);
            }
        }

        if trees.is_empty() {
            return Err(Error::Taxonomy(format!(
                "Playbook for '{}' defines no statement trees",
                domain_category
            )));
        }

        Ok(Self {
            domain_category: domain_category.to_string(),
            source: PathBuf::new(),
            trees,
        })
    }

    pub fn statement_keys(&self) -> impl Iterator<Item = &str> {
        self.trees.iter().map(|t| t.statement.as_str())
    }

    /// Mapping targets for one exact statement key, in tree order
    pub fn vocabulary(&self, statement_key: &str) -> Option<Vec<String>> {
        let tree = self.trees.iter().find(|t| t.statement == statement_key)?;
        let leaves = collect_leaves(&tree.nodes, |_| true);
        if leaves.is_empty() {
            return None;
        }
        Some(leaves.into_iter().map(str::to_string).collect())
    }

    /// Expected leaves for a statement kind, merged across presentation
    /// variants, sorted and de-duplicated
    pub fn completeness_leaves(&self, kind: StatementKind) -> Vec<String> {
        let merged: BTreeSet<&str> = self
            .trees
            .iter()
            .filter(|t| StatementKind::from_statement_key(&t.statement) == Some(kind))
            .flat_map(|t| collect_leaves(&t.nodes, TaxonomyNode::is_extractable))
            .collect();
        merged.into_iter().map(str::to_string).collect()
    }
}

/// Playbooks for every configured domain category
#[derive(Debug, Clone, Default)]
pub struct PlaybookRegistry {
    playbooks: HashMap<String, Arc<Playbook>>,
    aliases: HashMap<String, String>,
}

impl PlaybookRegistry {
    /// Load every configured playbook; any missing or unreadable file is fatal
    pub fn load(config: &TomlConfig) -> Result<Self> {
        let mut registry = Self::default();

        for (category, path) in &config.taxonomy.playbooks {
            let path = config.resolve_path(path);
            let playbook = Playbook::load(category, &path)?;
            info!(
                domain_category = %category,
                path = %path.display(),
                statements = playbook.trees.len(),
                "Loaded taxonomy playbook"
            );
            registry.insert(playbook);
        }

        for (alias, category) in &config.taxonomy.aliases {
            registry.add_alias(alias, category);
        }

        Ok(registry)
    }

    pub fn insert(&mut self, playbook: Playbook) {
        let key = normalize_category(&playbook.domain_category);
        self.playbooks.insert(key, Arc::new(playbook));
    }

    pub fn add_alias(&mut self, alias: &str, category: &str) {
        self.aliases
            .insert(normalize_category(alias), normalize_category(category));
    }

    /// Playbook for a domain category, following aliases
    pub fn playbook_for(&self, domain_category: &str) -> Option<Arc<Playbook>> {
        let key = normalize_category(domain_category);
        let key = self.aliases.get(&key).unwrap_or(&key);
        let found = self.playbooks.get(key).cloned();
        if found.is_none() {
            debug!(domain_category, "No taxonomy for domain category");
        }
        found
    }

    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }
}

fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase()
}
