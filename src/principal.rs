//! Principals and attribute resolution.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

/// Attribute name to ordered values. `BTreeMap` keeps rendering deterministic.
pub type Attributes = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attribute<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Later repositories overwrite earlier values for the same attribute.
    Replace,
    /// Later repositories only contribute attributes not yet present.
    Add,
    /// Values are unioned in order, without duplicates.
    #[default]
    Multivalued,
}

impl MergeStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Add => "add",
            Self::Multivalued => "multivalued",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "add" => Ok(Self::Add),
            "multivalued" => Ok(Self::Multivalued),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn merge(target: &mut Attributes, incoming: Attributes, strategy: MergeStrategy) {
    for (name, values) in incoming {
        match strategy {
            MergeStrategy::Replace => {
                target.insert(name, values);
            }
            MergeStrategy::Add => {
                target.entry(name).or_insert(values);
            }
            MergeStrategy::Multivalued => {
                let existing = target.entry(name).or_default();
                for value in values {
                    if !existing.contains(&value) {
                        existing.push(value);
                    }
                }
            }
        }
    }
}

/// A source of attributes keyed by principal id.
pub trait AttributeRepository: Send + Sync {
    fn name(&self) -> &str;
    fn attributes(&self, principal_id: &str) -> Attributes;
}

#[derive(Debug, Default)]
pub struct StaticAttributeRepository {
    name: String,
    entries: HashMap<String, Attributes>,
}

impl StaticAttributeRepository {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_entry(mut self, principal_id: impl Into<String>, attributes: Attributes) -> Self {
        self.entries.insert(principal_id.into(), attributes);
        self
    }
}

impl AttributeRepository for StaticAttributeRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self, principal_id: &str) -> Attributes {
        self.entries.get(principal_id).cloned().unwrap_or_default()
    }
}

/// Runs every repository in order and merges the results onto the principal.
#[derive(Clone, Default)]
pub struct PrincipalResolver {
    repositories: Vec<Arc<dyn AttributeRepository>>,
    strategy: MergeStrategy,
}

impl PrincipalResolver {
    #[must_use]
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            repositories: Vec::new(),
            strategy,
        }
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn AttributeRepository>) -> Self {
        self.repositories.push(repository);
        self
    }

    #[must_use]
    pub fn resolve(&self, mut principal: Principal) -> Principal {
        for repository in &self.repositories {
            let found = repository.attributes(&principal.id);
            if !found.is_empty() {
                tracing::debug!(
                    repository = repository.name(),
                    principal = %principal.id,
                    "merging attributes"
                );
            }
            merge(&mut principal.attributes, found, self.strategy);
        }
        principal
    }
}

impl fmt::Debug for PrincipalResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalResolver")
            .field(
                "repositories",
                &self.repositories.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .field("strategy", &self.strategy)
            .finish()
    }
}
