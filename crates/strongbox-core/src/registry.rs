//! Entity registry: the declarative description of every entity type in the
//! dataset.
//!
//! Each [`EntityType`] lists its foreign keys, an optional self-reference
//! column and the many-to-many relations it owns. Every many-to-many relation
//! is also registered as a first-class join type (`_AToB`, columns `A` / `B`)
//! so the sequencer orders it like any other table.
//!
//! Adding an entity type is a data change here; delete/insert order is
//! computed by [`crate::sequencer::DependencySequencer`].

use std::collections::HashSet;

use serde::Serialize;
use strongbox_state::{StoreSchema, TableSchema};

use crate::error::RegistryError;

/// A foreign key column pointing at another entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
    pub nullable: bool,
}

/// An implicit many-to-many relation owned by an entity type.
///
/// The owner's export carries the peer ids as a list under `export_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManyToMany {
    pub peer: String,
    pub export_field: String,
    /// Join type name, `_{A}To{B}` with `A`/`B` in lexical order.
    pub relation: String,
}

/// Whether a type holds ordinary records or join rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EntityKind {
    Record,
    Join { owner: String, peer: String },
}

/// Descriptor of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityType {
    pub name: String,
    /// Top-level key of this type's records in a snapshot document.
    pub export_key: String,
    pub kind: EntityKind,
    pub foreign_keys: Vec<ForeignKey>,
    /// Column holding a foreign key to a record of the same type.
    pub self_reference: Option<String>,
    pub many_to_many: Vec<ManyToMany>,
}

/// Join type name for a relation between `a` and `b` (order-insensitive).
pub fn relation_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("_{first}To{second}")
}

impl EntityType {
    /// A record-holding type with no relations yet.
    pub fn record(name: impl Into<String>, export_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            export_key: export_key.into(),
            kind: EntityKind::Record,
            foreign_keys: Vec::new(),
            self_reference: None,
            many_to_many: Vec::new(),
        }
    }

    /// Non-nullable foreign key.
    pub fn references(self, column: &str, target: &str) -> Self {
        self.foreign_key(column, target, false)
    }

    /// Nullable foreign key.
    pub fn optionally_references(self, column: &str, target: &str) -> Self {
        self.foreign_key(column, target, true)
    }

    fn foreign_key(mut self, column: &str, target: &str, nullable: bool) -> Self {
        if target == self.name {
            self.self_reference = Some(column.to_string());
        } else {
            self.foreign_keys.push(ForeignKey {
                column: column.to_string(),
                references: target.to_string(),
                nullable,
            });
        }
        self
    }

    /// Foreign key to a record of the same type (e.g. a parent task).
    pub fn self_referencing(mut self, column: &str) -> Self {
        self.self_reference = Some(column.to_string());
        self
    }

    /// Own a many-to-many relation with `peer`, exported as `export_field`.
    pub fn many_to_many(mut self, peer: &str, export_field: &str) -> Self {
        self.many_to_many.push(ManyToMany {
            peer: peer.to_string(),
            export_field: export_field.to_string(),
            relation: relation_name(&self.name, peer),
        });
        self
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, EntityKind::Join { .. })
    }

    /// Distinct referenced types, excluding self, in declaration order.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.foreign_keys
            .iter()
            .map(|fk| fk.references.as_str())
            .filter(|t| *t != self.name && seen.insert(*t))
            .collect()
    }

    fn join(relation: &ManyToMany, owner: &str) -> Self {
        let (a, b) = if owner <= relation.peer.as_str() {
            (owner, relation.peer.as_str())
        } else {
            (relation.peer.as_str(), owner)
        };
        Self {
            name: relation.relation.clone(),
            export_key: relation.relation.clone(),
            kind: EntityKind::Join {
                owner: owner.to_string(),
                peer: relation.peer.clone(),
            },
            foreign_keys: vec![
                ForeignKey {
                    column: "A".to_string(),
                    references: a.to_string(),
                    nullable: false,
                },
                ForeignKey {
                    column: "B".to_string(),
                    references: b.to_string(),
                    nullable: false,
                },
            ],
            self_reference: None,
            many_to_many: Vec::new(),
        }
    }

    fn table_schema(&self) -> TableSchema {
        let mut table = match &self.kind {
            EntityKind::Join { .. } => {
                return TableSchema::join(
                    &self.name,
                    &self.foreign_keys[0].references,
                    &self.foreign_keys[1].references,
                )
            }
            EntityKind::Record => TableSchema::new(&self.name),
        };
        for fk in &self.foreign_keys {
            table = table.with_foreign_key(&fk.column, &fk.references);
        }
        if let Some(column) = &self.self_reference {
            table = table.with_foreign_key(column, &self.name);
        }
        table
    }
}

/// Validated, ordered set of entity types.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    types: Vec<EntityType>,
    root: usize,
}

impl EntityRegistry {
    /// Start a registry whose root identity type is `root`.
    pub fn builder(root: &str) -> RegistryBuilder {
        RegistryBuilder {
            root: root.to_string(),
            types: Vec::new(),
        }
    }

    /// Every type, record types in declaration order followed by join types.
    pub fn all_types(&self) -> &[EntityType] {
        &self.types
    }

    /// Record-holding types (the ones exported under their own key).
    pub fn record_types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter().filter(|t| !t.is_join())
    }

    /// Derived join types.
    pub fn join_types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter().filter(|t| t.is_join())
    }

    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Position of `name` in declaration order.
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.name == name)
    }

    /// Types `name` holds a foreign key toward, excluding itself.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.get(name).map(|t| t.dependencies()).unwrap_or_default()
    }

    pub fn is_self_referential(&self, name: &str) -> bool {
        self.get(name)
            .map(|t| t.self_reference.is_some())
            .unwrap_or(false)
    }

    /// `(peer type, export field)` for every many-to-many relation `name` owns.
    pub fn many_to_many_peers(&self, name: &str) -> Vec<(&str, &str)> {
        self.get(name)
            .map(|t| {
                t.many_to_many
                    .iter()
                    .map(|m| (m.peer.as_str(), m.export_field.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The identity type every other type ultimately depends on.
    pub fn root_type(&self) -> &EntityType {
        &self.types[self.root]
    }

    /// Physical tables for a record store holding this dataset.
    pub fn store_schema(&self) -> StoreSchema {
        StoreSchema::new(self.types.iter().map(EntityType::table_schema).collect())
    }

    /// The business dataset: CRM, projects and resourcing, finance, roadmap.
    pub fn business() -> Result<Self, RegistryError> {
        Self::builder("User")
            // CRM
            .entity(EntityType::record("User", "users"))
            .entity(EntityType::record("Account", "accounts").references("ownerId", "User"))
            .entity(EntityType::record("Contact", "contacts").references("accountId", "Account"))
            .entity(
                EntityType::record("Opportunity", "opportunities")
                    .references("accountId", "Account")
                    .references("ownerId", "User")
                    .many_to_many("Feature", "featureIds"),
            )
            .entity(
                EntityType::record("Activity", "activities")
                    .references("userId", "User")
                    .optionally_references("contactId", "Contact")
                    .optionally_references("opportunityId", "Opportunity"),
            )
            // Projects and resourcing
            .entity(
                EntityType::record("Project", "projects")
                    .references("ownerId", "User")
                    .optionally_references("accountId", "Account"),
            )
            .entity(
                EntityType::record("ProjectBudgetLine", "projectBudgetLines")
                    .references("projectId", "Project"),
            )
            .entity(
                EntityType::record("Task", "tasks")
                    .references("projectId", "Project")
                    .optionally_references("assigneeId", "User")
                    .self_referencing("parentId"),
            )
            .entity(
                EntityType::record("ResourceAllocation", "resourceAllocations")
                    .references("userId", "User")
                    .references("projectId", "Project"),
            )
            .entity(
                EntityType::record("TimeEntry", "timeEntries")
                    .references("userId", "User")
                    .references("taskId", "Task"),
            )
            // Finance
            .entity(EntityType::record("ExpenseCategory", "expenseCategories").self_referencing("parentId"))
            .entity(
                EntityType::record("Expense", "expenses")
                    .references("categoryId", "ExpenseCategory")
                    .references("userId", "User")
                    .optionally_references("projectId", "Project"),
            )
            .entity(
                EntityType::record("Invoice", "invoices")
                    .references("accountId", "Account")
                    .optionally_references("projectId", "Project"),
            )
            // Roadmap
            .entity(EntityType::record("Product", "products").references("ownerId", "User"))
            .entity(EntityType::record("Release", "releases").references("productId", "Product"))
            .entity(
                EntityType::record("Feature", "features")
                    .references("productId", "Product")
                    .self_referencing("parentId")
                    .many_to_many("Release", "releaseIds"),
            )
            .build()
    }
}

/// Accumulates entity types and validates them into an [`EntityRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    root: String,
    types: Vec<EntityType>,
}

impl RegistryBuilder {
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.types.push(entity);
        self
    }

    /// Validate names and references, then append the derived join types.
    pub fn build(self) -> Result<EntityRegistry, RegistryError> {
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for t in &self.types {
            if !names.insert(t.name.as_str()) {
                return Err(RegistryError::DuplicateType {
                    name: t.name.clone(),
                });
            }
            if !keys.insert(t.export_key.as_str()) {
                return Err(RegistryError::DuplicateType {
                    name: t.export_key.clone(),
                });
            }
        }

        let known = |target: &str| names.contains(target);
        for t in &self.types {
            let targets = t
                .foreign_keys
                .iter()
                .map(|fk| fk.references.as_str())
                .chain(t.many_to_many.iter().map(|m| m.peer.as_str()));
            for target in targets {
                if !known(target) {
                    return Err(RegistryError::UnknownType {
                        entity: t.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        let root = self
            .types
            .iter()
            .position(|t| t.name == self.root)
            .ok_or_else(|| RegistryError::UnknownType {
                entity: "<root>".to_string(),
                target: self.root.clone(),
            })?;

        let mut joins: Vec<EntityType> = Vec::new();
        for t in &self.types {
            for m in &t.many_to_many {
                if names.contains(m.relation.as_str()) || joins.iter().any(|j| j.name == m.relation)
                {
                    return Err(RegistryError::DuplicateType {
                        name: m.relation.clone(),
                    });
                }
                joins.push(EntityType::join(m, &t.name));
            }
        }

        let mut types = self.types;
        types.extend(joins);
        Ok(EntityRegistry { types, root })
    }
}
