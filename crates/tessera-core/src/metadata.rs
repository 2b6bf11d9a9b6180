//! Entity and association metadata.
//!
//! Metadata is produced by an external mapping loader and consumed
//! read-only. Each entity declares its table, identifier strategy, columns,
//! optional version column, to-one associations, collection roles and
//! per-table custom statements. A [`MetadataRegistry`] resolves entity names
//! and validates cross references between them.

use crate::error::{Error, MappingError, MappingErrorKind, Result};
use crate::mutation::MutationKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How an entity's identifier is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// The application sets the identifier before persist.
    #[default]
    Assigned,
    /// The store generates the identifier on insert; it is read back.
    Identity,
    /// The identifier is drawn from a named store sequence at persist time.
    Sequence(String),
}

impl IdGeneration {
    /// Whether the identifier is known before the insert executes.
    pub fn known_before_insert(&self) -> bool {
        !matches!(self, IdGeneration::Identity)
    }
}

/// The kind of optimistic version column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionKind {
    /// Integer counter, incremented by one on each versioned update.
    #[default]
    Counter,
    /// Timestamp in microseconds since epoch, refreshed on each update.
    Timestamp,
}

/// Optimistic version column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub column: String,
    pub kind: VersionKind,
}

impl VersionInfo {
    pub fn counter(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind: VersionKind::Counter,
        }
    }

    pub fn timestamp(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind: VersionKind::Timestamp,
        }
    }
}

/// A scalar property column. The property name is the column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Whether NULL is accepted by the store
    pub nullable: bool,
    /// Whether the column is written on insert
    pub insertable: bool,
    /// Whether the column is written on update
    pub updatable: bool,
    /// Value is produced by the store (default, trigger) and read back on insert
    pub generated: bool,
    /// Whether a change to this column increments the entity version
    pub optimistic_lock: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            insertable: true,
            updatable: true,
            generated: false,
            optimistic_lock: true,
        }
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    pub fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    pub fn optimistic_lock(mut self, value: bool) -> Self {
        self.optimistic_lock = value;
        self
    }
}

/// A lifecycle operation that may cascade across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Merge,
    Remove,
    Refresh,
}

impl CascadeOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Merge => "merge",
            CascadeOp::Remove => "remove",
            CascadeOp::Refresh => "refresh",
        }
    }
}

/// The set of operations an association cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeSet {
    pub persist: bool,
    pub merge: bool,
    pub remove: bool,
    pub refresh: bool,
    /// Set by `delete-orphan`; collections copy it into their orphan policy.
    pub delete_orphan: bool,
}

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet {
        persist: false,
        merge: false,
        remove: false,
        refresh: false,
        delete_orphan: false,
    };

    pub const ALL: CascadeSet = CascadeSet {
        persist: true,
        merge: true,
        remove: true,
        refresh: true,
        delete_orphan: false,
    };

    /// Parse a cascade declaration such as `"all, delete-orphan"`.
    ///
    /// Accepts `none`, `all`, `all-delete-orphan`, `persist`, `save-update`,
    /// `merge`, `remove`, `delete`, `refresh` and `delete-orphan`.
    pub fn parse(styles: &str) -> Result<Self> {
        let mut set = CascadeSet::NONE;
        for token in styles.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "none" => {}
                "all" => {
                    set = CascadeSet {
                        delete_orphan: set.delete_orphan,
                        ..CascadeSet::ALL
                    };
                }
                "all-delete-orphan" => {
                    set = CascadeSet {
                        delete_orphan: true,
                        ..CascadeSet::ALL
                    };
                }
                "persist" | "save-update" => set.persist = true,
                "merge" => set.merge = true,
                "remove" | "delete" => set.remove = true,
                "refresh" => set.refresh = true,
                "delete-orphan" => set.delete_orphan = true,
                other => {
                    return Err(Error::Mapping(MappingError {
                        kind: MappingErrorKind::Invalid,
                        message: format!("unknown cascade style '{other}' in '{styles}'"),
                    }));
                }
            }
        }
        Ok(set)
    }

    pub fn contains(&self, op: CascadeOp) -> bool {
        match op {
            CascadeOp::Persist => self.persist,
            CascadeOp::Merge => self.merge,
            CascadeOp::Remove => self.remove,
            CascadeOp::Refresh => self.refresh,
        }
    }
}

/// A to-one association stored as a foreign-key column on the owning table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Property name on the entity
    pub name: String,
    /// Target entity name
    pub target: String,
    /// Foreign-key column on this entity's table
    pub fk_column: String,
    /// Whether the foreign key accepts NULL
    pub nullable: bool,
    pub cascade: CascadeSet,
}

impl AssociationInfo {
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            fk_column: fk_column.into(),
            nullable: true,
            cascade: CascadeSet::NONE,
        }
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }
}

/// Relational shape of a collection role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    /// Elements carry a foreign key to the owner in their own table.
    OneToMany {
        /// Foreign-key column on the element table
        fk_column: String,
    },
    /// Membership lives in a link table.
    ManyToMany {
        table: String,
        owner_column: String,
        element_column: String,
    },
}

/// A collection-valued association (collection role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Property name on the owner
    pub role: String,
    /// Owner entity name, filled in when added to [`EntityMetadata`]
    pub owner: String,
    /// Element entity name
    pub element: String,
    pub kind: CollectionKind,
    /// The opposite side writes the foreign key
    pub inverse: bool,
    /// To-one association on the element pointing back at the owner
    pub back_reference: Option<String>,
    pub orphan_removal: bool,
    pub cascade: CascadeSet,
    /// Whether membership changes increment the owner's version
    pub optimistic_lock: bool,
}

impl CollectionInfo {
    pub fn one_to_many(
        role: impl Into<String>,
        element: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            role,
            element,
            CollectionKind::OneToMany {
                fk_column: fk_column.into(),
            },
        )
    }

    pub fn many_to_many(
        role: impl Into<String>,
        element: impl Into<String>,
        table: impl Into<String>,
        owner_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            role,
            element,
            CollectionKind::ManyToMany {
                table: table.into(),
                owner_column: owner_column.into(),
                element_column: element_column.into(),
            },
        )
    }

    fn with_kind(role: impl Into<String>, element: impl Into<String>, kind: CollectionKind) -> Self {
        Self {
            role: role.into(),
            owner: String::new(),
            element: element.into(),
            kind,
            inverse: false,
            back_reference: None,
            orphan_removal: false,
            cascade: CascadeSet::NONE,
            optimistic_lock: true,
        }
    }

    pub fn inverse(mut self, value: bool) -> Self {
        self.inverse = value;
        self
    }

    pub fn back_reference(mut self, association: impl Into<String>) -> Self {
        self.back_reference = Some(association.into());
        self
    }

    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Set the cascade set. `delete-orphan` in the set enables orphan removal.
    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.orphan_removal |= cascade.delete_orphan;
        self.cascade = cascade;
        self
    }

    pub fn optimistic_lock(mut self, value: bool) -> Self {
        self.optimistic_lock = value;
        self
    }

    /// `Owner.role`, used in logs and statistics.
    pub fn qualified_role(&self) -> String {
        format!("{}.{}", self.owner, self.role)
    }

    /// Foreign-key column on the element table, for one-to-many roles.
    pub fn element_fk_column(&self) -> Option<&str> {
        match &self.kind {
            CollectionKind::OneToMany { fk_column } => Some(fk_column),
            CollectionKind::ManyToMany { .. } => None,
        }
    }
}

/// Outcome validation for custom statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultCheck {
    /// The reported row count must match the expected count.
    #[default]
    Count,
    /// The statement does not report reliable counts.
    None,
}

/// A statement supplied by the mapping in place of generated SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSql {
    pub text: String,
    /// Stored-procedure call rather than plain DML
    pub callable: bool,
    pub check: ResultCheck,
}

impl CustomSql {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callable: false,
            check: ResultCheck::Count,
        }
    }

    pub fn callable(text: impl Into<String>) -> Self {
        Self {
            callable: true,
            ..Self::new(text)
        }
    }

    pub fn check(mut self, check: ResultCheck) -> Self {
        self.check = check;
        self
    }
}

/// Complete mapping of one entity to one table.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub id_generation: IdGeneration,
    pub columns: Vec<ColumnInfo>,
    pub version: Option<VersionInfo>,
    pub associations: Vec<AssociationInfo>,
    pub collections: Vec<CollectionInfo>,
    custom_sql: BTreeMap<MutationKind, CustomSql>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            id_generation: IdGeneration::Assigned,
            columns: Vec::new(),
            version: None,
            associations: Vec::new(),
            collections: Vec::new(),
            custom_sql: BTreeMap::new(),
        }
    }

    pub fn id(mut self, column: impl Into<String>, generation: IdGeneration) -> Self {
        self.id_column = column.into();
        self.id_generation = generation;
        self
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn version(mut self, version: VersionInfo) -> Self {
        self.version = Some(version);
        self
    }

    pub fn association(mut self, association: AssociationInfo) -> Self {
        self.associations.push(association);
        self
    }

    pub fn collection(mut self, mut collection: CollectionInfo) -> Self {
        collection.owner.clone_from(&self.name);
        self.collections.push(collection);
        self
    }

    pub fn custom_sql(mut self, kind: MutationKind, sql: CustomSql) -> Self {
        self.custom_sql.insert(kind, sql);
        self
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn column_info(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn association_info(&self, name: &str) -> Result<&AssociationInfo> {
        self.associations
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::unknown_association(&self.name, name))
    }

    pub fn collection_info(&self, role: &str) -> Result<&CollectionInfo> {
        self.collections
            .iter()
            .find(|c| c.role == role)
            .ok_or_else(|| Error::unknown_association(&self.name, role))
    }

    /// The custom statement declared for this table and operation, if any.
    pub fn custom_sql_for(&self, kind: MutationKind) -> Option<&CustomSql> {
        self.custom_sql.get(&kind)
    }
}

/// Registry of all entity mappings known to a session.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity mapping (builder pattern).
    pub fn with(mut self, entity: EntityMetadata) -> Self {
        self.register(entity);
        self
    }

    pub fn register(&mut self, entity: EntityMetadata) {
        tracing::trace!(
            entity = %entity.name,
            table = %entity.table,
            collections = entity.collections.len(),
            "Registering entity mapping"
        );
        self.entities.insert(entity.name.clone(), Arc::new(entity));
    }

    pub fn get(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::unknown_entity(entity))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    /// The collection role that owns `column` on `element`'s table, if any.
    ///
    /// Only non-inverse one-to-many roles own an element-side column.
    pub fn owning_collection_for(&self, element: &str, column: &str) -> Option<&CollectionInfo> {
        self.entities
            .values()
            .flat_map(|meta| meta.collections.iter())
            .find(|c| !c.inverse && c.element == element && c.element_fk_column() == Some(column))
    }

    /// Check cross references between registered entities.
    pub fn validate(&self) -> Result<()> {
        let mut fk_owners: HashMap<(&str, &str), &str> = HashMap::new();
        for meta in self.entities.values() {
            for assoc in &meta.associations {
                if !self.entities.contains_key(&assoc.target) {
                    return Err(invalid(format!(
                        "{}.{} targets unknown entity '{}'",
                        meta.name, assoc.name, assoc.target
                    )));
                }
            }
            for coll in &meta.collections {
                let element = self.entities.get(&coll.element).ok_or_else(|| {
                    invalid(format!(
                        "{} has unknown element entity '{}'",
                        coll.qualified_role(),
                        coll.element
                    ))
                })?;
                if let Some(back) = &coll.back_reference {
                    let assoc = element.association_info(back)?;
                    if assoc.target != meta.name {
                        return Err(invalid(format!(
                            "back reference {}.{} of {} targets '{}'",
                            element.name,
                            back,
                            coll.qualified_role(),
                            assoc.target
                        )));
                    }
                    if let Some(fk) = coll.element_fk_column() {
                        if fk != assoc.fk_column {
                            return Err(invalid(format!(
                                "{} maps column '{}' but back reference {}.{} maps '{}'",
                                coll.qualified_role(),
                                fk,
                                element.name,
                                back,
                                assoc.fk_column
                            )));
                        }
                    }
                }
                if coll.inverse && coll.back_reference.is_none() {
                    return Err(invalid(format!(
                        "inverse collection {} needs a back reference",
                        coll.qualified_role()
                    )));
                }
                if let (false, Some(fk)) = (coll.inverse, coll.element_fk_column()) {
                    if let Some(previous) = fk_owners.insert((element.name.as_str(), fk), meta.name.as_str()) {
                        return Err(invalid(format!(
                            "column {}.{} is owned by collections of both {} and {}",
                            element.table, fk, previous, meta.name
                        )));
                    }
                }
            }
        }
        tracing::debug!(entities = self.entities.len(), "Metadata registry validated");
        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::Mapping(MappingError {
        kind: MappingErrorKind::Invalid,
        message,
    })
}
