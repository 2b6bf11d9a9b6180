//! Shared harness for the integration tests: an in-memory relational store
//! that enforces the constraints a real database would, plus the mappings
//! the tests run against.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use tessera::{
    AssociationInfo, Binding, CascadeSet, CollectionInfo, CollectionKind, ColumnBinding, ColumnInfo,
    ConstraintKind, ConstraintViolationError, CustomSql, Dialect, EntityMetadata, Error,
    ExecutionResult, IdGeneration, MetadataRegistry, MutationDescriptor, MutationKind,
    MutationTarget, Result, ResultCheck, Row, Session, Store, StoreError, StoreErrorKind, Value, VersionInfo,
};

pub type Record = BTreeMap<String, Value>;

/// One statement the store received.
#[derive(Debug, Clone)]
pub struct Executed {
    pub kind: MutationKind,
    pub table: String,
    pub target: MutationTarget,
    pub sql: String,
    pub columns: Vec<String>,
    pub params: Vec<Value>,
    pub returning: Vec<String>,
    pub custom: bool,
}

#[derive(Debug, Clone)]
struct ForeignKeyDef {
    table: String,
    column: String,
    target_table: String,
    target_column: String,
}

#[derive(Debug, Clone, Default)]
struct TableDef {
    /// `None` for link tables, whose key is the whole row
    id_column: Option<String>,
    identity: bool,
    not_null: Vec<String>,
    generated: Vec<String>,
}

#[derive(Debug, Default)]
struct Database {
    tables: BTreeMap<String, TableDef>,
    /// Entity name to (table, id column)
    entities: HashMap<String, (String, String)>,
    foreign_keys: Vec<ForeignKeyDef>,
    rows: BTreeMap<String, Vec<Record>>,
    next_identity: i64,
    sequences: HashMap<String, i64>,
    log: Vec<Executed>,
    deferred: bool,
    commits: usize,
    rollbacks: usize,
    batches: usize,
}

/// In-memory store shared between clones, so a test can keep a handle
/// after giving one to a session, or give two sessions the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore(Rc<RefCell<Database>>);

impl MemoryStore {
    /// Build the schema implied by `registry`: one table per entity, one per
    /// many-to-many link table, and a foreign key per association and
    /// owning collection.
    pub fn new(registry: &MetadataRegistry) -> Self {
        let mut db = Database::default();
        for meta in registry.entities() {
            let mut def = TableDef {
                id_column: Some(meta.id_column.clone()),
                identity: meta.id_generation == IdGeneration::Identity,
                not_null: vec![meta.id_column.clone()],
                generated: Vec::new(),
            };
            for column in &meta.columns {
                if column.generated {
                    def.generated.push(column.name.clone());
                } else if !column.nullable {
                    def.not_null.push(column.name.clone());
                }
            }
            if let Some(version) = &meta.version {
                def.not_null.push(version.column.clone());
            }
            for assoc in &meta.associations {
                if !assoc.nullable {
                    def.not_null.push(assoc.fk_column.clone());
                }
                let target = registry.get(&assoc.target).expect("validated registry");
                db.add_foreign_key(&meta.table, &assoc.fk_column, &target.table, &target.id_column);
            }
            for info in &meta.collections {
                let element = registry.get(&info.element).expect("validated registry");
                match &info.kind {
                    CollectionKind::OneToMany { fk_column } => {
                        db.add_foreign_key(&element.table, fk_column, &meta.table, &meta.id_column);
                    }
                    CollectionKind::ManyToMany {
                        table,
                        owner_column,
                        element_column,
                    } => {
                        db.tables.entry(table.clone()).or_insert_with(|| TableDef {
                            not_null: vec![owner_column.clone(), element_column.clone()],
                            ..TableDef::default()
                        });
                        db.add_foreign_key(table, owner_column, &meta.table, &meta.id_column);
                        db.add_foreign_key(table, element_column, &element.table, &element.id_column);
                    }
                }
            }
            db.entities
                .insert(meta.name.clone(), (meta.table.clone(), meta.id_column.clone()));
            db.tables.insert(meta.table.clone(), def);
        }
        Self(Rc::new(RefCell::new(db)))
    }

    /// Check foreign keys at commit instead of per statement.
    pub fn defer_constraints(&self, value: bool) {
        self.0.borrow_mut().deferred = value;
    }

    /// Insert a row directly, bypassing constraints and the statement log.
    pub fn seed(&self, table: &str, pairs: Vec<(&str, Value)>) {
        let mut db = self.0.borrow_mut();
        if let Some(id) = pairs.iter().find(|(c, _)| *c == "id").and_then(|(_, v)| v.as_i64()) {
            db.next_identity = db.next_identity.max(id);
        }
        let record: Record = pairs.into_iter().map(|(c, v)| (c.to_string(), v)).collect();
        db.rows.entry(table.to_string()).or_default().push(record);
    }

    /// Overwrite one column of a stored row, as a concurrent transaction would.
    pub fn set_column(&self, table: &str, id: impl Into<Value>, column: &str, value: impl Into<Value>) {
        let id = id.into();
        let mut db = self.0.borrow_mut();
        let id_column = db.id_column(table);
        if let Some(row) = db
            .rows
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| key_matches(r, &id_column, &id)))
        {
            row.insert(column.to_string(), value.into());
        }
    }

    /// Delete a stored row behind the session's back.
    pub fn purge(&self, table: &str, id: impl Into<Value>) {
        let id = id.into();
        let mut db = self.0.borrow_mut();
        let id_column = db.id_column(table);
        if let Some(rows) = db.rows.get_mut(table) {
            rows.retain(|r| !key_matches(r, &id_column, &id));
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.0.borrow().rows.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: impl Into<Value>) -> Option<Record> {
        let id = id.into();
        let db = self.0.borrow();
        let id_column = db.id_column(table);
        db.rows
            .get(table)
            .and_then(|rows| rows.iter().find(|r| key_matches(r, &id_column, &id)).cloned())
    }

    pub fn count(&self, table: &str) -> usize {
        self.0.borrow().rows.get(table).map_or(0, Vec::len)
    }

    pub fn log(&self) -> Vec<Executed> {
        self.0.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.0.borrow_mut().log.clear();
    }

    /// Statements of `kind` against `table`, in execution order.
    pub fn executed(&self, kind: MutationKind, table: &str) -> Vec<Executed> {
        self.0
            .borrow()
            .log
            .iter()
            .filter(|e| e.kind == kind && e.table == table)
            .cloned()
            .collect()
    }

    /// `(kind, table)` of every statement, in execution order.
    pub fn trace(&self) -> Vec<(MutationKind, String)> {
        self.0
            .borrow()
            .log
            .iter()
            .map(|e| (e.kind, e.table.clone()))
            .collect()
    }

    pub fn commits(&self) -> usize {
        self.0.borrow().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.0.borrow().rollbacks
    }

    pub fn batches(&self) -> usize {
        self.0.borrow().batches
    }
}

impl Store for MemoryStore {
    fn execute(&mut self, mutation: &MutationDescriptor, params: &[Value]) -> Result<ExecutionResult> {
        self.0.borrow_mut().execute(mutation, params)
    }

    fn execute_batch(&mut self, mutation: &MutationDescriptor, batch: &[Vec<Value>]) -> Result<Vec<u64>> {
        let mut db = self.0.borrow_mut();
        db.batches += 1;
        batch
            .iter()
            .map(|params| db.execute(mutation, params).map(|r| r.affected_rows))
            .collect()
    }

    fn next_sequence_value(&mut self, sequence: &str) -> Result<Value> {
        let mut db = self.0.borrow_mut();
        let next = db.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(Value::BigInt(*next))
    }

    fn load_row(&mut self, entity: &EntityMetadata, id: &Value) -> Result<Option<Row>> {
        let db = self.0.borrow();
        Ok(db
            .rows
            .get(&entity.table)
            .and_then(|rows| rows.iter().find(|r| key_matches(r, &entity.id_column, id)))
            .map(|record| Row::from_pairs(record.clone())))
    }

    fn load_collection(&mut self, collection: &CollectionInfo, owner_id: &Value) -> Result<Vec<Value>> {
        let db = self.0.borrow();
        let (table, fk, element_column) = match &collection.kind {
            CollectionKind::OneToMany { fk_column } => {
                let Some((table, id_column)) = db.entities.get(&collection.element) else {
                    return Err(Error::unknown_entity(&collection.element));
                };
                (table.clone(), fk_column.clone(), id_column.clone())
            }
            CollectionKind::ManyToMany {
                table,
                owner_column,
                element_column,
            } => (table.clone(), owner_column.clone(), element_column.clone()),
        };
        Ok(db
            .rows
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| key_matches(r, &fk, owner_id))
                    .filter_map(|r| r.get(&element_column).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&mut self) -> Result<()> {
        let mut db = self.0.borrow_mut();
        db.commits += 1;
        if db.deferred {
            let tables: Vec<String> = db.rows.keys().cloned().collect();
            for table in tables {
                for record in db.rows.get(&table).cloned().unwrap_or_default() {
                    db.check_references(&table, &record)?;
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.0.borrow_mut().rollbacks += 1;
        Ok(())
    }
}

impl Database {
    fn add_foreign_key(&mut self, table: &str, column: &str, target_table: &str, target_column: &str) {
        if self
            .foreign_keys
            .iter()
            .any(|fk| fk.table == table && fk.column == column)
        {
            return;
        }
        self.foreign_keys.push(ForeignKeyDef {
            table: table.to_string(),
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: target_column.to_string(),
        });
    }

    fn id_column(&self, table: &str) -> String {
        self.tables
            .get(table)
            .and_then(|t| t.id_column.clone())
            .unwrap_or_else(|| "id".to_string())
    }

    fn execute(&mut self, mutation: &MutationDescriptor, params: &[Value]) -> Result<ExecutionResult> {
        let columns: Vec<String> = mutation
            .parameter_columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        if columns.len() != params.len() {
            return Err(execution(format!(
                "{} parameters bound for {} placeholders",
                params.len(),
                columns.len()
            )));
        }
        self.log.push(Executed {
            kind: mutation.kind(),
            table: mutation.table().to_string(),
            target: mutation.target().clone(),
            sql: mutation.sql(Dialect::Postgres).into_owned(),
            columns: columns.clone(),
            params: params.to_vec(),
            returning: mutation.returning_columns().to_vec(),
            custom: mutation.is_custom(),
        });

        let mut next = params.iter().cloned();
        let mut bind = |b: &ColumnBinding| match &b.binding {
            Binding::Parameter => next.next().unwrap_or(Value::Null),
            Binding::Literal(value) => value.clone(),
        };
        let values: Vec<(String, Value)> = mutation
            .values()
            .iter()
            .map(|b| (b.column.clone(), bind(b)))
            .collect();
        let mut keys: Vec<(String, Value)> = mutation
            .keys()
            .iter()
            .map(|b| (b.column.clone(), bind(b)))
            .collect();
        if let Some(column) = mutation.version_column() {
            keys.push((column.to_string(), next.next().unwrap_or(Value::Null)));
        }

        match mutation.kind() {
            MutationKind::Insert => self.insert(mutation, values),
            MutationKind::Update => self.update(mutation.table(), &values, &keys),
            MutationKind::Delete => self.delete(mutation.table(), &keys),
        }
    }

    fn insert(&mut self, mutation: &MutationDescriptor, values: Vec<(String, Value)>) -> Result<ExecutionResult> {
        let table = mutation.table();
        let def = self
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| execution(format!("no such table: {table}")))?;
        let mut record: Record = values.into_iter().collect();
        if let (true, Some(id_column)) = (def.identity, &def.id_column) {
            if record.get(id_column).map_or(true, Value::is_null) {
                self.next_identity += 1;
                record.insert(id_column.clone(), Value::BigInt(self.next_identity));
            }
        }
        for column in &def.generated {
            if record.get(column).map_or(true, Value::is_null) {
                record.insert(column.clone(), Value::Text(format!("default:{column}")));
            }
        }

        self.check_not_null(table, &def, &record)?;
        let duplicate = self.rows.get(table).is_some_and(|rows| {
            rows.iter().any(|existing| match &def.id_column {
                Some(id_column) => record
                    .get(id_column)
                    .is_some_and(|id| key_matches(existing, id_column, id)),
                None => same_record(existing, &record),
            })
        });
        if duplicate {
            return Err(violation(ConstraintKind::Unique, table, "duplicate key"));
        }
        if !self.deferred {
            self.check_references(table, &record)?;
        }

        let mut result = ExecutionResult::rows(1);
        for column in mutation.returning_columns() {
            result = result.with_generated(column, record.get(column).cloned().unwrap_or(Value::Null));
        }
        self.rows.entry(table.to_string()).or_default().push(record);
        Ok(result)
    }

    fn update(&mut self, table: &str, values: &[(String, Value)], keys: &[(String, Value)]) -> Result<ExecutionResult> {
        let def = self.tables.get(table).cloned().unwrap_or_default();
        let matching: Vec<usize> = self
            .rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .filter(|(_, r)| keys.iter().all(|(c, v)| key_matches(r, c, v)))
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();
        for &index in &matching {
            let mut record = self.rows[table][index].clone();
            for (column, value) in values {
                record.insert(column.clone(), value.clone());
            }
            self.check_not_null(table, &def, &record)?;
            if !self.deferred {
                self.check_references(table, &record)?;
            }
            if let Some(rows) = self.rows.get_mut(table) {
                rows[index] = record;
            }
        }
        Ok(ExecutionResult::rows(matching.len() as u64))
    }

    fn delete(&mut self, table: &str, keys: &[(String, Value)]) -> Result<ExecutionResult> {
        let matching: Vec<usize> = self
            .rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .filter(|(_, r)| keys.iter().all(|(c, v)| key_matches(r, c, v)))
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();
        if !self.deferred {
            for &index in &matching {
                let record = &self.rows[table][index];
                for fk in self.foreign_keys.iter().filter(|fk| fk.target_table == table) {
                    let Some(key) = record.get(&fk.target_column) else {
                        continue;
                    };
                    let referenced = self.rows.get(&fk.table).is_some_and(|rows| {
                        rows.iter().enumerate().any(|(i, r)| {
                            !(fk.table == table && i == index) && key_matches(r, &fk.column, key)
                        })
                    });
                    if referenced {
                        return Err(violation(
                            ConstraintKind::ForeignKey,
                            table,
                            format!("row {key} is still referenced by {}.{}", fk.table, fk.column),
                        ));
                    }
                }
            }
        }
        if let Some(rows) = self.rows.get_mut(table) {
            for &index in matching.iter().rev() {
                rows.remove(index);
            }
        }
        Ok(ExecutionResult::rows(matching.len() as u64))
    }

    fn check_not_null(&self, table: &str, def: &TableDef, record: &Record) -> Result<()> {
        for column in &def.not_null {
            if record.get(column).map_or(true, Value::is_null) {
                return Err(violation(
                    ConstraintKind::NotNull,
                    table,
                    format!("column {column} is NULL"),
                ));
            }
        }
        Ok(())
    }

    fn check_references(&self, table: &str, record: &Record) -> Result<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(value) = record.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let found = self
                .rows
                .get(&fk.target_table)
                .is_some_and(|rows| rows.iter().any(|r| key_matches(r, &fk.target_column, value)));
            if !found {
                return Err(violation(
                    ConstraintKind::ForeignKey,
                    table,
                    format!("{}.{} = {value} has no parent in {}", table, fk.column, fk.target_table),
                ));
            }
        }
        Ok(())
    }
}

fn key_matches(record: &Record, column: &str, value: &Value) -> bool {
    record.get(column).is_some_and(|v| !v.is_null() && v.same_identity(value))
}

fn same_record(a: &Record, b: &Record) -> bool {
    a.len() == b.len() && a.iter().all(|(c, v)| b.get(c).is_some_and(|w| w.same_identity(v)))
}

fn violation(kind: ConstraintKind, table: &str, message: impl Into<String>) -> Error {
    Error::ConstraintViolation(ConstraintViolationError::new(kind, table, message))
}

fn execution(message: String) -> Error {
    Error::Store(StoreError {
        kind: StoreErrorKind::Execution,
        message,
        source: None,
    })
}

// ============================================================================
// Mappings
// ============================================================================

/// Variations of the contract mapping.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    /// `Contract.parties` deletes parties removed from it
    pub orphan_removal: bool,
    /// `Contract.parties` is the inverse of `Party.contract`
    pub inverse: bool,
    /// `Contract` carries a version column
    pub versioned: bool,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            orphan_removal: true,
            inverse: false,
            versioned: true,
        }
    }
}

/// Contracts with parties, variations and plans, plus self-referencing
/// `Node` and `Peer` entities for cycle tests.
///
/// - `Contract`: identity id, versioned unless disabled, `notes` excluded from locking
/// - `Party`: identity id, owned by `Contract.parties`
/// - `Variation`: sequence id, versioned, required `contract`, optional `parent`
/// - `Plan`: assigned id, generated `created_at`, linked through `contract_plan`
pub fn registry(mapping: Mapping) -> MetadataRegistry {
    let mut parties = CollectionInfo::one_to_many("parties", "Party", "contract_id")
        .cascade(CascadeSet::ALL)
        .orphan_removal(mapping.orphan_removal);
    let mut party = EntityMetadata::new("Party", "party")
        .id("id", IdGeneration::Identity)
        .column(ColumnInfo::new("name"));
    if mapping.inverse {
        parties = parties.inverse(true).back_reference("contract");
        party = party.association(AssociationInfo::many_to_one("contract", "Contract", "contract_id"));
    }

    let mut contract = EntityMetadata::new("Contract", "contract")
        .id("id", IdGeneration::Identity)
        .column(ColumnInfo::new("customer_name").nullable(false))
        .column(ColumnInfo::new("notes").optimistic_lock(false));
    if mapping.versioned {
        contract = contract.version(VersionInfo::counter("version"));
    }

    let registry = MetadataRegistry::new()
        .with(
            contract
                .collection(parties)
                .collection(
                    CollectionInfo::one_to_many("variations", "Variation", "contract_id")
                        .inverse(true)
                        .back_reference("contract")
                        .cascade(CascadeSet::ALL)
                        .orphan_removal(true),
                )
                .collection(
                    CollectionInfo::many_to_many("plans", "Plan", "contract_plan", "contract_id", "plan_id")
                        .cascade(CascadeSet::parse("persist,merge").expect("valid cascade")),
                ),
        )
        .with(party)
        .with(
            EntityMetadata::new("Variation", "variation")
                .id("id", IdGeneration::Sequence("variation_seq".into()))
                .column(ColumnInfo::new("description"))
                .version(VersionInfo::counter("version"))
                .association(AssociationInfo::many_to_one("contract", "Contract", "contract_id").nullable(false))
                .association(AssociationInfo::many_to_one("parent", "Variation", "parent_id")),
        )
        .with(
            EntityMetadata::new("Plan", "plan")
                .column(ColumnInfo::new("title").nullable(false))
                .column(ColumnInfo::new("tier"))
                .column(ColumnInfo::new("created_at").generated(true).updatable(false)),
        )
        .with(
            EntityMetadata::new("Node", "node")
                .id("id", IdGeneration::Identity)
                .column(ColumnInfo::new("label"))
                .association(AssociationInfo::many_to_one("next", "Node", "next_id")),
        )
        .with(
            EntityMetadata::new("Peer", "peer")
                .id("id", IdGeneration::Sequence("peer_seq".into()))
                .association(AssociationInfo::many_to_one("partner", "Peer", "partner_id").nullable(false)),
        );
    registry.validate().expect("valid mapping");
    registry
}

/// The default mapping with custom insert, update and delete statements for
/// `Plan`. The delete does not report reliable row counts.
pub fn registry_with_custom_plan_sql() -> MetadataRegistry {
    let mut registry = registry(Mapping::default());
    let plan = registry.get("Plan").expect("registered");
    registry.register(
        (*plan)
            .clone()
            .custom_sql(
                MutationKind::Insert,
                CustomSql::new(
                    "INSERT INTO plan (id, title, tier, created_at) VALUES ($1, $2, $3, $4)",
                ),
            )
            .custom_sql(
                MutationKind::Update,
                CustomSql::callable("{call update_plan($1, $2, $3)}"),
            )
            .custom_sql(
                MutationKind::Delete,
                CustomSql::new("DELETE FROM plan WHERE id = $1").check(ResultCheck::None),
            ),
    );
    registry
}

/// A store and a session over `registry`.
pub fn open(registry: MetadataRegistry) -> (MemoryStore, Session<MemoryStore>) {
    let store = MemoryStore::new(&registry);
    let session = Session::new(store.clone(), Arc::new(registry));
    (store, session)
}

/// Contract columns as stored.
pub fn contract_row(id: i64, customer_name: &str, version: i64) -> Vec<(&'static str, Value)> {
    vec![
        ("id", Value::BigInt(id)),
        ("customer_name", Value::Text(customer_name.to_string())),
        ("notes", Value::Null),
        ("version", Value::BigInt(version)),
    ]
}

/// Seed contract 1 ("Acme", version 1) with parties 10 ("Buyer") and 11 ("Seller").
pub fn seed_contract_with_parties(store: &MemoryStore) {
    store.seed("contract", contract_row(1, "Acme", 1));
    for (id, name) in [(10, "Buyer"), (11, "Seller")] {
        store.seed(
            "party",
            vec![
                ("id", Value::BigInt(id)),
                ("name", Value::Text(name.to_string())),
                ("contract_id", Value::BigInt(1)),
            ],
        );
    }
}
