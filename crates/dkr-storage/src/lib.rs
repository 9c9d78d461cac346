//! Storage port for reconciliation runs, with in-memory and Postgres backends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dkr_core::{
    AggregatePhase, ChildId, ChildRecord, DependentId, DependentRecord, DerivedKey, Entity,
    EntityAggregates, EntityId, KeyComponent, KeyRule, MismatchRow, ReferenceCounts,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "dkr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("entity {0} does not exist")]
    MissingEntity(EntityId),
    #[error("entity {entity_id} is still referenced ({references})")]
    ForeignKey {
        entity_id: EntityId,
        references: ReferenceCounts,
    },
    #[error("{0}")]
    Backend(String),
}

/// Narrow read/write surface the reconciliation engine needs from a store.
#[async_trait]
pub trait ReconStore: Send {
    /// Every child whose entity key or own stored key differs from the rule's key.
    async fn scan_mismatches(&mut self, rule: &KeyRule) -> Result<Vec<MismatchRow>, StoreError>;

    /// Entities currently carrying `key`, ordered by id.
    async fn entities_with_key(&mut self, key: &DerivedKey) -> Result<Vec<Entity>, StoreError>;

    async fn entity(&mut self, id: EntityId) -> Result<Option<Entity>, StoreError>;

    async fn set_entity_key(&mut self, id: EntityId, key: &DerivedKey) -> Result<u64, StoreError>;

    /// Point the given children at `to` and stamp them with `key`.
    async fn repoint_children(
        &mut self,
        children: &[ChildId],
        to: EntityId,
        key: &DerivedKey,
    ) -> Result<u64, StoreError>;

    /// Point every dependent record of the `from` entities at `to`.
    async fn repoint_dependents(&mut self, from: &[EntityId], to: EntityId) -> Result<u64, StoreError>;

    async fn reference_counts(&mut self, id: EntityId) -> Result<ReferenceCounts, StoreError>;

    async fn delete_entity(&mut self, id: EntityId) -> Result<u64, StoreError>;

    /// Store-native recompute of one aggregate phase.
    async fn recompute(&mut self, phase: AggregatePhase, ids: &[EntityId]) -> Result<u64, StoreError>;
}

/// A store handle scoped to one transaction.
#[async_trait]
pub trait StoreSession: ReconStore {
    fn store(&mut self) -> &mut dyn ReconStore;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Open a session isolated from every other writer until commit or rollback.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTables {
    pub entities: BTreeMap<EntityId, Entity>,
    pub children: BTreeMap<ChildId, ChildRecord>,
    pub dependents: BTreeMap<DependentId, DependentRecord>,
}

impl MemoryTables {
    pub fn with_entity(mut self, id: i64, key: &str) -> Self {
        let entity = Entity::new(id, key);
        self.entities.insert(entity.id, entity);
        self
    }

    pub fn with_child(
        mut self,
        id: i64,
        entity_id: i64,
        key: &str,
        record_kind: &str,
        fields: &[(&str, &str)],
    ) -> Self {
        let child = ChildRecord {
            id: ChildId(id),
            entity_id: EntityId(entity_id),
            derived_key: DerivedKey::from(key),
            record_kind: record_kind.to_string(),
            amount_cents: 0,
            source_fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.children.insert(child.id, child);
        self
    }

    pub fn with_dependent(mut self, id: i64, entity_id: i64, relation: &str) -> Self {
        let dependent = DependentRecord {
            id: DependentId(id),
            entity_id: EntityId(entity_id),
            relation: relation.to_string(),
            amount_cents: 0,
        };
        self.dependents.insert(dependent.id, dependent);
        self
    }

    pub fn children_of(&self, id: EntityId) -> impl Iterator<Item = &ChildRecord> {
        self.children.values().filter(move |c| c.entity_id == id)
    }

    pub fn dependents_of(&self, id: EntityId) -> impl Iterator<Item = &DependentRecord> {
        self.dependents.values().filter(move |d| d.entity_id == id)
    }

    fn reference_counts(&self, id: EntityId) -> ReferenceCounts {
        let mut counts = ReferenceCounts {
            children: self.children_of(id).count() as u64,
            ..Default::default()
        };
        for dependent in self.dependents_of(id) {
            *counts.dependents.entry(dependent.relation.clone()).or_default() += 1;
        }
        counts
    }

    fn recompute_one(&mut self, phase: AggregatePhase, id: EntityId) -> bool {
        let latest = self.children_of(id).max_by_key(|c| c.id).cloned();
        let total = self.children_of(id).map(|c| c.amount_cents).sum::<i64>();
        let dependent_count = self.dependents_of(id).count() as i64;
        let dependent_amount = self.dependents_of(id).map(|d| d.amount_cents).sum::<i64>();
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        let aggregates = &mut entity.aggregates;
        match phase {
            AggregatePhase::Totals => {
                aggregates.total_amount_cents = total;
                aggregates.latest_child_id = latest.map(|c| c.id);
            }
            AggregatePhase::Categories => {
                aggregates.category = latest.map(|c| c.record_kind);
            }
            AggregatePhase::DependentRollups => {
                aggregates.dependent_count = dependent_count;
                aggregates.dependent_amount_cents = dependent_amount;
            }
        }
        true
    }
}

/// Storage call a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Scan,
    EntitiesWithKey,
    LoadEntity,
    SetEntityKey,
    RepointChildren,
    RepointDependents,
    ReferenceCounts,
    DeleteEntity,
    Recompute,
    Commit,
}

#[derive(Debug, Default)]
struct MemoryShared {
    tables: MemoryTables,
    fault: Option<StoreOp>,
    committed_writes: u64,
}

/// Shared in-memory tables. A session takes the lock for its whole lifetime and
/// edits a working copy that only replaces the shared tables on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryShared>>,
}

impl MemoryStore {
    pub fn new(tables: MemoryTables) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MemoryShared {
                tables,
                ..Default::default()
            })),
        }
    }

    /// Fail every session at `op` until cleared with `None`.
    pub async fn set_fault(&self, op: Option<StoreOp>) {
        self.shared.lock().await.fault = op;
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.shared.lock().await.tables.clone()
    }

    /// Rows written by committed sessions so far.
    pub async fn committed_writes(&self) -> u64 {
        self.shared.lock().await.committed_writes
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let guard = self.shared.clone().lock_owned().await;
        let working = guard.tables.clone();
        Ok(Box::new(MemorySession {
            guard,
            working,
            writes: 0,
        }))
    }
}

pub struct MemorySession {
    guard: OwnedMutexGuard<MemoryShared>,
    working: MemoryTables,
    writes: u64,
}

impl MemorySession {
    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        if self.guard.fault == Some(op) {
            return Err(StoreError::Backend(format!("injected fault at {op:?}")));
        }
        Ok(())
    }

    fn require_entity(&self, id: EntityId) -> Result<(), StoreError> {
        if self.working.entities.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::MissingEntity(id))
        }
    }
}

#[async_trait]
impl ReconStore for MemorySession {
    async fn scan_mismatches(&mut self, rule: &KeyRule) -> Result<Vec<MismatchRow>, StoreError> {
        self.check(StoreOp::Scan)?;
        let mut rows = Vec::new();
        for child in self.working.children.values() {
            let Some(correct_key) = rule.derive(child) else {
                continue;
            };
            let entity = self
                .working
                .entities
                .get(&child.entity_id)
                .ok_or(StoreError::MissingEntity(child.entity_id))?;
            if entity.derived_key != correct_key || child.derived_key != correct_key {
                rows.push(MismatchRow {
                    entity_id: entity.id,
                    entity_key: entity.derived_key.clone(),
                    child_id: child.id,
                    child_key: child.derived_key.clone(),
                    correct_key,
                });
            }
        }
        Ok(rows)
    }

    async fn entities_with_key(&mut self, key: &DerivedKey) -> Result<Vec<Entity>, StoreError> {
        self.check(StoreOp::EntitiesWithKey)?;
        Ok(self
            .working
            .entities
            .values()
            .filter(|e| &e.derived_key == key)
            .cloned()
            .collect())
    }

    async fn entity(&mut self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        self.check(StoreOp::LoadEntity)?;
        Ok(self.working.entities.get(&id).cloned())
    }

    async fn set_entity_key(&mut self, id: EntityId, key: &DerivedKey) -> Result<u64, StoreError> {
        self.check(StoreOp::SetEntityKey)?;
        let Some(entity) = self.working.entities.get_mut(&id) else {
            return Ok(0);
        };
        entity.derived_key = key.clone();
        self.writes += 1;
        Ok(1)
    }

    async fn repoint_children(
        &mut self,
        children: &[ChildId],
        to: EntityId,
        key: &DerivedKey,
    ) -> Result<u64, StoreError> {
        self.check(StoreOp::RepointChildren)?;
        self.require_entity(to)?;
        let mut updated = 0;
        for id in children {
            if let Some(child) = self.working.children.get_mut(id) {
                child.entity_id = to;
                child.derived_key = key.clone();
                updated += 1;
            }
        }
        self.writes += updated;
        Ok(updated)
    }

    async fn repoint_dependents(&mut self, from: &[EntityId], to: EntityId) -> Result<u64, StoreError> {
        self.check(StoreOp::RepointDependents)?;
        self.require_entity(to)?;
        let from = from.iter().copied().collect::<BTreeSet<_>>();
        let mut updated = 0;
        for dependent in self.working.dependents.values_mut() {
            if from.contains(&dependent.entity_id) {
                dependent.entity_id = to;
                updated += 1;
            }
        }
        self.writes += updated;
        Ok(updated)
    }

    async fn reference_counts(&mut self, id: EntityId) -> Result<ReferenceCounts, StoreError> {
        self.check(StoreOp::ReferenceCounts)?;
        Ok(self.working.reference_counts(id))
    }

    async fn delete_entity(&mut self, id: EntityId) -> Result<u64, StoreError> {
        self.check(StoreOp::DeleteEntity)?;
        let references = self.working.reference_counts(id);
        if !references.is_clear() {
            return Err(StoreError::ForeignKey {
                entity_id: id,
                references,
            });
        }
        let removed = u64::from(self.working.entities.remove(&id).is_some());
        self.writes += removed;
        Ok(removed)
    }

    async fn recompute(&mut self, phase: AggregatePhase, ids: &[EntityId]) -> Result<u64, StoreError> {
        self.check(StoreOp::Recompute)?;
        let mut updated = 0;
        for id in ids {
            if self.working.recompute_one(phase, *id) {
                updated += 1;
            }
        }
        self.writes += updated;
        Ok(updated)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    fn store(&mut self) -> &mut dyn ReconStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check(StoreOp::Commit)?;
        let MemorySession {
            mut guard,
            working,
            writes,
        } = *self;
        guard.tables = working;
        guard.committed_writes += writes;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const LOCK_TABLES_SQL: &str =
    "LOCK TABLE entities, child_records, dependent_records IN EXCLUSIVE MODE";

const ENTITY_COLUMNS: &str = "id, derived_key, total_amount_cents, latest_child_id, category, \
                              dependent_count, dependent_amount_cents";

const RECOMPUTE_TOTALS_SQL: &str = r#"
UPDATE entities e
   SET total_amount_cents = COALESCE(
           (SELECT SUM(c.amount_cents) FROM child_records c WHERE c.entity_id = e.id), 0
       )::BIGINT,
       latest_child_id = (SELECT MAX(c.id) FROM child_records c WHERE c.entity_id = e.id),
       updated_at = NOW()
 WHERE e.id = ANY($1)
"#;

const RECOMPUTE_CATEGORIES_SQL: &str = r#"
UPDATE entities e
   SET category = (
           SELECT c.record_kind
             FROM child_records c
            WHERE c.entity_id = e.id
            ORDER BY c.id DESC
            LIMIT 1
       ),
       updated_at = NOW()
 WHERE e.id = ANY($1)
"#;

const RECOMPUTE_DEPENDENT_ROLLUPS_SQL: &str = r#"
UPDATE entities e
   SET dependent_count = (SELECT COUNT(*) FROM dependent_records d WHERE d.entity_id = e.id),
       dependent_amount_cents = COALESCE(
           (SELECT SUM(d.amount_cents) FROM dependent_records d WHERE d.entity_id = e.id), 0
       )::BIGINT,
       updated_at = NOW()
 WHERE e.id = ANY($1)
"#;

/// Postgres store; every session is one transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_tables: bool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_tables: true,
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::from_pool(pool))
    }

    /// Take exclusive table locks at the start of each session (default on).
    pub fn with_table_locks(mut self, lock_tables: bool) -> Self {
        self.lock_tables = lock_tables;
        self
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if self.lock_tables {
            sqlx::query(LOCK_TABLES_SQL).execute(&mut *tx).await?;
            debug!("reconciliation tables locked");
        }
        Ok(Box::new(PgSession { tx }))
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

/// SQL expression computing the rule's key for `c`, plus its bind values in order.
pub fn correct_key_sql(rule: &KeyRule) -> (String, Vec<String>) {
    let mut binds = vec![
        rule.separator.clone(),
        rule.prefix.clone(),
        rule.missing.clone(),
    ];
    let mut sql = String::from("CASE c.record_kind");
    for variant in &rule.variants {
        binds.push(variant.record_kind.clone());
        sql.push_str(&format!(" WHEN ${}::text THEN concat_ws($1::text, $2::text", binds.len()));
        for component in &variant.components {
            match component {
                KeyComponent::Field(name) => {
                    binds.push(name.clone());
                    sql.push_str(&format!(
                        ", COALESCE(c.source_fields ->> ${}::text, $3::text)",
                        binds.len()
                    ));
                }
                KeyComponent::Missing => sql.push_str(", $3::text"),
            }
        }
        sql.push(')');
    }
    sql.push_str(" END");
    (sql, binds)
}

fn entity_from_row(row: &PgRow) -> Result<Entity, sqlx::Error> {
    Ok(Entity {
        id: EntityId(row.try_get("id")?),
        derived_key: DerivedKey::new(row.try_get::<String, _>("derived_key")?),
        aggregates: EntityAggregates {
            total_amount_cents: row.try_get("total_amount_cents")?,
            latest_child_id: row.try_get::<Option<i64>, _>("latest_child_id")?.map(ChildId),
            category: row.try_get("category")?,
            dependent_count: row.try_get("dependent_count")?,
            dependent_amount_cents: row.try_get("dependent_amount_cents")?,
        },
    })
}

fn raw_ids(ids: &[EntityId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

#[async_trait]
impl ReconStore for PgSession {
    async fn scan_mismatches(&mut self, rule: &KeyRule) -> Result<Vec<MismatchRow>, StoreError> {
        let (expr, binds) = correct_key_sql(rule);
        let sql = format!(
            r#"
            SELECT e.id AS entity_id,
                   e.derived_key AS entity_key,
                   c.id AS child_id,
                   c.derived_key AS child_key,
                   k.correct_key
              FROM child_records c
              JOIN entities e ON e.id = c.entity_id
             CROSS JOIN LATERAL (SELECT {expr} AS correct_key) k
             WHERE k.correct_key IS NOT NULL
               AND (e.derived_key <> k.correct_key OR c.derived_key <> k.correct_key)
            "#
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&mut *self.tx).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MismatchRow {
                entity_id: EntityId(row.try_get("entity_id")?),
                entity_key: DerivedKey::new(row.try_get::<String, _>("entity_key")?),
                child_id: ChildId(row.try_get("child_id")?),
                child_key: DerivedKey::new(row.try_get::<String, _>("child_key")?),
                correct_key: DerivedKey::new(row.try_get::<String, _>("correct_key")?),
            });
        }
        Ok(out)
    }

    async fn entities_with_key(&mut self, key: &DerivedKey) -> Result<Vec<Entity>, StoreError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE derived_key = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(entity_from_row(row)?);
        }
        Ok(out)
    }

    async fn entity(&mut self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => Ok(Some(entity_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_entity_key(&mut self, id: EntityId, key: &DerivedKey) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE entities SET derived_key = $1, updated_at = NOW() WHERE id = $2")
            .bind(key.as_str())
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn repoint_children(
        &mut self,
        children: &[ChildId],
        to: EntityId,
        key: &DerivedKey,
    ) -> Result<u64, StoreError> {
        let ids = children.iter().map(|id| id.0).collect::<Vec<_>>();
        let result = sqlx::query(
            "UPDATE child_records SET entity_id = $1, derived_key = $2 WHERE id = ANY($3)",
        )
        .bind(to.0)
        .bind(key.as_str())
        .bind(&ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn repoint_dependents(&mut self, from: &[EntityId], to: EntityId) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE dependent_records SET entity_id = $1 WHERE entity_id = ANY($2)")
            .bind(to.0)
            .bind(raw_ids(from))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reference_counts(&mut self, id: EntityId) -> Result<ReferenceCounts, StoreError> {
        let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM child_records WHERE entity_id = $1")
            .bind(id.0)
            .fetch_one(&mut *self.tx)
            .await?;
        let rows = sqlx::query(
            r#"
            SELECT relation, COUNT(*) AS refs
              FROM dependent_records
             WHERE entity_id = $1
             GROUP BY relation
            "#,
        )
        .bind(id.0)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut counts = ReferenceCounts {
            children: children as u64,
            ..Default::default()
        };
        for row in rows {
            let relation: String = row.try_get("relation")?;
            let refs: i64 = row.try_get("refs")?;
            counts.dependents.insert(relation, refs as u64);
        }
        Ok(counts)
    }

    async fn delete_entity(&mut self, id: EntityId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recompute(&mut self, phase: AggregatePhase, ids: &[EntityId]) -> Result<u64, StoreError> {
        let sql = match phase {
            AggregatePhase::Totals => RECOMPUTE_TOTALS_SQL,
            AggregatePhase::Categories => RECOMPUTE_CATEGORIES_SQL,
            AggregatePhase::DependentRollups => RECOMPUTE_DEPENDENT_ROLLUPS_SQL,
        };
        let result = sqlx::query(sql)
            .bind(raw_ids(ids))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreSession for PgSession {
    fn store(&mut self) -> &mut dyn ReconStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryStore {
        MemoryStore::new(
            MemoryTables::default()
                .with_entity(5, "X")
                .with_entity(9, "ASST_AW_A1_-NONE-_U1")
                .with_child(1, 5, "X", "1", &[("awarding_sub_tier_agency_c", "A1"), ("uri", "U1")])
                .with_child(2, 9, "ASST_AW_A1_-NONE-_U1", "1", &[("awarding_sub_tier_agency_c", "A1"), ("uri", "U1")])
                .with_dependent(1, 5, "subaward"),
        )
    }

    #[tokio::test]
    async fn scan_reports_only_disagreeing_children() {
        let store = seeded();
        let mut session = store.begin().await.unwrap();
        let rows = session.scan_mismatches(&KeyRule::assistance_award()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, EntityId(5));
        assert_eq!(rows[0].child_id, ChildId(1));
        assert_eq!(rows[0].correct_key.as_str(), "ASST_AW_A1_-NONE-_U1");
    }

    #[tokio::test]
    async fn rollback_discards_working_copy() {
        let store = seeded();
        let before = store.snapshot().await;
        let mut session = store.begin().await.unwrap();
        session
            .repoint_children(&[ChildId(1)], EntityId(9), &DerivedKey::from("K"))
            .await
            .unwrap();
        session.rollback().await.unwrap();
        assert_eq!(store.snapshot().await, before);
        assert_eq!(store.committed_writes().await, 0);
    }

    #[tokio::test]
    async fn commit_publishes_working_copy_and_counts_writes() {
        let store = seeded();
        let mut session = store.begin().await.unwrap();
        let moved = session.repoint_dependents(&[EntityId(5)], EntityId(9)).await.unwrap();
        assert_eq!(moved, 1);
        session.commit().await.unwrap();

        let tables = store.snapshot().await;
        assert_eq!(tables.dependents_of(EntityId(9)).count(), 1);
        assert_eq!(store.committed_writes().await, 1);
    }

    #[tokio::test]
    async fn delete_refuses_referenced_entity() {
        let store = seeded();
        let mut session = store.begin().await.unwrap();
        let err = session.delete_entity(EntityId(5)).await.unwrap_err();
        match err {
            StoreError::ForeignKey { entity_id, references } => {
                assert_eq!(entity_id, EntityId(5));
                assert_eq!(references.children, 1);
                assert_eq!(references.dependents.get("subaward"), Some(&1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn repoint_into_missing_entity_is_rejected() {
        let store = seeded();
        let mut session = store.begin().await.unwrap();
        let err = session
            .repoint_children(&[ChildId(1)], EntityId(404), &DerivedKey::from("K"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingEntity(EntityId(404))));
    }

    #[tokio::test]
    async fn injected_fault_fails_the_named_call() {
        let store = seeded();
        store.set_fault(Some(StoreOp::Scan)).await;
        let mut session = store.begin().await.unwrap();
        let err = session.scan_mismatches(&KeyRule::assistance_award()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn recompute_rolls_up_children_and_dependents() {
        let mut tables = MemoryTables::default()
            .with_entity(1, "K")
            .with_child(10, 1, "K", "2", &[])
            .with_child(11, 1, "K", "1", &[])
            .with_dependent(1, 1, "subaward")
            .with_dependent(2, 1, "financial_account");
        tables.children.get_mut(&ChildId(10)).unwrap().amount_cents = 250;
        tables.children.get_mut(&ChildId(11)).unwrap().amount_cents = 750;
        tables.dependents.get_mut(&DependentId(2)).unwrap().amount_cents = 40;
        let store = MemoryStore::new(tables);

        let mut session = store.begin().await.unwrap();
        for phase in AggregatePhase::ALL {
            session.recompute(phase, &[EntityId(1)]).await.unwrap();
        }
        session.commit().await.unwrap();

        let tables = store.snapshot().await;
        let aggregates = &tables.entities[&EntityId(1)].aggregates;
        assert_eq!(aggregates.total_amount_cents, 1000);
        assert_eq!(aggregates.latest_child_id, Some(ChildId(11)));
        assert_eq!(aggregates.category.as_deref(), Some("1"));
        assert_eq!(aggregates.dependent_count, 2);
        assert_eq!(aggregates.dependent_amount_cents, 40);
    }

    #[test]
    fn key_sql_binds_every_rule_value() {
        let (sql, binds) = correct_key_sql(&KeyRule::assistance_award());
        assert_eq!(
            binds,
            vec!["_", "ASST_AW", "-NONE-", "1", "awarding_sub_tier_agency_c", "uri", "2", "awarding_sub_tier_agency_c", "fain"]
        );
        assert!(sql.starts_with("CASE c.record_kind WHEN $4::text THEN concat_ws($1::text, $2::text"));
        assert!(sql.contains("COALESCE(c.source_fields ->> $9::text, $3::text), $3::text) END"));
    }
}
