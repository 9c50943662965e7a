use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    ListArgs, MetaContext, MetaError, MetaRow, MetaStore, MetaTable, apply_list_args, apply_patch,
    prepare_insert, row_id,
};

/// Per-operation call counts, for asserting on store traffic in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaStats {
    pub lists: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

type Partition = (MetaContext, MetaTable);

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<Partition, Vec<MetaRow>>,
    stats: MetaStats,
    delete_log: Vec<(MetaTable, String)>,
    sequence: u64,
}

/// Store that keeps rows in insertion order per (context, table).
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetaStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryMetaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, MetaError> {
        self.state
            .lock()
            .map_err(|_| MetaError::LockPoisoned("in-memory meta store"))
    }

    pub fn stats(&self) -> Result<MetaStats, MetaError> {
        Ok(self.lock()?.stats)
    }

    /// Every successful delete so far, oldest first.
    pub fn delete_log(&self) -> Result<Vec<(MetaTable, String)>, MetaError> {
        Ok(self.lock()?.delete_log.clone())
    }

    pub fn reset_stats(&self) -> Result<(), MetaError> {
        let mut state = self.lock()?;
        state.stats = MetaStats::default();
        state.delete_log.clear();
        Ok(())
    }
}

impl MetaStore for InMemoryMetaStore {
    fn meta_list(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        args: &ListArgs,
    ) -> Result<Vec<MetaRow>, MetaError> {
        let mut state = self.lock()?;
        state.stats.lists += 1;
        let rows = state
            .rows
            .get(&(ctx.clone(), table))
            .map(|rows| rows.to_vec())
            .unwrap_or_default();
        Ok(apply_list_args(rows, args))
    }

    fn meta_insert(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        row: MetaRow,
    ) -> Result<MetaRow, MetaError> {
        let mut state = self.lock()?;
        state.sequence += 1;
        let row = prepare_insert(table, row, state.sequence);
        let id = row_id(&row)?;
        let rows = state.rows.entry((ctx.clone(), table)).or_default();
        if rows.iter().any(|existing| existing.get("id") == row.get("id")) {
            return Err(MetaError::InvalidRow(format!("duplicate id {id} in {table}")));
        }
        rows.push(row.clone());
        state.stats.inserts += 1;
        Ok(row)
    }

    fn meta_update(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
        patch: &MetaRow,
    ) -> Result<Option<MetaRow>, MetaError> {
        let mut state = self.lock()?;
        state.stats.updates += 1;
        let updated = state
            .rows
            .get_mut(&(ctx.clone(), table))
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row.get("id").and_then(|v| v.as_str()) == Some(id))
            })
            .map(|row| {
                apply_patch(row, patch);
                row.clone()
            });
        Ok(updated)
    }

    fn meta_delete(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
    ) -> Result<bool, MetaError> {
        let mut state = self.lock()?;
        state.stats.deletes += 1;
        let removed = match state.rows.get_mut(&(ctx.clone(), table)) {
            Some(rows) => {
                let before = rows.len();
                rows.retain(|row| row.get("id").and_then(|v| v.as_str()) != Some(id));
                rows.len() != before
            }
            None => false,
        };
        if removed {
            state.delete_log.push((table, id.to_owned()));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::InMemoryMetaStore;
    use crate::{Condition, ListArgs, MetaContext, MetaRow, MetaStore, MetaTable, SortDirection};

    fn row(value: Value) -> MetaRow {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn insert_assigns_id_and_timestamps() {
        let store = InMemoryMetaStore::new();
        let ctx = MetaContext::new("ws1");
        let inserted = store
            .meta_insert(&ctx, MetaTable::FilterExp, row(json!({"fk_view_id": "vw1"})))
            .expect("insert");
        let id = inserted["id"].as_str().expect("id");
        assert!(id.starts_with("fi_"));
        assert!(inserted.contains_key("created_at"));
        assert_eq!(
            store
                .meta_get(&ctx, MetaTable::FilterExp, id)
                .expect("get")
                .map(|found| found["fk_view_id"].clone()),
            Some(json!("vw1"))
        );
    }

    #[test]
    fn contexts_are_isolated() {
        let store = InMemoryMetaStore::new();
        let ours = MetaContext::new("ws1").with_base("b1");
        let theirs = MetaContext::new("ws2");
        store
            .meta_insert(&ours, MetaTable::Views, row(json!({"id": "vw1"})))
            .expect("insert");
        assert!(store.meta_get(&theirs, MetaTable::Views, "vw1").expect("get").is_none());
        assert_eq!(
            store
                .meta_count(&ours, MetaTable::Views, &Condition::new())
                .expect("count"),
            1
        );
    }

    #[test]
    fn next_order_is_max_plus_one() {
        let store = InMemoryMetaStore::new();
        let ctx = MetaContext::default();
        let owner = Condition::new().where_eq("fk_view_id", "vw1");
        assert_eq!(
            store
                .meta_get_next_order(&ctx, MetaTable::FilterExp, &owner)
                .expect("order"),
            1.0
        );
        for order in [4, 2] {
            store
                .meta_insert(
                    &ctx,
                    MetaTable::FilterExp,
                    row(json!({"fk_view_id": "vw1", "order": order})),
                )
                .expect("insert");
        }
        assert_eq!(
            store
                .meta_get_next_order(&ctx, MetaTable::FilterExp, &owner)
                .expect("order"),
            5.0
        );
    }

    #[test]
    fn update_merges_and_delete_is_logged() {
        let store = InMemoryMetaStore::new();
        let ctx = MetaContext::default();
        store
            .meta_insert(&ctx, MetaTable::FilterExp, row(json!({"id": "fi1", "value": "a"})))
            .expect("insert");
        let updated = store
            .meta_update(&ctx, MetaTable::FilterExp, "fi1", &row(json!({"value": "b"})))
            .expect("update")
            .expect("row exists");
        assert_eq!(updated["value"], json!("b"));
        assert!(
            store
                .meta_update(&ctx, MetaTable::FilterExp, "nope", &row(json!({})))
                .expect("update")
                .is_none()
        );

        assert!(store.meta_delete(&ctx, MetaTable::FilterExp, "fi1").expect("delete"));
        assert!(!store.meta_delete(&ctx, MetaTable::FilterExp, "fi1").expect("delete"));
        assert_eq!(store.stats().expect("stats").deletes, 2);
        assert_eq!(
            store.delete_log().expect("log"),
            vec![(MetaTable::FilterExp, "fi1".to_owned())]
        );
        let listed = store
            .meta_list(
                &ctx,
                MetaTable::FilterExp,
                &ListArgs::default().order_by("order", SortDirection::Asc),
            )
            .expect("list");
        assert!(listed.is_empty());
    }
}
