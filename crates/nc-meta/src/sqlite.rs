use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::{
    ListArgs, MetaContext, MetaError, MetaRow, MetaStore, MetaTable, apply_list_args, apply_patch,
    prepare_insert, row_id,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nc_meta (
    workspace_id TEXT NOT NULL DEFAULT '',
    base_id      TEXT NOT NULL DEFAULT '',
    tbl          TEXT NOT NULL,
    id           TEXT NOT NULL,
    data         TEXT NOT NULL,
    PRIMARY KEY (workspace_id, base_id, tbl, id)
);
";

/// Store keeping every metadata table in one generic `nc_meta` table, rows
/// as JSON text. Listing filters and sorts in process.
#[derive(Debug)]
pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
    sequence: Mutex<u64>,
}

impl SqliteMetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MetaError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, MetaError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            sequence: Mutex::new(0),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MetaError> {
        self.conn
            .lock()
            .map_err(|_| MetaError::LockPoisoned("sqlite meta connection"))
    }

    fn next_sequence(&self) -> Result<u64, MetaError> {
        let mut sequence = self
            .sequence
            .lock()
            .map_err(|_| MetaError::LockPoisoned("sqlite meta sequence"))?;
        *sequence += 1;
        Ok(*sequence)
    }
}

fn base_key(ctx: &MetaContext) -> &str {
    ctx.base_id.as_deref().unwrap_or("")
}

fn parse_row(data: &str) -> Result<MetaRow, MetaError> {
    match serde_json::from_str(data)? {
        Value::Object(row) => Ok(row),
        other => Err(MetaError::InvalidRow(format!(
            "expected a JSON object, found {other}"
        ))),
    }
}

fn read_row(
    conn: &Connection,
    ctx: &MetaContext,
    table: MetaTable,
    id: &str,
) -> Result<Option<MetaRow>, MetaError> {
    conn.query_row(
        "SELECT data FROM nc_meta WHERE workspace_id = ?1 AND base_id = ?2 AND tbl = ?3 AND id = ?4",
        params![ctx.workspace_id, base_key(ctx), table.as_str(), id],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|data| parse_row(&data))
    .transpose()
}

impl MetaStore for SqliteMetaStore {
    fn meta_get(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
    ) -> Result<Option<MetaRow>, MetaError> {
        let conn = self.lock()?;
        read_row(&conn, ctx, table, id)
    }

    fn meta_list(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        args: &ListArgs,
    ) -> Result<Vec<MetaRow>, MetaError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM nc_meta WHERE workspace_id = ?1 AND base_id = ?2 AND tbl = ?3
             ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(
                params![ctx.workspace_id, base_key(ctx), table.as_str()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|data| parse_row(data))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(apply_list_args(rows, args))
    }

    fn meta_insert(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        row: MetaRow,
    ) -> Result<MetaRow, MetaError> {
        let row = prepare_insert(table, row, self.next_sequence()?);
        let id = row_id(&row)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO nc_meta (workspace_id, base_id, tbl, id, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ctx.workspace_id,
                base_key(ctx),
                table.as_str(),
                id,
                serde_json::to_string(&row)?
            ],
        )?;
        Ok(row)
    }

    fn meta_update(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
        patch: &MetaRow,
    ) -> Result<Option<MetaRow>, MetaError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(mut row) = read_row(&tx, ctx, table, id)? else {
            return Ok(None);
        };
        apply_patch(&mut row, patch);
        tx.execute(
            "UPDATE nc_meta SET data = ?5
             WHERE workspace_id = ?1 AND base_id = ?2 AND tbl = ?3 AND id = ?4",
            params![
                ctx.workspace_id,
                base_key(ctx),
                table.as_str(),
                id,
                serde_json::to_string(&row)?
            ],
        )?;
        tx.commit()?;
        Ok(Some(row))
    }

    fn meta_delete(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
    ) -> Result<bool, MetaError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM nc_meta WHERE workspace_id = ?1 AND base_id = ?2 AND tbl = ?3 AND id = ?4",
            params![ctx.workspace_id, base_key(ctx), table.as_str(), id],
        )?;
        Ok(removed > 0)
    }
}
