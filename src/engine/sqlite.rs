use crate::engine::{CollectionSpec, StorageEngine, Transaction, TxMode};
use crate::error::{LatticeError, Result};
use crate::value::{Key, Record, Value};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed storage engine. One table per collection, records stored as
/// JSON text, unique fields enforced with `json_extract` expression indexes.
pub struct SqliteEngine {
    conn: Mutex<Connection>,
}

impl SqliteEngine {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<SqliteEngine> {
        let conn = Connection::open(path)?;
        Ok(SqliteEngine {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<SqliteEngine> {
        let conn = Connection::open_in_memory()?;
        Ok(SqliteEngine {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LatticeError::TransactionAborted("engine lock poisoned".into()))
    }
}

fn table(collection: &str) -> String {
    format!("\"rec_{collection}\"")
}

fn encode_record(record: &Record) -> String {
    Value::Object(record.clone()).to_json().to_string()
}

fn decode_record(raw: &str) -> Result<Record> {
    let json: serde_json::Value = serde_json::from_str(raw)?;
    match Value::from_json(&json) {
        Value::Object(record) => Ok(record),
        other => Err(LatticeError::Other(format!(
            "Stored row is not an object: {}",
            other.kind_name()
        ))),
    }
}

/// Constraint violations (primary key or unique index) become DuplicateKey.
fn write_error(collection: &str, key: &Key, err: rusqlite::Error) -> LatticeError {
    if let rusqlite::Error::SqliteFailure(f, _) = &err {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return LatticeError::DuplicateKey(format!("{collection}/{key}"));
        }
    }
    err.into()
}

impl StorageEngine for SqliteEngine {
    type Txn<'a>
        = SqliteTxn<'a>
    where
        Self: 'a;

    fn create_collections(&self, version: u32, specs: &[CollectionSpec]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS lattice_meta (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lattice_counters (
                collection TEXT PRIMARY KEY,
                next INTEGER NOT NULL
            );
            ",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO lattice_meta (name, value) VALUES ('version', ?1)",
            params![version.to_string()],
        )?;

        for spec in specs {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (k TEXT PRIMARY KEY, record TEXT NOT NULL)",
                table(&spec.name)
            ))?;
            if spec.auto_increment {
                conn.execute(
                    "INSERT OR IGNORE INTO lattice_counters (collection, next) VALUES (?1, 0)",
                    params![spec.name],
                )?;
            }
            for field in &spec.unique_fields {
                conn.execute_batch(&format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS \"uniq_{0}_{1}\" ON {2} \
                     (json_extract(record, '$.{1}')) \
                     WHERE json_extract(record, '$.{1}') IS NOT NULL",
                    spec.name,
                    field,
                    table(&spec.name)
                ))?;
            }
        }
        Ok(())
    }

    fn begin(&self, mode: TxMode) -> Result<SqliteTxn<'_>> {
        let conn = self.lock()?;
        conn.execute_batch(match mode {
            TxMode::ReadWrite => "BEGIN IMMEDIATE",
            TxMode::ReadOnly => "BEGIN",
        })?;
        Ok(SqliteTxn {
            conn,
            mode,
            open: true,
        })
    }
}

/// An open SQLite transaction; rolls back on drop unless committed.
pub struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    mode: TxMode,
    open: bool,
}

impl SqliteTxn<'_> {
    fn writable(&self) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(LatticeError::TransactionAborted(
                "write in read-only transaction".into(),
            ));
        }
        Ok(())
    }

    /// Keep the allocator ahead of explicitly-written integer keys.
    fn bump_counter(&self, collection: &str, key: &Key) -> Result<()> {
        if let Key::Int(n) = key {
            self.conn.execute(
                "UPDATE lattice_counters SET next = ?2 WHERE collection = ?1 AND next < ?2",
                params![collection, n],
            )?;
        }
        Ok(())
    }
}

impl Transaction for SqliteTxn<'_> {
    fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT record FROM {} WHERE k = ?1", table(collection)),
                params![key.encode()],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(decode_record).transpose()
    }

    fn scan(&self, collection: &str) -> Result<Vec<(Key, Record)>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT k, record FROM {}", table(collection)))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (raw_key, raw_record) = row?;
            match (Key::decode(&raw_key), decode_record(&raw_record)) {
                (Some(key), Ok(record)) => records.push((key, record)),
                _ => log::warn!("skipping undecodable row {collection}/{raw_key}"),
            }
        }
        // The key column encoding is not order-preserving.
        records.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(records)
    }

    fn insert(&mut self, collection: &str, key: &Key, record: Record) -> Result<()> {
        self.writable()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (k, record) VALUES (?1, ?2)",
                    table(collection)
                ),
                params![key.encode(), encode_record(&record)],
            )
            .map_err(|e| write_error(collection, key, e))?;
        self.bump_counter(collection, key)
    }

    fn put(&mut self, collection: &str, key: &Key, record: Record) -> Result<()> {
        self.writable()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (k, record) VALUES (?1, ?2) \
                     ON CONFLICT (k) DO UPDATE SET record = excluded.record",
                    table(collection)
                ),
                params![key.encode(), encode_record(&record)],
            )
            .map_err(|e| write_error(collection, key, e))?;
        self.bump_counter(collection, key)
    }

    fn delete(&mut self, collection: &str, key: &Key) -> Result<()> {
        self.writable()?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE k = ?1", table(collection)),
            params![key.encode()],
        )?;
        Ok(())
    }

    fn allocate_key(&mut self, collection: &str) -> Result<Key> {
        self.writable()?;
        let next: Option<i64> = self
            .conn
            .query_row(
                "UPDATE lattice_counters SET next = next + 1 WHERE collection = ?1 \
                 RETURNING next",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        next.map(Key::Int).ok_or_else(|| {
            LatticeError::Other(format!("Collection '{collection}' is not auto-increment"))
        })
    }

    fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
