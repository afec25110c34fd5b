//! Storage layer for tally.
//!
//! Persists tenant records in SQLite using `rusqlite` and serves them back as
//! a [`RecordSource`].
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` can be moved between threads but not shared without external
//! synchronization such as a `Mutex<Database>`.
//!
//! # Schema
//!
//! Every compiled model maps to its own table named after the model's
//! collection (`tenant_{tenant}_{schema}s`). Collection tables hold one row per
//! record:
//!
//! - `id`: insertion-ordered row ID, exposed to readers as `_id`
//! - `data`: the raw record as a JSON object
//! - `created_at`: insertion time, exposed to readers as `createdAt`
//!
//! The `collections` table catalogues which collection tables exist and which
//! (schema, tenant) pair each belongs to.
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 format with a `Z` suffix
//! (e.g., `2024-01-15T10:30:00Z`), so lexicographic order matches
//! chronological order.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use tally_core::inference::RESERVED_FIELDS;
use tally_core::{CompiledModel, RawRecord, RecordQuery, RecordSource};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored record is not a JSON object.
    #[error("invalid record {id} in {collection}")]
    InvalidRecord {
        collection: String,
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    /// A record could not be serialized for storage.
    #[error("failed to encode record for {collection}")]
    Encode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A catalogued collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub name: String,
    pub schema: String,
    pub tenant: String,
    pub created_at: String,
    pub records: usize,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The catalogue table is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the catalogue table.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            -- collections: one row per tenant collection table
            -- name: compared like SQLite table names (case-insensitive)
            -- created_at: RFC 3339 (e.g., '2024-01-15T10:30:00Z')
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY COLLATE NOCASE,
                schema TEXT NOT NULL,
                tenant TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_collections_tenant ON collections(tenant);
            ",
        )?;
        Ok(())
    }

    /// Creates the collection table for a model if it does not exist yet.
    pub fn ensure_collection(&self, model: &CompiledModel) -> Result<(), DbError> {
        ensure_collection_at(&self.conn, model, Utc::now())
    }

    /// Appends raw records to a model's collection in one transaction.
    ///
    /// Storage-owned fields (`_id`, `createdAt`, ...) in the input are dropped.
    pub fn insert_records(
        &mut self,
        model: &CompiledModel,
        records: &[RawRecord],
    ) -> Result<usize, DbError> {
        self.insert_records_at(model, records, Utc::now())
    }

    /// Like [`Database::insert_records`] with an explicit insertion time.
    pub fn insert_records_at(
        &mut self,
        model: &CompiledModel,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let created_at = format_timestamp(now);
        let tx = self.conn.transaction()?;
        ensure_collection_at(&tx, model, now)?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (data, created_at) VALUES (?, ?)",
                quote_ident(&model.collection)
            ))?;
            for record in records {
                let mut stored = record.clone();
                stored.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));
                let data = serde_json::to_string(&stored).map_err(|source| DbError::Encode {
                    collection: model.collection.clone(),
                    source,
                })?;
                inserted += stmt.execute(params![data, created_at])?;
            }
        }
        tx.commit()?;
        tracing::debug!(collection = %model.collection, inserted, "inserted records");
        Ok(inserted)
    }

    /// Number of records stored for a model. Zero if nothing was ever stored.
    pub fn count(&self, model: &CompiledModel) -> Result<usize, DbError> {
        if !self.collection_exists(&model.collection)? {
            return Ok(0);
        }
        self.count_table(&model.collection)
    }

    /// Lists catalogued collections ordered by tenant then name.
    pub fn list_collections(&self) -> Result<Vec<CollectionRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name, schema, tenant, created_at
            FROM collections
            ORDER BY tenant ASC, name ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut collections = Vec::new();
        for row in rows {
            let (name, schema, tenant, created_at) = row?;
            let records = self.count_table(&name)?;
            collections.push(CollectionRecord {
                name,
                schema,
                tenant,
                created_at,
                records,
            });
        }
        Ok(collections)
    }

    fn collection_exists(&self, name: &str) -> Result<bool, DbError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count_table(&self, name: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl RecordSource for Database {
    type Error = DbError;

    /// Returns stored records in insertion order.
    ///
    /// Each record carries its row ID as `_id` and its insertion time as
    /// `createdAt`. A collection that was never written yields no records.
    fn fetch(&self, model: &CompiledModel, query: &RecordQuery) -> Result<Vec<RawRecord>, DbError> {
        if !self.collection_exists(&model.collection)? {
            tracing::debug!(collection = %model.collection, "collection not created yet");
            return Ok(Vec::new());
        }
        // SQLite treats a negative LIMIT as unbounded.
        let limit = query.limit.map_or(-1, to_sql_int);
        let offset = query.offset.map_or(0, to_sql_int);
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT id, data, created_at
            FROM {}
            ORDER BY id ASC
            LIMIT ? OFFSET ?
            ",
            quote_ident(&model.collection)
        ))?;
        let rows = stmt.query_map(params![limit, offset], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, data, created_at) = row?;
            let mut record: RawRecord =
                serde_json::from_str(&data).map_err(|source| DbError::InvalidRecord {
                    collection: model.collection.clone(),
                    id,
                    source,
                })?;
            record.insert("_id".to_string(), id.to_string().into());
            record.insert("createdAt".to_string(), created_at.into());
            records.push(record);
        }
        tracing::debug!(collection = %model.collection, fetched = records.len(), "fetched records");
        Ok(records)
    }
}

fn ensure_collection_at(
    conn: &Connection,
    model: &CompiledModel,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        ",
        quote_ident(&model.collection)
    ))?;
    conn.execute(
        "
        INSERT OR IGNORE INTO collections (name, schema, tenant, created_at)
        VALUES (?, ?, ?, ?)
        ",
        params![
            model.collection,
            model.schema.as_str(),
            model.tenant.as_str(),
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}
