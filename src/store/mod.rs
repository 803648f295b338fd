//! Append-only time-series store backed by SQLite.
//!
//! One table per logical measurement run. Tables start with an auto-incrementing
//! `id` and a write-time `timestamp`; every other column is created lazily the first
//! time a parameter name shows up in [`TimeSeriesStore::add_result`]. Columns are only
//! ever added, never dropped or renamed.
//!
//! # Concurrency
//!
//! Each calling thread gets its own connection (keyed by [`std::thread::ThreadId`]),
//! and every statement commits immediately. Independent pollers writing to different
//! tables, and the chart reading them, therefore never share a connection or hold a
//! long-lived transaction. The database runs in WAL mode with a busy timeout so
//! readers do not block the writers.
//!
//! Poll threads should call [`TimeSeriesStore::release_thread_connection`] before they
//! exit so the per-thread map does not grow over a long session.

mod columnar;

pub use columnar::{CellValue, ColumnarData};

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, ToSql};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::core::{DataPoint, ID_COLUMN, TIMESTAMP_COLUMN};
use crate::error::{AppResult, ConsoleError};

type SharedConnection = Arc<Mutex<Connection>>;

/// File-backed, dynamically schematized run store.
pub struct TimeSeriesStore {
    path: PathBuf,
    busy_timeout: Duration,
    connections: DashMap<ThreadId, SharedConnection>,
    /// Columns known to exist per table. Only grows, like the schema itself.
    known_columns: DashMap<String, HashSet<String>>,
    /// Serializes table registration so two callers cannot resolve the same name.
    registration: Mutex<()>,
}

impl TimeSeriesStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::open_with_timeout(path, Duration::from_secs(5))
    }

    /// Open the database named by `config`.
    pub fn from_config(config: &StorageConfig) -> AppResult<Self> {
        Self::open_with_timeout(&config.database_path, config.busy_timeout())
    }

    /// Open `path` with a custom busy timeout.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            path,
            busy_timeout,
            connections: DashMap::new(),
            known_columns: DashMap::new(),
            registration: Mutex::new(()),
        };
        // Open eagerly so the file exists (the change watcher stats it) and bad paths
        // fail here rather than on a poll thread.
        store.thread_connection()?;
        info!("Opened time-series store at {}", store.path.display());
        Ok(store)
    }

    /// Backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn thread_connection(&self) -> AppResult<SharedConnection> {
        let id = thread::current().id();
        if let Some(conn) = self.connections.get(&id) {
            return Ok(conn.clone());
        }

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        debug!(thread = ?id, "Opened store connection");

        let conn = Arc::new(Mutex::new(conn));
        self.connections.insert(id, conn.clone());
        Ok(conn)
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> AppResult<T> {
        let handle = self.thread_connection()?;
        let conn = handle.lock();
        Ok(f(&conn)?)
    }

    /// Drop the calling thread's connection.
    pub fn release_thread_connection(&self) {
        if self.connections.remove(&thread::current().id()).is_some() {
            debug!("Released store connection");
        }
    }

    /// Number of threads currently holding a connection.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Names of all run tables, sorted.
    pub fn get_tables(&self) -> AppResult<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            names.collect()
        })
    }

    /// Create a new run table and return its resolved name.
    ///
    /// If `name` is already taken the table is registered as `name_<n>` with the
    /// smallest unused `n >= 1`. An existing table is never reused.
    pub fn register_table(&self, name: &str) -> AppResult<String> {
        let _guard = self.registration.lock();

        let tables = self.get_tables()?;
        let resolved = resolve_table_name(name, &tables);
        let sql = format!(
            "CREATE TABLE {} (\
                {ID_COLUMN} INTEGER PRIMARY KEY AUTOINCREMENT, \
                {TIMESTAMP_COLUMN} TIMESTAMP NOT NULL \
                    DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))\
             )",
            quote_ident(&resolved)?
        );
        self.with_connection(|conn| conn.execute_batch(&sql))?;

        self.known_columns.insert(
            table_key(&resolved),
            [ID_COLUMN.to_string(), TIMESTAMP_COLUMN.to_string()]
                .into_iter()
                .collect(),
        );
        info!(requested = name, table = %resolved, "Registered run table");
        Ok(resolved)
    }

    /// Current column names of `table` in declaration order.
    pub fn get_columns(&self, table: &str) -> AppResult<Vec<String>> {
        let columns = self.with_connection(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
            let names = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
            names.collect::<rusqlite::Result<Vec<String>>>()
        })?;

        if columns.is_empty() {
            return Err(ConsoleError::UnknownTable(table.to_string()));
        }
        Ok(columns)
    }

    /// Add any missing columns for `names`. Adding a present column is a no-op.
    ///
    /// SQLite matches identifiers case-insensitively, so a name that differs from an
    /// existing column only in case is rejected instead of sharing that column.
    fn ensure_columns<'a>(
        &self,
        table: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) -> AppResult<()> {
        let key = table_key(table);
        if !self.known_columns.contains_key(&key) {
            let existing = self.get_columns(table)?;
            self.known_columns.entry(key.clone()).or_default().extend(existing);
        }

        let missing: Vec<&str> = {
            let known = self
                .known_columns
                .get(&key)
                .ok_or_else(|| ConsoleError::UnknownTable(table.to_string()))?;
            let mut missing = Vec::new();
            for name in names {
                match known.iter().find(|k| k.eq_ignore_ascii_case(name)) {
                    Some(existing) if existing == name => {}
                    Some(existing) => return Err(case_collision(name, existing)),
                    None => missing.push(name),
                }
            }
            missing
        };

        for name in missing {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} NUMERIC",
                quote_ident(table)?,
                quote_ident(name)?
            );
            match self.with_connection(|conn| conn.execute_batch(&sql)) {
                Ok(()) => info!(table, column = name, "Added column"),
                // Another thread or process got there first, possibly with other casing.
                Err(ConsoleError::Storage(e)) if e.to_string().contains("duplicate column") => {
                    let columns = self.get_columns(table)?;
                    self.known_columns
                        .entry(key.clone())
                        .or_default()
                        .extend(columns.iter().cloned());
                    match columns.iter().find(|c| c.eq_ignore_ascii_case(name)) {
                        Some(existing) if existing != name => {
                            return Err(case_collision(name, existing));
                        }
                        _ => debug!(table, column = name, "Column already present"),
                    }
                }
                Err(e) => return Err(e),
            }
            self.known_columns
                .entry(key.clone())
                .or_default()
                .insert(name.to_string());
        }
        Ok(())
    }

    /// Append one row holding every point in `points`.
    ///
    /// Columns for unseen parameter names are added first. If a name appears more
    /// than once the last value wins. Columns not mentioned stay `NULL` for this row.
    pub fn add_result(&self, table: &str, points: &[DataPoint]) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut row: Vec<(&str, f64)> = Vec::with_capacity(points.len());
        for point in points {
            let name = point.parameter.as_str();
            if name.eq_ignore_ascii_case(ID_COLUMN) || name.eq_ignore_ascii_case(TIMESTAMP_COLUMN) {
                return Err(ConsoleError::InvalidIdentifier(point.parameter.clone()));
            }
            match row.iter_mut().find(|(seen, _)| seen.eq_ignore_ascii_case(name)) {
                Some(slot) if slot.0 == name => slot.1 = point.value,
                Some(slot) => return Err(case_collision(name, slot.0)),
                None => row.push((name, point.value)),
            }
        }

        self.ensure_columns(table, row.iter().map(|(name, _)| *name))?;

        let columns = row
            .iter()
            .map(|(name, _)| quote_ident(name))
            .collect::<AppResult<Vec<_>>>()?
            .join(", ");
        let placeholders = (1..=row.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_ident(table)?
        );

        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params_from_iter(row.iter().map(|(_, value)| *value)))?;
            Ok(())
        })
    }

    /// The most recent `n` rows, oldest first.
    pub fn get_tail_values(&self, table: &str, n: usize) -> AppResult<ColumnarData> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {ID_COLUMN} DESC LIMIT ?1",
            quote_ident(table)?
        );
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let mut data = self.query_columnar(table, &sql, &[&limit])?;
        data.reverse_rows();
        Ok(data)
    }

    /// Every row of `table`, oldest first.
    pub fn get_table_values(&self, table: &str) -> AppResult<ColumnarData> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {ID_COLUMN}",
            quote_ident(table)?
        );
        self.query_columnar(table, &sql, &[])
    }

    /// All values of one column, or `None` when the column does not exist.
    pub fn get_column_values(
        &self,
        table: &str,
        column: &str,
    ) -> AppResult<Option<Vec<CellValue>>> {
        if !self.get_columns(table)?.iter().any(|c| c == column) {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {ID_COLUMN}",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let data = self.query_columnar(table, &sql, &[])?;
        Ok(data.into_columns().next().map(|(_, values)| values))
    }

    fn query_columnar(
        &self,
        table: &str,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> AppResult<ColumnarData> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut data = ColumnarData::new(columns);

            let mut rows = stmt.query(params)?;
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(width);
                for i in 0..width {
                    cells.push(CellValue::from(row.get_ref(i)?));
                }
                data.push_row(cells);
            }
            Ok(data)
        })
        .map_err(|e| match e {
            ConsoleError::Storage(err) if err.to_string().contains("no such table") => {
                ConsoleError::UnknownTable(table.to_string())
            }
            other => other,
        })
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
fn quote_ident(name: &str) -> AppResult<String> {
    if name.trim().is_empty() {
        return Err(ConsoleError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `name` if free, otherwise `name_<n>` for the smallest unused `n >= 1`.
///
/// Names are compared the way SQLite compares identifiers, ignoring ASCII case.
fn resolve_table_name(name: &str, existing: &[String]) -> String {
    let mut base_taken = false;
    let mut used = BTreeSet::new();

    for table in existing {
        if table.eq_ignore_ascii_case(name) {
            base_taken = true;
            continue;
        }
        let suffix = table
            .get(..name.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(name))
            .and_then(|_| table.get(name.len()..))
            .and_then(|rest| rest.strip_prefix('_'));
        if let Some(n) = suffix.and_then(|s| s.parse::<u64>().ok()) {
            used.insert(n);
        }
    }

    if !base_taken {
        return name.to_string();
    }
    let n = (1..).find(|n| !used.contains(n)).unwrap_or(1);
    format!("{name}_{n}")
}

/// Cache key for a table, folded the way SQLite folds identifiers.
fn table_key(table: &str) -> String {
    table.to_ascii_lowercase()
}

fn case_collision(name: &str, existing: &str) -> ConsoleError {
    ConsoleError::InvalidIdentifier(format!("{name} (clashes with column {existing})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, TimeSeriesStore) {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn resolve_picks_smallest_free_suffix() {
        let existing = vec!["T".to_string(), "T_1".to_string(), "T_3".to_string()];
        assert_eq!(resolve_table_name("T", &existing), "T_2");
        assert_eq!(resolve_table_name("U", &existing), "U");
        assert_eq!(resolve_table_name("T_1", &existing), "T_1_1");
    }

    #[test]
    fn table_names_differing_only_in_case_are_disambiguated() {
        let existing = vec!["run".to_string(), "Run_1".to_string()];
        assert_eq!(resolve_table_name("RUN", &existing), "RUN_2");

        let (_dir, store) = open_temp();
        assert_eq!(store.register_table("run").unwrap(), "run");
        assert_eq!(store.register_table("RUN").unwrap(), "RUN_1");
        assert_eq!(store.get_tables().unwrap().len(), 2);
    }

    #[test]
    fn columns_differing_only_in_case_are_not_merged() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        store.add_result(&table, &[DataPoint::new("X", 1.0)]).unwrap();

        assert!(matches!(
            store.add_result(&table, &[DataPoint::new("x", 2.0)]),
            Err(ConsoleError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            store.add_result(&table, &[DataPoint::new("y", 1.0), DataPoint::new("Y", 2.0)]),
            Err(ConsoleError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            store.add_result(&table, &[DataPoint::new("ID", 1.0)]),
            Err(ConsoleError::InvalidIdentifier(_))
        ));

        let values = store.get_column_values(&table, "X").unwrap().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].as_f64(), Some(1.0));
        assert_eq!(store.get_columns(&table).unwrap(), vec!["id", "timestamp", "X"]);
    }

    #[test]
    fn case_clash_from_another_handle_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let first = TimeSeriesStore::open(&path).unwrap();
        let second = TimeSeriesStore::open(&path).unwrap();
        let table = first.register_table("T").unwrap();
        // Prime the second handle's column cache before the other column exists.
        second.add_result(&table, &[DataPoint::new("a", 0.0)]).unwrap();

        first.add_result(&table, &[DataPoint::new("Field", 1.0)]).unwrap();
        assert!(matches!(
            second.add_result(&table, &[DataPoint::new("field", 2.0)]),
            Err(ConsoleError::InvalidIdentifier(_))
        ));
        assert_eq!(second.get_table_values(&table).unwrap().len(), 2);
        assert_eq!(
            second.get_columns(&table).unwrap(),
            vec!["id", "timestamp", "a", "Field"]
        );
    }

    #[test]
    fn repeated_registration_never_reuses_a_table() {
        let (_dir, store) = open_temp();
        let names: Vec<String> = (0..4).map(|_| store.register_table("sweep").unwrap()).collect();
        assert_eq!(names, vec!["sweep", "sweep_1", "sweep_2", "sweep_3"]);
        assert_eq!(store.get_tables().unwrap().len(), 4);
    }

    #[test]
    fn quoting_allows_awkward_names() {
        let (_dir, store) = open_temp();
        let table = store.register_table("run \"a\"").unwrap();
        store
            .add_result(&table, &[DataPoint::new("k2450 sense.current", 1e-6)])
            .unwrap();
        let columns = store.get_columns(&table).unwrap();
        assert_eq!(columns.last().unwrap(), "k2450 sense.current");
    }

    #[test]
    fn schema_growth_is_idempotent() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        store.add_result(&table, &[DataPoint::new("x", 1.0)]).unwrap();
        store.add_result(&table, &[DataPoint::new("x", 2.0)]).unwrap();
        store
            .add_result(&table, &[DataPoint::new("x", 3.0), DataPoint::new("y", 4.0)])
            .unwrap();
        assert_eq!(store.get_columns(&table).unwrap(), vec!["id", "timestamp", "x", "y"]);
    }

    #[test]
    fn end_to_end_two_rows() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        assert_eq!(table, "T");
        store.add_result("T", &[DataPoint::new("paramX", 1.0)]).unwrap();
        store
            .add_result(
                "T",
                &[DataPoint::new("paramX", 2.0), DataPoint::new("paramY", 5.0)],
            )
            .unwrap();

        let all = store.get_table_values("T").unwrap();
        assert_eq!(all.columns(), &["id", "timestamp", "paramX", "paramY"]);
        assert_eq!(all.ids(), vec![1, 2]);
        assert_eq!(all.column("timestamp").unwrap().len(), 2);
        let x: Vec<Option<f64>> = all.column("paramX").unwrap().iter().map(CellValue::as_f64).collect();
        let y: Vec<Option<f64>> = all.column("paramY").unwrap().iter().map(CellValue::as_f64).collect();
        assert_eq!(x, vec![Some(1.0), Some(2.0)]);
        assert_eq!(y, vec![None, Some(5.0)]);

        let tail = store.get_tail_values("T", 1).unwrap();
        assert_eq!(tail.ids(), vec![2]);
        assert_eq!(tail.column("paramY").unwrap()[0].as_f64(), Some(5.0));
    }

    #[test]
    fn tail_is_oldest_first() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        for i in 0..10 {
            store.add_result(&table, &[DataPoint::new("v", i as f64)]).unwrap();
        }
        let tail = store.get_tail_values(&table, 3).unwrap();
        assert_eq!(tail.ids(), vec![8, 9, 10]);
        assert_eq!(store.get_tail_values(&table, 100).unwrap().len(), 10);
    }

    #[test]
    fn duplicate_names_in_one_call_keep_last_value() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        store
            .add_result(&table, &[DataPoint::new("v", 1.0), DataPoint::new("v", 7.0)])
            .unwrap();
        let values = store.get_column_values(&table, "v").unwrap().unwrap();
        assert_eq!(values[0].as_f64(), Some(7.0));
    }

    #[test]
    fn reserved_and_unknown_names_are_rejected() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        assert!(matches!(
            store.add_result(&table, &[DataPoint::new("id", 1.0)]),
            Err(ConsoleError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            store.add_result("missing", &[DataPoint::new("v", 1.0)]),
            Err(ConsoleError::UnknownTable(_))
        ));
        assert!(matches!(
            store.get_tail_values("missing", 1),
            Err(ConsoleError::UnknownTable(_))
        ));
        assert!(store.get_column_values(&table, "nope").unwrap().is_none());
    }

    #[test]
    fn empty_points_are_a_no_op() {
        let (_dir, store) = open_temp();
        let table = store.register_table("T").unwrap();
        store.add_result(&table, &[]).unwrap();
        assert!(store.get_table_values(&table).unwrap().is_empty());
    }

    #[test]
    fn concurrent_writers_on_separate_tables() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);
        let tables: Vec<String> = (0..4)
            .map(|i| store.register_table(&format!("run{i}")).unwrap())
            .collect();

        let handles: Vec<_> = tables
            .iter()
            .cloned()
            .map(|table| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .add_result(&table, &[DataPoint::new("v", i as f64)])
                            .unwrap();
                    }
                    store.release_thread_connection();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for table in &tables {
            let ids = store.get_table_values(table).unwrap().ids();
            assert_eq!(ids.len(), 50);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
