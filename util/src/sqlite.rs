use crate::*;
use parking_lot::Mutex;
use rusqlite::Connection;
use slog::{Drain, Level};
use std::{path::Path, time::Duration};

/// A single connection shared between threads.
#[derive(Deref)]
pub struct Sqlite(Mutex<Connection>);

impl Sqlite {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let mut conn = Connection::open(path)
      .with_context(|| format!("while opening database `{}'", path.display()))?;

    // other processes may hold the store database
    conn.busy_timeout(Duration::from_secs(60))?;

    if slog_scope::logger().is_enabled(Level::Trace) {
      conn.trace(Some(|stmt| trace!("sqlite: {}", stmt.trim_start())));
    }

    Ok(Self(Mutex::new(conn)))
  }

  /// Applies `schema`, which must be idempotent (`create … if not exists`).
  pub fn migrate(&self, schema: &str) -> Result<()> {
    self
      .lock()
      .execute_batch(schema)
      .context("while applying database schema")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrate_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Sqlite::open(tmp.path().join("db.sqlite")).unwrap();
    let schema = "create table if not exists Kv (k text primary key, v text not null);";
    db.migrate(schema).unwrap();
    db.migrate(schema).unwrap();

    db.lock()
      .execute("insert into Kv (k, v) values (?, ?)", params!["a", "1"])
      .unwrap();
    let v: Option<String> = db
      .lock()
      .query_row("select v from Kv where k = ?", params!["a"], |r| r.get(0))
      .optional()
      .unwrap();
    assert_eq!(v.as_deref(), Some("1"));
  }
}
