use crate::{prelude::*, PathLock};
use parking_lot::Mutex;
use std::{
  fs,
  io::{self, Read},
  path::{Path, PathBuf},
  time::{Duration, SystemTime},
};

const QUERY_PATH_INFO: &str =
  "select id, hash, registrationTime, deriver, narSize from ValidPaths where path = ?";

const QUERY_REFS: &str =
  "select path from Refs join ValidPaths on reference = id where referrer = ?";

const REGISTER_VALID: &str = "insert into ValidPaths (path, hash, registrationTime, deriver, \
                              narSize) values (?, ?, ?, ?, ?)";

const ADD_REF: &str = "insert or ignore into Refs (referrer, reference) select ?, id from \
                       ValidPaths where path = ?";

/// A store on the local filesystem:
///
/// ```text
/// <root>/store/<hash>-<name>        objects
/// <root>/var/db/db.sqlite           index of valid paths and references
/// <root>/var/log/<hash>-<name>.log  build logs
/// <root>/var/gcroots/<name>         garbage collector roots
/// <root>/var/locks                  per-path locks
/// <root>/var/tmp                    staging
/// ```
pub struct LocalStore {
  root: PathBuf,
  store: PathBuf,
  db: Sqlite,
  // serializes the check-then-rename of a commit within this process
  commit: Mutex<()>,
}

impl LocalStore {
  pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
    let root = root.as_ref();
    fs::create_dir_all(root)
      .with_context(|| format!("while creating store root `{}'", root.display()))?;
    let root = root.canonicalize()?;
    let store = root.join("store");

    for dir in [
      store.clone(),
      root.join("var/db"),
      root.join("var/log"),
      root.join("var/gcroots"),
      root.join("var/locks"),
      root.join("var/tmp"),
    ] {
      fs::create_dir_all(&dir)?;
    }

    let db = Sqlite::open(root.join("var/db/db.sqlite"))?;
    db.migrate(include_str!("schema.sql"))?;

    debug!("opened store"; "root" => %root.display());

    Ok(Self {
      root,
      store,
      db,
      commit: Mutex::new(()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn roots_dir(&self) -> PathBuf {
    self.root.join("var/gcroots")
  }

  /// Moves the finished tree at `staged` to its place in the store and
  /// registers it. If another writer got there first, `staged` is discarded.
  fn commit(&self, info: StoreObject, staged: &Path) -> Result<StoreObject> {
    let _guard = self.commit.lock();
    if let Some(existing) = self.query_path_info(&info.path)? {
      debug!("path already valid, discarding new copy"; "path" => %info.path);
      return Ok(existing);
    }
    let real_path = self.to_real_path(&info.path);
    rm_rf::ensure_removed(&real_path)?;
    fs::rename(staged, &real_path).with_context(|| {
      format!(
        "while moving `{}' into the store",
        self.print_store_path(&info.path)
      )
    })?;
    self.register_valid_path(info)
  }
}

impl Store for LocalStore {
  fn store_path(&self) -> &Path {
    &self.store
  }

  fn query_path_info(&self, path: &StorePath) -> Result<Option<StoreObject>> {
    let db = self.db.lock();

    let mut stmt = db.prepare_cached(QUERY_PATH_INFO)?;

    let mut iter = stmt.query_and_then::<_, anyhow::Error, _, _>(
      params![self.print_store_path(path)],
      |row| {
        let hash = Hash::decode(row.get::<_, String>("hash")?).with_context(|| {
          format!(
            "path-info entry for `{}' is invalid",
            self.print_store_path(path)
          )
        })?;

        let producer = match row.get::<_, Option<String>>("deriver")? {
          Some(id) => Producer::Derivation(DrvId::parse(&id)?),
          None => Producer::Fetched,
        };

        let mut info = StoreObject::new(
          path.clone(),
          hash,
          row.get::<_, i64>("narSize")? as u64,
          producer,
        );
        info.id = row.get::<_, i64>("id")?;
        info.registration_time = Some(
          SystemTime::UNIX_EPOCH
            + Duration::from_secs(row.get::<_, i64>("registrationTime")? as u64),
        );

        Ok(info)
      },
    )?;

    if let Some(mut info) = iter.next().transpose()? {
      let mut stmt = db.prepare_cached(QUERY_REFS)?;

      for ref_ in stmt.query_and_then(params![info.id], |row| row.get::<_, String>("path"))? {
        info.refs.insert(self.parse_store_path(Path::new(&ref_?))?);
      }

      Ok(Some(info))
    } else {
      Ok(None)
    }
  }

  fn valid_paths(&self) -> Result<StorePathSet> {
    let db = self.db.lock();
    let mut stmt = db.prepare_cached("select path from ValidPaths")?;
    let mut paths = StorePathSet::new();
    for p in stmt.query_and_then(params![], |row| row.get::<_, String>("path"))? {
      paths.insert(self.parse_store_path(Path::new(&p?))?);
    }
    Ok(paths)
  }

  fn lock_path(&self, path: &StorePath) -> Result<PathLock> {
    PathLock::lock(self.root.join("var/locks").join(format!("{}.lock", path)))
  }

  fn add_to_store(&self, info: StoreObject, source: &mut dyn Read) -> Result<StoreObject> {
    if let Some(existing) = self.query_path_info(&info.path)? {
      return Ok(existing);
    }

    let _lock = self.lock_path(&info.path)?;
    let staging = self.temp_dir()?;
    let dump_to = staging.path().join("x");

    let mut nar_hasher = HashSink::hasher(HashType::SHA256);
    let combined = tee_readwrite::TeeReader::new(source, &mut nar_hasher, false);
    nar::restore_path(&dump_to, combined)?;

    let (_, hash_result, hash_len) = nar_hasher.finish();

    if hash_result != info.nar_hash {
      bail!(
        "hash mismatch while importing path `{}';\n  specified: {}\n  got:       {}",
        self.print_store_path(&info.path),
        info.nar_hash,
        hash_result
      );
    }

    if hash_len as u64 != info.nar_size {
      bail!(
        "size mismatch while importing path `{}';\n  specified: {}\n  got:       {}",
        self.print_store_path(&info.path),
        info.nar_size,
        hash_len
      );
    }

    self.commit(info, &dump_to)
  }

  fn register_valid_path(&self, info: StoreObject) -> Result<StoreObject> {
    let path = self.print_store_path(&info.path);
    {
      let mut db = self.db.lock();
      let tx = db.transaction()?;

      let existing = tx
        .query_row::<i64, _, _>(
          "select id from ValidPaths where path = ?",
          params![&path],
          |r| r.get("id"),
        )
        .optional()?;

      if existing.is_none() {
        let deriver = match &info.producer {
          Producer::Derivation(id) => Some(id.to_string()),
          Producer::Fetched => None,
        };
        tx.execute(
          REGISTER_VALID,
          params![
            path,
            info.nar_hash.encode_with_type(Encoding::Base16),
            info.registration_time_sql(),
            deriver,
            info.nar_size as i64,
          ],
        )?;
        let id = tx.last_insert_rowid();
        for r in &info.refs {
          let n = tx.execute(ADD_REF, params![id, self.print_store_path(r)])?;
          ensure!(
            n == 1,
            "reference `{}' of `{}' is not a valid path",
            self.print_store_path(r),
            path
          );
        }
        tx.commit()?;
        info!("registered path"; "path" => %path);
      }
    }

    self
      .query_path_info(&info.path)?
      .ok_or_else(|| anyhow!("path `{}' vanished after registration", path))
  }

  fn delete_path(&self, path: &StorePath) -> Result<()> {
    let _lock = self.lock_path(path)?;
    self.db.lock().execute(
      "delete from ValidPaths where path = ?",
      params![self.print_store_path(path)],
    )?;
    let real_path = self.to_real_path(path);
    make_writable(&real_path)?;
    rm_rf::ensure_removed(&real_path)?;
    let _ = fs::remove_file(self.build_log_path(path));
    Ok(())
  }

  fn temp_dir(&self) -> Result<tempfile::TempDir> {
    Ok(
      tempfile::Builder::new()
        .prefix("envix-")
        .tempdir_in(self.root.join("var/tmp"))?,
    )
  }

  fn build_log_path(&self, path: &StorePath) -> PathBuf {
    self.root.join("var/log").join(format!("{}.log", path))
  }

  fn add_root(&self, name: &str, paths: &StorePathSet) -> Result<()> {
    ensure!(
      !name.is_empty() && !name.contains('/') && !name.starts_with('.'),
      "invalid root name `{}'",
      name
    );
    let mut text = String::new();
    for p in paths {
      text.push_str(&self.print_store_path(p));
      text.push('\n');
    }
    let tmp = tempfile::NamedTempFile::new_in(self.roots_dir())?;
    fs::write(tmp.path(), text)?;
    tmp
      .persist(self.roots_dir().join(name))
      .map_err(|e| e.error)?;
    debug!("added gc root"; "name" => name, "paths" => paths.len());
    Ok(())
  }

  fn remove_root(&self, name: &str) -> Result<()> {
    match fs::remove_file(self.roots_dir().join(name)) {
      Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
      _ => Ok(()),
    }
  }

  fn roots(&self) -> Result<StorePathSet> {
    let mut roots = StorePathSet::new();
    for entry in fs::read_dir(self.roots_dir())? {
      let entry = entry?;
      if entry.file_name().to_string_lossy().starts_with('.') {
        continue;
      }
      for line in fs::read_to_string(entry.path())?.lines() {
        match self.parse_store_path(Path::new(line)) {
          Ok(p) => {
            roots.insert(p);
          }
          Err(e) => warn!("ignoring invalid gc root entry";
            "root" => %entry.path().display(), "error" => %e),
        }
      }
    }
    Ok(roots)
  }
}

/// Objects keep read-only files; their directories must be writable again
/// before they can be removed.
fn make_writable(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;

  let meta = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e.into()),
  };
  if meta.is_dir() {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    for entry in fs::read_dir(path)? {
      make_writable(&entry?.path())?;
    }
  }
  Ok(())
}
