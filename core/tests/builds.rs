mod common;

use common::{files, nar_of, sh, write_registry, Fixture, HOST};
use envix_core::{BuildMode, Engine, Settings};
use envix_util::{Cancel, Encoding, Error, Hash, HashType};
use serde_json::json;
use std::{fs, thread, time::Duration};

#[test]
fn test_cycle_fails_before_any_build() {
  let fx = Fixture::new(json!({
    "fine": files(json!({"ok": {"text": "ok"}})),
    "a": sh("echo a > $out", &["b"]),
    "b": sh("echo b > $out", &["c"]),
    "c": sh("echo c > $out", &["a"]),
  }));
  let engine = fx.engine();
  let request = fx.request(HOST, &["fine", "a"]);

  let e = engine.compose(&request, &Cancel::new()).unwrap_err();
  match Error::find(&e) {
    Some(Error::CyclicDependency { cycle }) => {
      assert_eq!(cycle.first(), cycle.last());
      assert_eq!(cycle.len(), 4);
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(engine.builder().builds_started(), 0);

  let set = engine.evaluate(&request, &Cancel::new()).unwrap();
  let fine = set.get("fine").unwrap();
  assert!(!engine.store().is_valid_path(fine.out_path()).unwrap());
}

#[test]
fn test_shared_dependency_is_built_once() {
  let fx = Fixture::new(json!({
    "shared": sh("i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done; echo shared > $out", &[]),
    "left": sh("read x < $shared; echo \"left+$x\" > $out", &["shared"]),
    "right": sh("read x < $shared; echo \"right+$x\" > $out", &["shared"]),
  }));
  let engine = fx.engine();

  let envs = thread::scope(|s| {
    let handles: Vec<_> = ["left", "right", "left", "right"]
      .into_iter()
      .map(|pkg| {
        let engine = &engine;
        let request = fx.request(HOST, &[pkg]);
        s.spawn(move || engine.compose(&request, &Cancel::new()).unwrap())
      })
      .collect();
    handles
      .into_iter()
      .map(|h| h.join().unwrap())
      .collect::<Vec<_>>()
  });

  assert_eq!(envs[0], envs[2]);
  assert_eq!(envs[1], envs[3]);
  assert_eq!(engine.builder().builds_started(), 3);
  assert_eq!(engine.fetcher().transfers(), 1);
  assert_eq!(
    fs::read_to_string(&envs[0].search_paths[0]).unwrap(),
    "left+shared\n"
  );
}

#[test]
fn test_outputs_are_reproducible() {
  let fx = Fixture::new(json!({
    "base": files(json!({"share/data": {"text": "data"}})),
    "tool": sh("read x < $base/share/data; echo \"tool:$x\" > $out", &["base"]),
  }));
  let request = fx.request(HOST, &["tool"]);

  let first = fx.engine();
  let env = first.compose(&request, &Cancel::new()).unwrap();
  let set = first.evaluate(&request, &Cancel::new()).unwrap();
  let tool = set.get("tool").unwrap();
  let before = first
    .store()
    .query_path_info(tool.out_path())
    .unwrap()
    .unwrap();

  // wipe everything and start over from the same pins
  first.collect_garbage().unwrap();
  assert!(first.store().valid_paths().unwrap().is_empty());

  let second = fx.engine();
  assert_eq!(second.compose(&request, &Cancel::new()).unwrap(), env);
  assert_eq!(second.fetcher().transfers(), 1);
  assert_eq!(second.builder().builds_started(), 2);

  let set = second.evaluate(&request, &Cancel::new()).unwrap();
  assert_eq!(set.get("tool").unwrap().id, tool.id);
  let after = second
    .store()
    .query_path_info(tool.out_path())
    .unwrap()
    .unwrap();
  assert_eq!(after.path, before.path);
  assert_eq!(after.nar_hash, before.nar_hash);
}

#[test]
fn test_corrupted_source_is_rejected() {
  let fx = Fixture::new(json!({"fine": files(json!({"ok": {"text": "ok"}}))}));
  let tree = fx.tmp.path().join("toolchain").join("rev1");
  let mut archive = nar_of(&tree);
  let hash = Hash::hash(&archive, HashType::SHA256).encode(Encoding::SRI);

  let mid = archive.len() / 2;
  archive[mid] ^= 0x20;
  fs::write(fx.tmp.path().join("rev1.nar"), &archive).unwrap();
  let locator = format!("file://{}/{{rev}}.nar", fx.tmp.path().display());
  write_registry(fx.tmp.path(), &locator, &hash);

  let engine = fx.engine();
  let e = engine
    .compose(&fx.request(HOST, &["fine"]), &Cancel::new())
    .unwrap_err();
  match Error::find(&e) {
    Some(Error::IntegrityViolation { name, revision, .. }) => {
      assert_eq!(name, "toolchain");
      assert_eq!(revision, "rev1");
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(engine.fetcher().transfers(), 1);
  assert!(engine.store().valid_paths().unwrap().is_empty());
  assert_eq!(engine.builder().builds_started(), 0);
}

#[test]
fn test_failed_build_is_not_retried() {
  let fx = Fixture::new(json!({
    "broken": sh("echo 'missing header' >&2; exit 2", &[]),
    "app": sh("echo app > $out", &["broken"]),
  }));
  let engine = fx.engine();
  let e = engine
    .compose(&fx.request(HOST, &["app"]), &Cancel::new())
    .unwrap_err();
  match Error::find(&e) {
    Some(Error::BuildFailure {
      name,
      status,
      log_excerpt,
      ..
    }) => {
      assert_eq!(name, "broken");
      assert_eq!(status, "exited with code 2");
      assert!(log_excerpt.contains("missing header"));
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(engine.builder().builds_started(), 1);
  // only the source is left
  assert_eq!(engine.store().valid_paths().unwrap().len(), 1);
}

#[test]
fn test_check_mode_detects_nondeterminism() {
  let fx = Fixture::new(json!({
    "stable": sh("echo stable > $out", &[]),
    "pid": sh("echo $$ > $out", &[]),
  }));
  fx.engine()
    .compose(&fx.request(HOST, &["stable", "pid"]), &Cancel::new())
    .unwrap();

  let mut settings = Settings::for_store(fx.store_dir());
  settings.set_build_mode(BuildMode::Check);
  let checker = Engine::open(settings).unwrap();

  checker
    .compose(&fx.request(HOST, &["stable"]), &Cancel::new())
    .unwrap();
  assert_eq!(checker.builder().builds_started(), 1);

  let set = checker
    .evaluate(&fx.request(HOST, &["pid"]), &Cancel::new())
    .unwrap();
  let out = checker.store().to_real_path(set.get("pid").unwrap().out_path());
  let registered = fs::read_to_string(&out).unwrap();
  let e = checker
    .compose(&fx.request(HOST, &["pid"]), &Cancel::new())
    .unwrap_err();
  assert!(matches!(
    Error::find(&e),
    Some(Error::NonDeterministicBuild { .. })
  ));

  // the registered output is left as it was
  assert_eq!(fs::read_to_string(out).unwrap(), registered);
}

#[test]
fn test_cancelled_build_leaves_nothing_behind() {
  let fx = Fixture::new(json!({"spin": sh("while :; do :; done", &[])}));
  let engine = fx.engine();
  let request = fx.request(HOST, &["spin"]);
  let cancel = Cancel::new();

  let result = thread::scope(|s| {
    let handle = s.spawn(|| engine.compose(&request, &cancel));
    while engine.builder().builds_started() == 0 {
      thread::sleep(Duration::from_millis(10));
    }
    cancel.cancel();
    handle.join().unwrap()
  });

  let e = result.unwrap_err();
  assert_eq!(Error::find(&e), Some(&Error::Cancelled));
  let set = engine.evaluate(&request, &Cancel::new()).unwrap();
  let spin = set.get("spin").unwrap();
  assert!(!engine.store().is_valid_path(spin.out_path()).unwrap());
  assert!(!engine.store().to_real_path(spin.out_path()).exists());
}
