use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jsonshare_core::{document, Document, MirrorChange};
use jsonshare_lock::{LockOptions, MarkerLock};
use jsonshare_sync::{SharedState, SharedStateOptions, SyncError};
use serde_json::{json, Value};
use tempfile::TempDir;

fn options_in(dir: &TempDir) -> SharedStateOptions {
    SharedStateOptions::new()
        .with_directory(dir.path())
        .with_persist_debounce(Duration::from_millis(5))
}

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutation_roundtrips_through_file() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir).with_initial(doc(json!({"count": 0})));
    let state = SharedState::open("counter", options).expect("open");

    state.set("count", json!(1));
    state.flush().await.expect("flush");

    let on_disk = document::read_at(state.path()).expect("read persisted document");
    assert_eq!(on_disk.get("count"), Some(&json!(1)));
    assert!(!MarkerLock::new(state.path()).is_locked(), "lock must be released");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_writes_merged_seed_back_to_file() {
    let dir = TempDir::new().expect("tmp");
    let path = dir.path().join("prefs.json");
    document::save_at(&path, &doc(json!({"a": 1, "b": 2}))).expect("seed file");

    let options = options_in(&dir).with_initial(doc(json!({"b": 0, "c": 3})));
    let state = SharedState::open("prefs", options).expect("open");

    assert_eq!(Value::Object(state.value()), json!({"a": 1, "b": 2, "c": 3}));
    assert!(state.is_initialized());
    state.flush().await.expect("flush seed");
    assert_eq!(
        Value::Object(document::read_at(&path).expect("reread")),
        json!({"a": 1, "b": 2, "c": 3})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_without_new_keys_leaves_file_alone() {
    let dir = TempDir::new().expect("tmp");
    let path = dir.path().join("prefs.json");
    document::save_at(&path, &doc(json!({"a": 1}))).expect("seed file");
    let before = std::fs::read_to_string(&path).expect("read seed");

    let options = options_in(&dir).with_initial(doc(json!({"a": 0})));
    let state = SharedState::open("prefs", options).expect("open");

    state.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(std::fs::read_to_string(&path).expect("reread"), before);
    assert_eq!(state.get("a"), Some(json!(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seed_defaults_reach_later_instances() {
    let dir = TempDir::new().expect("tmp");
    let first = SharedState::open(
        "defaults",
        options_in(&dir)
            .with_cleanup_on_dispose(false)
            .with_initial(doc(json!({"count": 0}))),
    )
    .expect("open first");
    first.flush().await.expect("flush first");

    let second = SharedState::open("defaults", options_in(&dir).with_cleanup_on_dispose(false))
        .expect("open second");
    assert_eq!(Value::Object(second.value()), json!({"count": 0}));
    assert_eq!(
        Value::Object(document::read_at(first.path()).expect("read")),
        Value::Object(first.value())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_tolerates_corrupt_file() {
    let dir = TempDir::new().expect("tmp");
    std::fs::write(dir.path().join("broken.json"), "{ nope").expect("write corrupt");

    let state = SharedState::open("broken", options_in(&dir)).expect("open");
    assert!(state.value().is_empty());
    assert!(!state.is_initialized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instances_on_same_id_converge() {
    let dir = TempDir::new().expect("tmp");
    let a = SharedState::open("session", options_in(&dir).with_cleanup_on_dispose(false))
        .expect("open a");
    let b = SharedState::open("session", options_in(&dir).with_cleanup_on_dispose(false))
        .expect("open b");

    a.set("user", json!("ada"));
    a.flush().await.expect("flush a");

    assert!(
        eventually(Duration::from_secs(5), || b.get("user") == Some(json!("ada"))).await,
        "b never observed a's write: {:?}",
        b.value()
    );

    a.remove("user");
    a.flush().await.expect("flush a");
    assert!(
        eventually(Duration::from_secs(5), || b.get("user").is_none()).await,
        "deleting a key in the file must remove it from b"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_writer_replaces_key_set() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir).with_initial(doc(json!({"stale": true})));
    let state = SharedState::open("shared", options).expect("open");
    state.flush().await.expect("seed written");

    document::save_at(state.path(), &doc(json!({"fresh": 1}))).expect("external write");

    assert!(
        eventually(Duration::from_secs(5), || state.get("fresh") == Some(json!(1))).await,
        "external write was not reloaded"
    );
    assert_eq!(state.get("stale"), None);

    // The reload itself must not echo back as a write.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let on_disk = document::read_at(state.path()).expect("read");
    assert_eq!(Value::Object(on_disk), json!({"fresh": 1}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_mutations_lands_in_file() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir).with_persist_debounce(Duration::from_millis(30));
    let state = SharedState::open("burst", options).expect("open");

    for n in 0..100 {
        state.set(format!("k{n}"), json!(n));
    }
    state.flush().await.expect("flush");

    let on_disk = document::read_at(state.path()).expect("read");
    assert_eq!(on_disk.len(), 100);
    assert_eq!(on_disk.get("k99"), Some(&json!(99)));

    // The burst is fully on disk; nothing else may be written for it.
    std::fs::remove_file(state.path()).expect("remove");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !state.path().exists(),
        "burst was written again after flush returned"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_applies_many_edits_at_once() {
    let dir = TempDir::new().expect("tmp");
    let state = SharedState::open("edits", options_in(&dir)).expect("open");

    state.update(|doc| {
        doc.insert("x".into(), json!(1));
        doc.insert("y".into(), json!(2));
    });
    state.flush().await.expect("flush");

    let on_disk = document::read_at(state.path()).expect("read");
    assert_eq!(Value::Object(on_disk), json!({"x": 1, "y": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_is_terminal() {
    let dir = TempDir::new().expect("tmp");
    let state = SharedState::open("ephemeral", options_in(&dir)).expect("open");
    state.set("k", json!(1));
    state.flush().await.expect("flush");
    let path = state.path().to_path_buf();
    let marker = state.lock_path().to_path_buf();
    assert!(path.exists());

    state.dispose();
    state.dispose();
    assert!(state.is_disposed());
    assert!(!path.exists());
    assert!(!marker.exists());

    state.set("k", json!(2));
    state.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!path.exists(), "mutation after dispose recreated the document");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_without_cleanup_keeps_document() {
    let dir = TempDir::new().expect("tmp");
    let path = {
        let state = SharedState::open("keep", options_in(&dir).with_cleanup_on_dispose(false))
            .expect("open");
        state.set("k", json!("v"));
        state.flush().await.expect("flush");
        state.path().to_path_buf()
    };

    let on_disk = document::read_at(&path).expect("document survives drop");
    assert_eq!(on_disk.get("k"), Some(&json!("v")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_resolves_with_late_writer_data() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir).with_ready_polling(Duration::from_millis(50), 20);
    let state = SharedState::open("late", options).expect("open");
    assert!(!state.is_initialized());

    let path = state.path().to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        document::save_at(&path, &doc(json!({"populated": true}))).expect("late write");
    });

    let value = state.ready().await;
    assert_eq!(value.get("populated"), Some(&json!(true)));
    assert!(state.is_initialized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_gives_up_quietly_on_empty_document() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir).with_ready_polling(Duration::from_millis(10), 5);
    let state = SharedState::open("empty", options).expect("open");

    let started = Instant::now();
    let value = state.ready().await;
    assert!(value.is_empty());
    assert!(state.is_initialized());
    assert!(started.elapsed() < Duration::from_secs(2));

    // Second call returns at once.
    let started = Instant::now();
    assert!(state.ready().await.is_empty());
    assert!(started.elapsed() < Duration::from_millis(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_timeout_defers_persist_to_next_change() {
    let dir = TempDir::new().expect("tmp");
    let options = options_in(&dir)
        .with_lock_timeout(Duration::from_millis(30))
        .with_lock_options(LockOptions::new().with_stale_multiplier(1_000));
    let state = SharedState::open("contended", options).expect("open");

    let foreign = MarkerLock::new(state.path());
    assert!(foreign.acquire(Duration::ZERO).await.expect("foreign lock"));

    state.set("first", json!(1));
    let err = state.flush().await.expect_err("write must report the busy lock");
    assert!(matches!(err, SyncError::LockTimeout { .. }), "got {err:?}");
    assert!(document::load_at(state.path()).is_empty(), "write must wait for the lock");
    assert_eq!(state.get("first"), Some(json!(1)));

    foreign.release().expect("release");
    state.set("second", json!(2));
    state.flush().await.expect("flush after release");

    let on_disk = document::read_at(state.path()).expect("read");
    assert_eq!(Value::Object(on_disk), json!({"first": 1, "second": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_see_reloaded_changes() {
    let dir = TempDir::new().expect("tmp");
    let state = SharedState::open("observed", options_in(&dir)).expect("open");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    state.subscribe(move |change, doc| {
        sink.lock().unwrap().push((change.clone(), doc.get("n").cloned()));
    });

    document::save_at(state.path(), &doc(json!({"n": 7}))).expect("external write");

    assert!(
        eventually(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()).await,
        "listener never fired"
    );
    let first = seen.lock().unwrap()[0].clone();
    assert_eq!(first, (MirrorChange::Replaced, Some(json!(7))));
}

#[test]
fn invalid_id_is_rejected() {
    let dir = TempDir::new().expect("tmp");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let _guard = runtime.enter();
    let err = SharedState::open("../escape", options_in(&dir)).unwrap_err();
    assert!(err.to_string().contains("invalid document id"));
}
