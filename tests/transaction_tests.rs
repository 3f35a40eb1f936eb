use std::sync::Arc;
use serde_json::json;
use kestrel::core::collection::Collection;
use kestrel::core::context::RequestContext;
use kestrel::core::database::Database;
use kestrel::core::error::{Error, ErrorKind, Result};
use kestrel::core::transaction::{SubTransaction, TransactionSet};
use kestrel::core::types::{Record, Timestamp, Value};
use kestrel::query::condition::Condition;
use kestrel::query::types::SearchRequest;
use kestrel::schema::schema::{Attribute, AttributeKind, Schema};
use kestrel::storage::key::Key;

fn record(json: serde_json::Value) -> Record {
    Record::from_json(json).unwrap()
}

fn setup() -> (Database, Arc<Collection>) {
    let db = Database::default();
    let schema = Schema::new("id")
        .with_attribute(Attribute::new("name", AttributeKind::String))
        .with_attribute(Attribute::new("count", AttributeKind::Int).indexed());
    let accounts = db.create_collection("accounts", schema).unwrap();
    (db, accounts)
}

#[test]
fn put_get_delete() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let key = accounts.put(&mut ctx, record(json!({"id": 1, "name": "a", "count": 1}))).unwrap();
    assert_eq!(key, Key::Int(1));
    let stored = accounts.get(&ctx, &key).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("a")));

    assert!(accounts.delete(&mut ctx, &key).unwrap());
    assert!(accounts.get(&ctx, &key).unwrap().is_none());
    assert!(!accounts.delete(&mut ctx, &key).unwrap());
}

#[test]
fn put_without_identity_generates_one() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let key = accounts.put(&mut ctx, record(json!({"name": "anon"}))).unwrap();
    let Key::Str(id) = &key else {
        panic!("expected a generated string key, got {:?}", key);
    };
    assert_eq!(id.len(), 36);
    let stored = accounts.get(&ctx, &key).unwrap().unwrap();
    assert_eq!(stored.get("id"), Some(&Value::from(id.as_str())));
}

#[test]
fn set_commits_atomically_with_one_timestamp() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let (_, result) = db
        .transaction(&mut ctx, |ctx| {
            accounts.put(ctx, record(json!({"id": 1, "count": 1})))?;
            accounts.put(ctx, record(json!({"id": 2, "count": 2})))?;
            Ok(())
        })
        .unwrap();
    let ts = result.unwrap().commit_timestamp;
    assert_eq!(accounts.store().latest_version(&Key::Int(1)).unwrap(), Some(ts));
    assert_eq!(accounts.store().latest_version(&Key::Int(2)).unwrap(), Some(ts));
    assert_eq!(db.mvcc().last_committed(), ts);
}

#[test]
fn failing_body_writes_nothing() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let outcome: Result<((), _)> = db.transaction(&mut ctx, |ctx| {
        accounts.put(ctx, record(json!({"id": 1, "count": 1})))?;
        Err(Error::client("changed my mind"))
    });
    assert_eq!(outcome.unwrap_err().kind, ErrorKind::Client);
    assert!(!ctx.in_transaction());
    assert!(accounts.get(&ctx, &Key::Int(1)).unwrap().is_none());
    assert_eq!(db.mvcc().active_read_count(), 0);
}

#[test]
fn nested_transactions_join_the_outer_set() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let (inner, outer) = db
        .transaction(&mut ctx, |ctx| {
            let (_, inner) = db.transaction(ctx, |ctx| accounts.put(ctx, record(json!({"id": 7}))))?;
            // not committed yet, but visible to the set itself
            assert!(accounts.get(ctx, &Key::Int(7))?.is_some());
            assert!(accounts.get(&RequestContext::new(), &Key::Int(7))?.is_none());
            Ok(inner)
        })
        .unwrap();
    assert!(inner.is_none());
    assert!(outer.is_some());
    assert!(accounts.get(&ctx, &Key::Int(7)).unwrap().is_some());
}

#[test]
fn concurrent_update_is_merged() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "name": "a", "count": 0}))).unwrap();

    let mut other = RequestContext::new();
    db.transaction(&mut ctx, |ctx| {
        accounts.update(ctx, &Key::Int(1), |r| {
            let count = match r.get("count") {
                Some(Value::Int(n)) => n,
                _ => 0,
            };
            r.set("count", Value::Int(count + 1))
        })?;
        // someone else commits in between
        accounts.update(&mut other, &Key::Int(1), |r| r.set("name", Value::from("b")))?;
        Ok(())
    })
    .unwrap();

    let stored = accounts.get(&ctx, &Key::Int(1)).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("b")));
    assert_eq!(stored.get("count"), Some(&Value::Int(1)));
}

#[test]
fn concurrent_put_conflicts() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 0}))).unwrap();

    let mut other = RequestContext::new();
    let err = db
        .transaction(&mut ctx, |ctx| {
            accounts.put(ctx, record(json!({"id": 1, "count": 10})))?;
            accounts.put(&mut other, record(json!({"id": 1, "count": 20})))?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_conflict());
    let stored = accounts.get(&ctx, &Key::Int(1)).unwrap().unwrap();
    assert_eq!(stored.get("count"), Some(&Value::Int(20)));
}

#[test]
fn update_of_missing_record_is_not_found() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    let err = accounts.update(&mut ctx, &Key::Int(404), |r| r.set("count", Value::Int(1))).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[test]
fn wrong_type_fails_at_write_time() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 0}))).unwrap();
    let err = accounts
        .update(&mut ctx, &Key::Int(1), |r| r.set("count", Value::from("lots")))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(accounts.get(&ctx, &Key::Int(1)).unwrap().unwrap().get("count"), Some(&Value::Int(0)));
}

#[test]
fn get_for_update_needs_a_transaction() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 0}))).unwrap();
    assert_eq!(accounts.get_for_update(&ctx, &Key::Int(1)).unwrap_err().kind, ErrorKind::InvalidState);

    db.transaction(&mut ctx, |ctx| {
        let handle = accounts.get_for_update(ctx, &Key::Int(1))?.unwrap();
        handle.lock().set("count", Value::Int(5))?;
        // the same handle comes back for the same key
        let again = accounts.get_for_update(ctx, &Key::Int(1))?.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        Ok(())
    })
    .unwrap();
    assert_eq!(accounts.get(&ctx, &Key::Int(1)).unwrap().unwrap().get("count"), Some(&Value::Int(5)));
}

#[test]
fn unauthorized_requests_are_forbidden() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::unauthorized();
    assert_eq!(accounts.put(&mut ctx, record(json!({"id": 1}))).unwrap_err().kind, ErrorKind::Forbidden);
    assert_eq!(accounts.search(&ctx, SearchRequest::all()).err().unwrap().kind, ErrorKind::Forbidden);
}

#[test]
fn timestamps_increase_under_concurrency() {
    let (db, accounts) = setup();
    let per_thread: Vec<Vec<u64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = &db;
                let accounts = &accounts;
                scope.spawn(move || {
                    let mut stamps = Vec::new();
                    for i in 0..50 {
                        let mut ctx = RequestContext::new();
                        let (_, result) = db
                            .transaction(&mut ctx, |ctx| accounts.put(ctx, record(json!({"id": t * 1000 + i}))))
                            .unwrap();
                        stamps.push(result.unwrap().commit_timestamp);
                    }
                    stamps
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for stamps in &per_thread {
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
    let mut all: Vec<u64> = per_thread.into_iter().flatten().collect();
    let count = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), count);
    assert_eq!(accounts.stats().total().unwrap(), 200);
}

#[test]
fn closing_a_stream_releases_its_read_view() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    for i in 0..5 {
        accounts.put(&mut ctx, record(json!({"id": i, "count": i}))).unwrap();
    }
    let mut stream = accounts.search(&ctx, SearchRequest::all()).unwrap();
    assert_eq!(db.mvcc().active_read_count(), 1);
    assert!(stream.next().is_some());
    drop(stream);
    assert_eq!(db.mvcc().active_read_count(), 0);

    let stream = accounts.search(&ctx, SearchRequest::all().limit(2)).unwrap();
    assert_eq!(stream.into_records().unwrap().len(), 2);
    assert_eq!(db.mvcc().active_read_count(), 0);
}

#[test]
fn snapshot_reads_ignore_later_commits() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 1}))).unwrap();
    let stream = accounts.search(&ctx, SearchRequest::all()).unwrap();
    accounts.put(&mut ctx, record(json!({"id": 2, "count": 2}))).unwrap();
    assert_eq!(stream.into_records().unwrap().len(), 1);
}

#[test]
fn vacuum_keeps_what_readers_can_see() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 1}))).unwrap();
    let reader = accounts.search(&ctx, SearchRequest::all()).unwrap();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 2}))).unwrap();
    assert_eq!(db.vacuum().unwrap(), 0);
    let seen = reader.into_records().unwrap();
    assert_eq!(seen[0].get("count"), Some(&Value::Int(1)));
    assert_eq!(db.vacuum().unwrap(), 1);
}

#[test]
fn transaction_snapshot_outlives_its_streams() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 1}))).unwrap();

    let mut other = RequestContext::new();
    db.transaction(&mut ctx, |ctx| {
        let first = accounts.search(ctx, SearchRequest::all())?.into_records()?;
        assert_eq!(first.len(), 1);
        assert_eq!(ctx.transaction().map(|set| set.open_stream_count()), Some(0));

        accounts.update(&mut other, &Key::Int(1), |r| r.set("count", Value::Int(2)))?;
        // the set still pins the version it reads
        assert_eq!(db.vacuum()?, 0);

        let second = accounts.search(ctx, SearchRequest::all())?.into_records()?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].get("count"), Some(&Value::Int(1)));
        Ok(())
    })
    .unwrap();
    assert_eq!(db.mvcc().active_read_count(), 0);
    assert_eq!(db.vacuum().unwrap(), 1);
}

/// Sub-transaction whose apply step always fails.
struct FailingApply;

impl SubTransaction for FailingApply {
    fn describe(&self) -> String {
        "failing apply".to_string()
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _timestamp: Timestamp, _set: &TransactionSet) -> Result<()> {
        Ok(())
    }

    fn apply(&self, _timestamp: Timestamp) -> Result<()> {
        Err(Error::new(ErrorKind::Io, "disk full".to_string()))
    }

    fn abort(&self) {}
}

#[test]
fn failed_apply_leaves_no_partial_commit() {
    let (db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 1}))).unwrap();
    let before = accounts.store().latest_version(&Key::Int(1)).unwrap();

    let outcome = db.transaction(&mut ctx, |ctx| {
        accounts.put(ctx, record(json!({"id": 1, "count": 5})))?;
        accounts.put(ctx, record(json!({"id": 2, "count": 2})))?;
        if let Some(set) = ctx.transaction() {
            set.register(Arc::new(FailingApply))?;
        }
        Ok(())
    });
    assert_eq!(outcome.unwrap_err().kind, ErrorKind::Io);
    assert_eq!(accounts.store().latest_version(&Key::Int(1)).unwrap(), before);
    assert_eq!(accounts.store().latest_version(&Key::Int(2)).unwrap(), None);

    // a later commit moves the watermark past the failed timestamp
    accounts.put(&mut ctx, record(json!({"id": 3, "count": 3}))).unwrap();
    let stored = accounts.get(&ctx, &Key::Int(1)).unwrap().unwrap();
    assert_eq!(stored.get("count"), Some(&Value::Int(1)));
    assert!(accounts.get(&ctx, &Key::Int(2)).unwrap().is_none());
    let fives = accounts
        .search(&ctx, SearchRequest::new(Condition::equals("count", 5)))
        .unwrap()
        .into_records()
        .unwrap();
    assert!(fives.is_empty());
    assert_eq!(db.mvcc().active_read_count(), 0);
}

#[test]
fn commits_refresh_statistics() {
    let (_db, accounts) = setup();
    let mut ctx = RequestContext::new();
    accounts.put(&mut ctx, record(json!({"id": 1, "count": 7}))).unwrap();
    assert_eq!(accounts.stats().total().unwrap(), 1);
    assert_eq!(accounts.stats().value_count("count", &Key::Int(7)).unwrap(), 1);

    // well inside the cache TTL
    accounts.put(&mut ctx, record(json!({"id": 2, "count": 7}))).unwrap();
    assert_eq!(accounts.stats().total().unwrap(), 2);
    assert_eq!(accounts.stats().value_count("count", &Key::Int(7)).unwrap(), 2);
    accounts.delete(&mut ctx, &Key::Int(1)).unwrap();
    assert_eq!(accounts.stats().total().unwrap(), 1);
}
