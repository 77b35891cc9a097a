//! The optimistic update loop: convergence under contention and error
//! propagation.

use std::sync::Arc;
use std::thread;

use clowder::{Database, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Counter {
    count: i64,
}

#[test]
fn a_hundred_contending_updates_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("table_update").unwrap();
    table.set("test", &Counter { count: 0 }).unwrap();

    let db = Arc::new(db);
    let mut handles = Vec::new();
    for _ in 0..100 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            let table = db.table("table_update").unwrap();
            table
                .update("test", |mut counter: Counter| {
                    counter.count += 1;
                    Ok(counter)
                })
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (counter, _) = table.get::<Counter>("test").unwrap();
    assert_eq!(counter.count, 100);
}

#[test]
fn update_errors_abort_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("table_update").unwrap();
    table.set("test", &Counter { count: 0 }).unwrap();

    assert!(matches!(
        table.update("not exist", |counter: Counter| Ok(counter)),
        Err(Error::NotFound)
    ));

    table
        .update("test", |counter: Counter| Ok(counter))
        .unwrap();

    let err = table
        .update("test", |counter: Counter| -> clowder::Result<Counter> {
            let _ = counter;
            Err(Error::msg("handler failure"))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Msg(message) if message == "handler failure"));

    // A failed handler leaves the document untouched.
    let (counter, _) = table.get::<Counter>("test").unwrap();
    assert_eq!(counter.count, 0);
}

#[test]
fn update_is_visible_to_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("table_update").unwrap();
    table.new_index("Count").unwrap();
    table.set("test", &Counter { count: 5 }).unwrap();

    table
        .update("test", |mut counter: Counter| {
            counter.count = 9;
            Ok(counter)
        })
        .unwrap();

    let index = table.index("Count").unwrap();
    assert!(matches!(index.one::<Counter>(5), Err(Error::NotFound)));
    let (key, _, found) = index.one::<Counter>(9).unwrap();
    assert_eq!(key, "test");
    assert_eq!(found.count, 9);
}
