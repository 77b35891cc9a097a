//! Single-field secondary indexes: creation before and after data,
//! point lookups, ordered ranges, maintenance on overwrite and delete,
//! and persistence across reopen.

use clowder::{Bound, Database, Error, Table};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct Person {
    name: String,
    city: String,
    age: i64,
}

fn person(name: &str, city: &str, age: i64) -> Person {
    Person {
        name: name.into(),
        city: city.into(),
        age,
    }
}

fn insert_people(table: &Table, ages: &[(&str, i64)]) {
    for (name, age) in ages {
        let city = match *name {
            "jason" => "Sydney",
            "ben" => "Melbourne",
            _ => "London",
        };
        let mut cased = name.to_string();
        cased[..1].make_ascii_uppercase();
        table.set(name, &person(&cased, city, *age)).unwrap();
    }
}

fn sorted_keys(mut range: clowder::Range) -> Vec<String> {
    let mut out = Vec::new();
    while range.next() {
        out.push(range.key().to_owned());
    }
    assert!(matches!(range.error(), Some(Error::EndOfRange)));
    out.sort();
    out
}

fn ordered_keys(mut range: clowder::Range) -> Vec<String> {
    let mut out = Vec::new();
    while range.next() {
        out.push(range.key().to_owned());
    }
    assert!(matches!(range.error(), Some(Error::EndOfRange)));
    out
}

#[test]
fn index_created_before_data_stays_current() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();

    insert_people(&table, &[("jason", 18), ("ben", 19), ("drew", 18)]);

    let index = table.index("Age").unwrap();
    let (key, counter, found) = index.one::<Person>(19).unwrap();
    assert_eq!(key, "ben");
    assert!(counter > 0);
    assert_eq!(found, person("Ben", "Melbourne", 19));

    assert!(matches!(index.one::<Person>(22), Err(Error::NotFound)));

    assert_eq!(sorted_keys(index.get_all(18)), ["drew", "jason"]);

    let mut range = index.between(18, 18, false);
    assert!(range.next());
    assert!(range.next());
    assert!(!range.next());
    assert!(range.is_closed(), "range should have automatically closed");
}

#[test]
fn index_created_after_data_backfills() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();

    insert_people(&table, &[("jason", 18), ("ben", 19), ("drew", 18)]);
    table.new_index("Age").unwrap();

    let index = table.index("Age").unwrap();
    let (key, _, found) = index.one::<Person>(19).unwrap();
    assert_eq!(key, "ben");
    assert_eq!(found, person("Ben", "Melbourne", 19));

    assert_eq!(sorted_keys(index.get_all(18)), ["drew", "jason"]);
}

#[test]
fn index_ranges_are_inclusive_and_value_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();
    insert_people(&table, &[("jason", 20), ("ben", 10), ("drew", 15)]);

    let index = table.index("Age").unwrap();

    assert_eq!(
        ordered_keys(index.between(Bound::Min, Bound::Max, false)),
        ["ben", "drew", "jason"]
    );
    assert_eq!(
        ordered_keys(index.between(Bound::Min, Bound::Max, true)),
        ["jason", "drew", "ben"]
    );
    assert_eq!(ordered_keys(index.between(14, 16, true)), ["drew"]);
    assert_eq!(ordered_keys(index.between(14, 20, true)), ["jason", "drew"]);
    assert_eq!(ordered_keys(index.between(1, 14, false)), ["ben"]);
    assert_eq!(ordered_keys(index.between(1, 17, false)), ["ben", "drew"]);
    assert_eq!(ordered_keys(index.between(1, 17, true)), ["drew", "ben"]);
}

#[test]
fn inverted_and_sentinel_index_ranges_are_empty() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();
    insert_people(&table, &[("jason", 20), ("ben", 10), ("drew", 15)]);

    let index = table.index("Age").unwrap();
    for mut range in [
        index.between(16, 14, true),
        index.between(20, 14, false),
        index.between(17, 1, true),
        index.between(Bound::Min, Bound::Min, false),
        index.between(Bound::Max, Bound::Max, false),
        index.between(100, Bound::Max, false),
    ] {
        assert!(!range.next());
        assert!(matches!(range.error(), Some(Error::EndOfRange)));
        assert!(range.is_closed(), "range should have automatically closed");
    }
}

#[test]
fn overwrites_move_index_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();

    table.set("jason", &person("Jason", "Sydney", 17)).unwrap();
    table.set("jason", &person("Jason", "Sydney", 18)).unwrap();

    let index = table.index("Age").unwrap();
    assert!(matches!(index.one::<Person>(17), Err(Error::NotFound)));
    assert_eq!(sorted_keys(index.get_all(18)), ["jason"]);
}

#[test]
fn overwriting_everything_with_one_value_then_restoring_converges() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();

    // First give every key the same document, then the real ones.
    for name in ["jason", "ben", "drew"] {
        table.set(name, &person("Jason", "Sydney", 20)).unwrap();
    }
    insert_people(&table, &[("jason", 20), ("ben", 10), ("drew", 15)]);

    let index = table.index("Age").unwrap();
    assert_eq!(
        ordered_keys(index.between(Bound::Min, Bound::Max, false)),
        ["ben", "drew", "jason"]
    );
    assert_eq!(ordered_keys(index.between(14, 16, false)), ["drew"]);
}

#[test]
fn deletes_remove_index_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    insert_people(&table, &[("jason", 17), ("ben", 19), ("drew", 18)]);
    table.new_index("Age").unwrap();

    table.delete("jason").unwrap();
    let index = table.index("Age").unwrap();
    assert!(matches!(index.one::<Person>(17), Err(Error::NotFound)));

    // Rewriting under a different age must not resurrect the old entry.
    table.set("jason", &person("Ben", "Melbourne", 19)).unwrap();
    assert!(matches!(index.one::<Person>(17), Err(Error::NotFound)));

    table.set("jason", &person("Jason", "Sydney", 17)).unwrap();
    let (_, _, found) = index.one::<Person>(17).unwrap();
    assert_eq!(found, person("Jason", "Sydney", 17));
}

#[test]
fn dropped_indexes_can_be_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();
    table.new_index("Age").unwrap();
    insert_people(&table, &[("jason", 18), ("ben", 19), ("drew", 18)]);

    assert!(matches!(table.new_index("Age"), Err(Error::AlreadyExists)));

    table.drop_index("Age").unwrap();
    assert!(table.index("Age").is_none());
    assert!(matches!(table.drop_index("Age"), Err(Error::NotFound)));

    table.new_index("Age").unwrap();
    let index = table.index("Age").unwrap();
    let (key, _, _) = index.one::<Person>(19).unwrap();
    assert_eq!(key, "ben");
    assert_eq!(sorted_keys(index.get_all(18)), ["drew", "jason"]);
}

#[test]
fn indexes_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");

    {
        let db = Database::open(&path).unwrap();
        let table = db.new_table("index_testing").unwrap();
        insert_people(&table, &[("jason", 17), ("ben", 19), ("drew", 18)]);
        table.new_index("Age").unwrap();
        assert_eq!(db.tables(), ["index_testing"]);
        assert_eq!(table.indexes(), ["Age"]);
        db.close();
    }

    {
        let db = Database::open(&path).unwrap();
        let table = db.table("index_testing").unwrap();
        assert_eq!(table.indexes(), ["Age"]);

        let index = table.index("Age").unwrap();
        let (_, _, found) = index.one::<Person>(17).unwrap();
        assert_eq!(found, person("Jason", "Sydney", 17));

        table.drop_index("Age").unwrap();
        db.close();
    }

    let db = Database::open(&path).unwrap();
    let table = db.table("index_testing").unwrap();
    assert!(table.indexes().is_empty());
    assert!(table.index("Age").is_none());
}

#[test]
fn documents_without_the_field_are_not_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();

    table.set("a", &person("Jason", "Sydney", 1)).unwrap();
    table.set("b", &person("Alex", "Perth", 2)).unwrap();
    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Unrelated {
        not_name: String,
    }
    table
        .set(
            "c",
            &Unrelated {
                not_name: "Bob".into(),
            },
        )
        .unwrap();

    table.new_index("Name").unwrap();
    let index = table.index("Name").unwrap();

    // "alex" sorts before "jason"; the document without Name is absent.
    assert_eq!(ordered_keys(index.all(false)), ["b", "a"]);
}

#[test]
fn indexing_the_empty_string_works() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let table = db.new_table("index_testing").unwrap();

    table.set("a", &person("", "Sydney", 1)).unwrap();
    table.new_index("Name").unwrap();

    let index = table.index("Name").unwrap();
    assert_eq!(index.count_between(Bound::Min, Bound::Max), 1);
    let (key, _, _) = index.one::<Person>("").unwrap();
    assert_eq!(key, "a");
}
