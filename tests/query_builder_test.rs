//! Query builders executed against a real SQLite database.

use omnidb::db::SortOrder;
use omnidb::query::filter::plain_param;
use omnidb::query::{DocumentQueryBuilder, SqlQueryBuilder, lower_filter};
use omnidb::{Adapter, ConnectionConfig, ExecuteRequest, Record};
use serde_json::{Value, json};
use tempfile::NamedTempFile;

async fn setup_db() -> Adapter {
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
            "CREATE TABLE people (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, role TEXT, age INTEGER)",
            vec![],
        ))
        .await
        .unwrap();

    for (name, role, age) in [
        ("Ann", Some("admin"), 31),
        ("Bob", Some("user"), 25),
        ("Dana", None, 19),
        ("50% off", Some("user"), 40),
    ] {
        let record = json!({"name": name, "role": role, "age": age});
        SqlQueryBuilder::for_adapter(&adapter)
            .insert("people", record.as_object().unwrap())
            .execute_update()
            .await
            .unwrap();
    }
    adapter
}

/// Run a document filter through the SQL lowering and return matching names.
async fn names_matching(adapter: &Adapter, filter: Value) -> Vec<String> {
    let filter: Record = filter.as_object().cloned().unwrap();
    let mut qb = SqlQueryBuilder::for_adapter(adapter)
        .select(["name"])
        .from("people")
        .order_by("id", SortOrder::Asc);
    if let Some(lowered) = lower_filter(&filter, qb.dialect(), &plain_param).unwrap() {
        qb = qb.where_(lowered.sql, lowered.params);
    }
    qb.execute()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_lowered_operators_match_rows() {
    let adapter = setup_db().await;

    assert_eq!(names_matching(&adapter, json!({})).await.len(), 4);
    assert_eq!(names_matching(&adapter, json!({"role": "admin"})).await, vec!["Ann"]);
    assert_eq!(names_matching(&adapter, json!({"role": null})).await, vec!["Dana"]);
    assert_eq!(
        names_matching(&adapter, json!({"age": {"$gte": 25, "$lt": 40}})).await,
        vec!["Ann", "Bob"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"name": {"$in": ["Bob", "Dana", "Zed"]}})).await,
        vec!["Bob", "Dana"]
    );
    assert!(names_matching(&adapter, json!({"name": {"$in": []}})).await.is_empty());
}

#[tokio::test]
async fn test_not_equal_keeps_null_rows() {
    let adapter = setup_db().await;

    assert_eq!(
        names_matching(&adapter, json!({"role": {"$ne": "user"}})).await,
        vec!["Ann", "Dana"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"role": {"$nin": ["admin"]}})).await,
        vec!["Bob", "Dana", "50% off"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"role": {"$exists": true}})).await.len(),
        3
    );
}

#[tokio::test]
async fn test_logical_operators_and_regex() {
    let adapter = setup_db().await;

    assert_eq!(
        names_matching(
            &adapter,
            json!({"$or": [{"role": "admin"}, {"$and": [{"role": "user"}, {"age": {"$lt": 30}}]}]})
        )
        .await,
        vec!["Ann", "Bob"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"$nor": [{"role": "user"}, {"role": null}]})).await,
        vec!["Ann"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"name": {"$regex": "^50% "}})).await,
        vec!["50% off"]
    );
    assert_eq!(
        names_matching(&adapter, json!({"name": {"$regex": "AN", "$options": "i"}})).await,
        vec!["Ann", "Dana"]
    );

    let filter = json!({"name": {"$regex": "^A.*n$"}});
    assert!(lower_filter(filter.as_object().unwrap(), omnidb::query::SqlDialect::Sqlite, &plain_param).is_err());
}

#[tokio::test]
async fn test_document_builder_branches_lower_to_sql() {
    let adapter = setup_db().await;

    let qb = DocumentQueryBuilder::new()
        .where_(json!({"role": "user"}))
        .and_where(json!({"age": {"$gt": 30}}))
        .or_where(json!({"name": "Dana"}));
    let filter = qb.build_filter().unwrap();
    assert_eq!(
        names_matching(&adapter, Value::Object(filter)).await,
        vec!["Dana", "50% off"]
    );

    let qb = DocumentQueryBuilder::new().like(json!({"name": "% o"}));
    assert_eq!(
        names_matching(&adapter, Value::Object(qb.build_filter().unwrap())).await,
        vec!["50% off"]
    );
}

#[tokio::test]
async fn test_update_delete_and_paging() {
    let adapter = setup_db().await;

    let changes = json!({"role": "staff"});
    let result = SqlQueryBuilder::for_adapter(&adapter)
        .update("people", changes.as_object().unwrap())
        .where_("role = ?", vec!["user".into()])
        .execute_update()
        .await
        .unwrap();
    assert_eq!(result.affected_rows, 2);

    let result = SqlQueryBuilder::for_adapter(&adapter)
        .update_values("people", vec![])
        .set_raw("\"age\" = \"age\" + ?", vec![1.into()])
        .where_("name = ?", vec!["Ann".into()])
        .execute_update()
        .await
        .unwrap();
    assert_eq!(result.affected_rows, 1);

    let ann = SqlQueryBuilder::for_adapter(&adapter)
        .from("people")
        .where_("name = ?", vec!["Ann".into()])
        .execute_one()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ann["age"], json!(32));

    let rest = SqlQueryBuilder::for_adapter(&adapter)
        .select(["name"])
        .from("people")
        .order_by("id", SortOrder::Asc)
        .offset(2)
        .execute()
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0]["name"], json!("Dana"));

    let result = SqlQueryBuilder::for_adapter(&adapter)
        .delete("people")
        .where_("age < ?", vec![30.into()])
        .execute_update()
        .await
        .unwrap();
    assert_eq!(result.affected_rows, 2);

    let remaining = SqlQueryBuilder::for_adapter(&adapter)
        .select(["COUNT(*) AS n"])
        .from("people")
        .execute_one()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remaining["n"], json!(2));
}
