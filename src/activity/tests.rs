use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::SqlitePool;

use super::*;
use crate::tests::fakes::FakeUsers;

fn context(action: &str, body: Option<Value>, username: Option<&str>) -> ActivityContext {
    ActivityContext {
        started_at: Utc::now(),
        action: action.to_string(),
        response_time_ms: 12,
        metadata: json!({}),
        request: RequestSnapshot {
            method: "GET".into(),
            url: "/tasks?user=jdoe".into(),
            query: BTreeMap::from([("user".to_string(), "jdoe".to_string())]),
            user_agent: Some("curl/8.0".into()),
        },
        status: 200,
        body,
        username: username.map(String::from),
    }
}

fn logger(pool: &SqlitePool) -> ActivityLogger {
    ActivityLogger::new(pool.clone(), Arc::new(FakeUsers), ".ezreporting-activity")
}

#[sqlx::test]
async fn list_responses_are_not_kept(pool: SqlitePool) -> sqlx::Result<()> {
    let logger = logger(&pool);
    let repo = ActivityRepository::new(&pool);

    let first = logger
        .save(context("reporting/list", Some(json!([{ "id": "a" }])), Some("jdoe")))
        .await?;
    let second = logger
        .save(context("reporting/list", Some(json!({ "tasks": [] })), Some("jdoe")))
        .await?;

    for id in [first, second] {
        let doc = repo.get(id).await?.unwrap();
        assert_eq!(doc.action, "reporting/list");
        assert_eq!(doc.response["body"], Value::Null);
        assert_eq!(doc.response["status"], 200);
        assert_eq!(doc.index.as_deref(), Some(".ezreporting-activity"));
        assert_eq!(doc.user.as_ref().unwrap().name, "jdoe");
        assert_eq!(doc.request["userAgent"], "curl/8.0");
        assert_eq!(doc.request["query"]["user"], "jdoe");
    }

    Ok(())
}

#[sqlx::test]
async fn error_bodies_and_mutations_are_kept(pool: SqlitePool) -> sqlx::Result<()> {
    let logger = logger(&pool);
    let repo = ActivityRepository::new(&pool);

    let mut denied = context(
        "reporting/list",
        Some(json!({ "error": "You have no rights to access this page.", "code": 403 })),
        Some("jdoe"),
    );
    denied.status = 403;
    let denied = logger.save(denied).await?;

    let stored = logger
        .save(context("reporting/store", Some(json!({ "id": "t1" })), Some("jdoe")))
        .await?;

    let plain = logger
        .save(context("reporting/store", Some(json!("created")), None))
        .await?;

    let denied = repo.get(denied).await?.unwrap();
    assert_eq!(denied.response["body"]["code"], 403);

    let stored = repo.get(stored).await?.unwrap();
    assert_eq!(stored.response["body"]["id"], "t1");

    let plain = repo.get(plain).await?.unwrap();
    assert_eq!(plain.response["body"], Value::Null);
    assert!(plain.user.is_none());

    Ok(())
}

#[sqlx::test]
async fn user_lookup_failures_do_not_block_logging(pool: SqlitePool) -> sqlx::Result<()> {
    let logger = logger(&pool);
    let repo = ActivityRepository::new(&pool);

    let broken = logger
        .save(context("reporting/update", None, Some("broken")))
        .await?;
    let unknown = logger
        .save(context("reporting/update", None, Some("unknown")))
        .await?;

    assert!(repo.get(broken).await?.unwrap().user.is_none());
    assert!(repo.get(unknown).await?.unwrap().user.is_none());

    Ok(())
}
