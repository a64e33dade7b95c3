use super::*;

#[test]
fn saved_object_id_prefixes_space() {
    assert_eq!(saved_object_id("abc", None), "dashboard:abc");
    assert_eq!(saved_object_id("abc", Some("")), "dashboard:abc");
    assert_eq!(saved_object_id("abc", Some("team")), "team:dashboard:abc");
}

#[test]
fn parse_privilege_reads_index_entry() {
    let body = json!({
        "username": "jdoe",
        "has_all_requested": false,
        "index": { ".ezreporting": { "delete": false, "read": true } }
    });

    assert!(parse_privilege(&body, ".ezreporting", Privilege::Read));
    assert!(!parse_privilege(&body, ".ezreporting", Privilege::Delete));
    assert!(!parse_privilege(&body, ".ezreporting", Privilege::Write));
    assert!(!parse_privilege(&body, "other", Privilege::Read));
}

#[test]
fn parse_user_extracts_roles_and_idp() {
    let body = json!({
        "jdoe": {
            "username": "jdoe",
            "roles": ["reporting", "superuser"],
            "metadata": { "idp": "https://idp.example.org" }
        }
    });

    let user = parse_user(&body, "jdoe").unwrap();
    assert_eq!(user.name, "jdoe");
    assert_eq!(user.roles, vec!["reporting", "superuser"]);
    assert_eq!(user.idp.as_deref(), Some("https://idp.example.org"));

    assert!(parse_user(&body, "someone-else").is_none());
}

#[test]
fn parse_dashboard_title_requires_dashboard_type() {
    let dashboard = json!({ "type": "dashboard", "dashboard": { "title": "Usage" } });
    assert_eq!(parse_dashboard_title(&dashboard).as_deref(), Some("Usage"));

    let visualization = json!({ "type": "visualization", "dashboard": { "title": "Usage" } });
    assert!(parse_dashboard_title(&visualization).is_none());
}

#[test]
fn metrics_query_filters_window_and_actions() {
    let since = DateTime::parse_from_rfc3339("2026-10-12T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let query = unbroadcasted_query(since, &["file/upload", "user/register"]);

    assert_eq!(query["size"], 10_000);
    assert_eq!(
        query.pointer("/query/bool/must_not/0/exists/field").unwrap(),
        "metadata.broadcasted"
    );
    assert_eq!(
        query.pointer("/query/bool/filter/0/range/datetime/gte").unwrap(),
        "2026-10-12T00:00:00+00:00"
    );
    assert_eq!(
        query.pointer("/query/bool/filter/1/terms/action").unwrap(),
        &json!(["file/upload", "user/register"])
    );
}

#[test]
fn parse_metric_hits_reads_sources() {
    let body = json!({
        "hits": { "hits": [
            {
                "_id": "Xy12",
                "_source": {
                    "datetime": "2026-10-18T09:30:00.000Z",
                    "action": "file/upload",
                    "metadata": { "path": "jdoe/report.csv" },
                    "user": { "name": "jdoe", "roles": ["reporting"] }
                }
            },
            {
                "_id": "Ab34",
                "_source": { "datetime": "2026-10-17T08:00:00Z", "action": "indices/insert", "index": "univ-logs" }
            }
        ] }
    });

    let hits = parse_metric_hits(&body).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "Xy12");
    assert_eq!(hits[0].metadata["path"], "jdoe/report.csv");
    assert_eq!(hits[0].user.as_ref().unwrap().roles, vec!["reporting"]);
    assert_eq!(hits[1].index.as_deref(), Some("univ-logs"));
    assert_eq!(hits[1].metadata, json!({}));
    assert!(hits[1].user.is_none());

    assert!(parse_metric_hits(&json!({ "error": "boom" })).is_err());
    let undated = json!({ "hits": { "hits": [{ "_id": "a", "_source": {} }] } });
    assert!(parse_metric_hits(&undated).is_err());
}

#[test]
fn bulk_body_updates_each_document() {
    let at = DateTime::parse_from_rfc3339("2026-10-19T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let body = broadcast_bulk_body(".ezmesure-metrics", &["a".into(), "b".into()], at);

    let lines: Vec<Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert!(body.ends_with('\n'));
    assert_eq!(lines[0]["update"]["_id"], "a");
    assert_eq!(lines[0]["update"]["_index"], ".ezmesure-metrics");
    assert_eq!(
        lines[1]["doc"]["metadata"]["broadcasted"],
        "2026-10-19T00:00:00+00:00"
    );
    assert_eq!(lines[2]["update"]["_id"], "b");
}

#[test]
fn bulk_response_counts_successful_updates() {
    let body = json!({
        "errors": true,
        "items": [
            { "update": { "_id": "a", "status": 200 } },
            { "update": { "_id": "b", "status": 404, "error": { "type": "document_missing_exception" } } },
            { "update": { "_id": "c", "status": 200 } }
        ]
    });

    assert_eq!(count_bulk_updates(&body), 2);
    assert_eq!(count_bulk_updates(&json!({})), 0);
}
