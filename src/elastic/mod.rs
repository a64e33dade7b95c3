//! Elasticsearch collaborators: privilege checks, user lookup, Kibana
//! dashboard metadata and the platform metrics index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode, header};
use serde_json::{Value, json};

use crate::config::ElasticConfig;
use crate::domain::{ActivityUser, PlatformMetric, Privilege};
use crate::errors::ElasticError;

/// Upper bound of metrics documents read per search.
const MAX_HITS: usize = 10_000;

#[cfg(test)]
mod tests;

/// Answers whether a user holds a privilege on an index.
#[async_trait]
pub trait PrivilegeChecker: Send + Sync {
    async fn has_privilege(
        &self,
        user: &str,
        index: &str,
        privilege: Privilege,
    ) -> Result<bool, ElasticError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<ActivityUser>, ElasticError>;
}

#[async_trait]
pub trait DashboardSource: Send + Sync {
    async fn dashboard_title(
        &self,
        dashboard_id: &str,
        space: Option<&str>,
    ) -> Result<Option<String>, ElasticError>;
}

/// Platform metrics written by the rest of ezMESURE.
#[async_trait]
pub trait PlatformMetrics: Send + Sync {
    /// Documents of `index` dated at or after `since`, whose action is one of
    /// `actions` and which were never included in a digest. Newest first.
    async fn unbroadcasted(
        &self,
        index: &str,
        since: DateTime<Utc>,
        actions: &[&str],
    ) -> Result<Vec<PlatformMetric>, ElasticError>;

    /// Sets `metadata.broadcasted` on the given documents, returns how many were updated.
    async fn mark_broadcasted(
        &self,
        index: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, ElasticError>;
}

#[derive(Clone)]
pub struct ElasticClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl ElasticClient {
    pub fn new(config: &ElasticConfig) -> Result<Self, ElasticError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GETs a JSON document, mapping 404 to `None`.
    async fn get_optional(&self, path: &str) -> Result<Option<Value>, ElasticError> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ElasticError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            }),
        }
    }

    /// Reads the JSON body of a successful response.
    async fn checked_json(response: Response, path: &str) -> Result<Value, ElasticError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ElasticError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl PrivilegeChecker for ElasticClient {
    async fn has_privilege(
        &self,
        user: &str,
        index: &str,
        privilege: Privilege,
    ) -> Result<bool, ElasticError> {
        let path = "_security/user/_has_privileges";
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header("es-security-runas-user", user)
            .json(&json!({
                "index": [{ "names": [index], "privileges": [privilege.as_str()] }]
            }))
            .send()
            .await?;

        let body = Self::checked_json(response, path).await?;
        Ok(parse_privilege(&body, index, privilege))
    }
}

#[async_trait]
impl UserDirectory for ElasticClient {
    async fn find_user(&self, username: &str) -> Result<Option<ActivityUser>, ElasticError> {
        let body = self
            .get_optional(&format!("_security/user/{}", username))
            .await?;

        Ok(body.and_then(|body| parse_user(&body, username)))
    }
}

#[async_trait]
impl DashboardSource for ElasticClient {
    async fn dashboard_title(
        &self,
        dashboard_id: &str,
        space: Option<&str>,
    ) -> Result<Option<String>, ElasticError> {
        let body = self
            .get_optional(&format!(".kibana/_source/{}", saved_object_id(dashboard_id, space)))
            .await?;

        Ok(body.and_then(|body| parse_dashboard_title(&body)))
    }
}

#[async_trait]
impl PlatformMetrics for ElasticClient {
    async fn unbroadcasted(
        &self,
        index: &str,
        since: DateTime<Utc>,
        actions: &[&str],
    ) -> Result<Vec<PlatformMetric>, ElasticError> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }

        let path = format!("{}/_search", index);
        let response = self
            .http
            .post(self.url(&path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&unbroadcasted_query(since, actions))
            .send()
            .await?;

        // The index only exists once the platform logged something
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let body = Self::checked_json(response, &path).await?;
        parse_metric_hits(&body)
    }

    async fn mark_broadcasted(
        &self,
        index: &str,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, ElasticError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let path = "_bulk";
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(broadcast_bulk_body(index, ids, at))
            .send()
            .await?;

        let body = Self::checked_json(response, path).await?;
        Ok(count_bulk_updates(&body))
    }
}

fn unbroadcasted_query(since: DateTime<Utc>, actions: &[&str]) -> Value {
    json!({
        "size": MAX_HITS,
        "sort": [{ "datetime": "desc" }],
        "query": {
            "bool": {
                "must_not": [{ "exists": { "field": "metadata.broadcasted" } }],
                "filter": [
                    { "range": { "datetime": { "gte": since.to_rfc3339() } } },
                    { "terms": { "action": actions } }
                ]
            }
        }
    })
}

fn parse_metric_hits(body: &Value) -> Result<Vec<PlatformMetric>, ElasticError> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| ElasticError::Malformed("search response without hits".into()))?;

    hits.iter().map(parse_metric_hit).collect()
}

fn parse_metric_hit(hit: &Value) -> Result<PlatformMetric, ElasticError> {
    let id = hit
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ElasticError::Malformed("hit without _id".into()))?;
    let source = hit.get("_source").unwrap_or(&Value::Null);

    let datetime = source
        .get("datetime")
        .and_then(Value::as_str)
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| ElasticError::Malformed(format!("document {} has no valid datetime", id)))?;

    let user = source.get("user").and_then(|user| {
        let name = user.get("name").and_then(Value::as_str)?;
        Some(ActivityUser {
            name: name.to_string(),
            roles: user
                .get("roles")
                .and_then(Value::as_array)
                .map(|roles| roles.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default(),
            idp: user.get("idp").and_then(Value::as_str).map(String::from),
        })
    });

    Ok(PlatformMetric {
        id: id.to_string(),
        datetime,
        action: source
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        index: source.get("index").and_then(Value::as_str).map(String::from),
        metadata: source.get("metadata").cloned().unwrap_or_else(|| json!({})),
        user,
    })
}

/// Newline-delimited `_bulk` body updating `metadata.broadcasted` on each document.
fn broadcast_bulk_body(index: &str, ids: &[String], at: DateTime<Utc>) -> String {
    let mut body = String::new();
    for id in ids {
        let action = json!({ "update": { "_index": index, "_id": id } });
        let doc = json!({ "doc": { "metadata": { "broadcasted": at.to_rfc3339() } } });
        body.push_str(&format!("{}\n{}\n", action, doc));
    }
    body
}

fn count_bulk_updates(body: &Value) -> u64 {
    body.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    item.pointer("/update/status")
                        .and_then(Value::as_u64)
                        .is_some_and(|status| (200..300).contains(&status))
                })
                .count() as u64
        })
        .unwrap_or(0)
}

/// Id of a dashboard saved object in the `.kibana` index.
pub fn saved_object_id(dashboard_id: &str, space: Option<&str>) -> String {
    match space.filter(|s| !s.is_empty()) {
        Some(space) => format!("{}:dashboard:{}", space, dashboard_id),
        None => format!("dashboard:{}", dashboard_id),
    }
}

fn parse_privilege(body: &Value, index: &str, privilege: Privilege) -> bool {
    body.get("index")
        .and_then(|indices| indices.get(index))
        .and_then(|privileges| privileges.get(privilege.as_str()))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn parse_user(body: &Value, username: &str) -> Option<ActivityUser> {
    let user = body.get(username)?;

    Some(ActivityUser {
        name: user
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or(username)
            .to_string(),
        roles: user
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        idp: user
            .pointer("/metadata/idp")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

fn parse_dashboard_title(body: &Value) -> Option<String> {
    if body.get("type").and_then(Value::as_str) != Some("dashboard") {
        return None;
    }

    body.pointer("/dashboard/title")
        .and_then(Value::as_str)
        .map(String::from)
}
