//! Minimal Cosmos DB REST client.
//!
//! Covers the three operations the import pipeline needs — SQL query,
//! point read, upsert — with master-key HMAC-SHA256 request signing.
//! Non-2xx responses surface as `CosmosError::Api` carrying the status so
//! callers can treat 404 (read miss) and 409 (conflict) as data, not faults.

pub mod error;

mod auth;

pub use error::{CosmosError, Result};

use serde_json::Value;
use tracing::debug;

const API_VERSION: &str = "2018-12-31";

/// A `name → value` pair for parameterized SQL queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryParam {
    pub name: String,
    pub value: Value,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub struct CosmosClient {
    http: reqwest::Client,
    endpoint: String,
    master_key: String,
}

impl CosmosClient {
    pub fn new(endpoint: &str, master_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            master_key: master_key.to_string(),
        }
    }

    pub fn container(&self, database: &str, container: &str) -> ContainerClient<'_> {
        ContainerClient {
            client: self,
            database: database.to_string(),
            container: container.to_string(),
        }
    }

    async fn send(
        &self,
        verb: &str,
        resource_type: &str,
        resource_link: &str,
        path: &str,
        headers: Vec<(&'static str, String)>,
        body: Option<String>,
    ) -> Result<(u16, Value)> {
        let date = auth::rfc1123_now();
        let signature =
            auth::sign_request(&self.master_key, verb, resource_type, resource_link, &date)?;

        let url = format!("{}/{}", self.endpoint, path);
        let mut req = match verb {
            "get" => self.http.get(&url),
            "post" => self.http.post(&url),
            _ => return Err(CosmosError::Auth(format!("unsupported verb {verb}"))),
        };

        req = req
            .header("authorization", signature)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION);

        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(CosmosError::Api {
                status,
                message: text,
            });
        }

        let value = serde_json::from_str(&text)?;
        Ok((status, value))
    }
}

pub struct ContainerClient<'a> {
    client: &'a CosmosClient,
    database: String,
    container: String,
}

impl ContainerClient<'_> {
    fn collection_link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.container)
    }

    /// Run a parameterized SQL query across partitions. Returns the raw
    /// `Documents` array.
    pub async fn query(&self, query: &str, params: Vec<QueryParam>) -> Result<Vec<Value>> {
        let link = self.collection_link();
        let path = format!("{link}/docs");

        let body = serde_json::json!({
            "query": query,
            "parameters": params,
        });

        debug!(container = self.container.as_str(), "Cosmos query");

        let (_, response) = self
            .client
            .send(
                "post",
                "docs",
                &link,
                &path,
                vec![
                    ("content-type", "application/query+json".to_string()),
                    ("x-ms-documentdb-isquery", "True".to_string()),
                    (
                        "x-ms-documentdb-query-enablecrosspartition",
                        "True".to_string(),
                    ),
                ],
                Some(body.to_string()),
            )
            .await?;

        Ok(response
            .get("Documents")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Point-read a document by id + partition key. `Ok(None)` on 404.
    pub async fn read_item(&self, id: &str, partition_key: &Value) -> Result<Option<Value>> {
        let link = format!("{}/docs/{}", self.collection_link(), id);

        let result = self
            .client
            .send(
                "get",
                "docs",
                &link,
                &link,
                vec![(
                    "x-ms-documentdb-partitionkey",
                    partition_key_header(partition_key),
                )],
                None,
            )
            .await;

        match result {
            Ok((_, doc)) => Ok(Some(doc)),
            Err(CosmosError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upsert a document under the given partition key. Returns the stored
    /// document as the service echoed it back.
    pub async fn upsert(&self, doc: &Value, partition_key: &Value) -> Result<Value> {
        let link = self.collection_link();
        let path = format!("{link}/docs");

        let (_, stored) = self
            .client
            .send(
                "post",
                "docs",
                &link,
                &path,
                vec![
                    ("content-type", "application/json".to_string()),
                    ("x-ms-documentdb-is-upsert", "True".to_string()),
                    (
                        "x-ms-documentdb-partitionkey",
                        partition_key_header(partition_key),
                    ),
                ],
                Some(doc.to_string()),
            )
            .await?;

        Ok(stored)
    }
}

/// The partition-key header is a one-element JSON array of the key value.
fn partition_key_header(value: &Value) -> String {
    Value::Array(vec![value.clone()]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partition_key_header_wraps_in_array() {
        assert_eq!(partition_key_header(&json!("acme.com")), "[\"acme.com\"]");
        assert_eq!(partition_key_header(&Value::Null), "[null]");
    }

    #[test]
    fn query_param_serializes_name_value() {
        let p = QueryParam::new("@domain", "acme.com");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["name"], "@domain");
        assert_eq!(v["value"], "acme.com");
    }
}
