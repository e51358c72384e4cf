//! Cosmos-backed `DocumentStore`.
//!
//! Writes try an ordered list of partition-key candidates until one
//! succeeds — containers migrated between partition-key paths accept
//! different values for the same document, and a guessing loop beats a
//! config matrix.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use cosmos_client::{CosmosClient, CosmosError, QueryParam};
use originmap_common::CompanyRecord;

use crate::session::CONTROL_PARTITION;
use crate::traits::{DocumentStore, DuplicateMatchKey, ExistingCompany, UpsertResult};

const NOT_DELETED: &str = "(NOT IS_DEFINED(c.is_deleted) OR c.is_deleted != true)";

pub struct CosmosStore {
    client: CosmosClient,
    database: String,
    container: String,
}

impl CosmosStore {
    pub fn new(client: CosmosClient, database: &str, container: &str) -> Self {
        Self {
            client,
            database: database.to_string(),
            container: container.to_string(),
        }
    }

    fn container(&self) -> cosmos_client::ContainerClient<'_> {
        self.client.container(&self.database, &self.container)
    }

    fn parse_existing(row: &Value, key: DuplicateMatchKey, value: &str) -> Option<ExistingCompany> {
        let id = row.get("id")?.as_str()?.to_string();
        let normalized_domain = row
            .get("normalized_domain")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Some(ExistingCompany {
            id,
            normalized_domain,
            matched_key: key,
            matched_value: value.to_string(),
        })
    }

    fn pk_candidates(values: &[&str]) -> Vec<Value> {
        let mut candidates: Vec<Value> = Vec::new();
        for v in values {
            let v = v.trim();
            if v.is_empty() {
                continue;
            }
            let value = Value::String(v.to_string());
            if !candidates.contains(&value) {
                candidates.push(value);
            }
        }
        candidates.push(Value::Null);
        candidates
    }

    async fn read_with_candidates(&self, id: &str, candidates: &[Value]) -> Result<Option<Value>> {
        let container = self.container();
        let mut last_err: Option<CosmosError> = None;

        for pk in candidates {
            match container.read_item(id, pk).await {
                Ok(Some(doc)) => return Ok(Some(doc)),
                Ok(None) => continue,
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn upsert_with_candidates(&self, doc: &Value, candidates: &[Value]) -> Result<UpsertResult> {
        let container = self.container();
        let mut last_err: Option<CosmosError> = None;

        for pk in candidates {
            match container.upsert(doc, pk).await {
                Ok(_) => return Ok(UpsertResult::Written),
                Err(e) if e.is_conflict() => return Ok(UpsertResult::Conflict),
                Err(e) => {
                    debug!(error = %e, "upsert candidate failed, trying next partition key");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow::anyhow!("no partition-key candidates")))
    }
}

#[async_trait]
impl DocumentStore for CosmosStore {
    async fn find_by_normalized_domain(&self, domain: &str) -> Result<Option<ExistingCompany>> {
        let query = format!(
            "SELECT TOP 1 c.id, c.normalized_domain FROM c \
             WHERE {NOT_DELETED} AND c.normalized_domain = @domain"
        );
        let rows = self
            .container()
            .query(&query, vec![QueryParam::new("@domain", domain)])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| Self::parse_existing(row, DuplicateMatchKey::NormalizedDomain, domain)))
    }

    async fn find_by_canonical_urls(&self, variants: &[String]) -> Result<Option<ExistingCompany>> {
        if variants.is_empty() {
            return Ok(None);
        }

        let placeholders: Vec<String> = (0..variants.len()).map(|i| format!("@canon{i}")).collect();
        let clause = placeholders.join(", ");
        let query = format!(
            "SELECT TOP 1 c.id, c.normalized_domain FROM c \
             WHERE {NOT_DELETED} AND (c.canonical_url IN ({clause}) OR c.website_url IN ({clause}))"
        );
        let params = variants
            .iter()
            .enumerate()
            .map(|(i, v)| QueryParam::new(format!("@canon{i}"), v.clone()))
            .collect();

        let rows = self.container().query(&query, params).await?;
        Ok(rows.first().and_then(|row| {
            Self::parse_existing(row, DuplicateMatchKey::CanonicalUrl, &variants[0])
        }))
    }

    async fn find_by_company_name(&self, name_lower: &str) -> Result<Option<ExistingCompany>> {
        let query = format!(
            "SELECT TOP 1 c.id, c.normalized_domain FROM c \
             WHERE {NOT_DELETED} AND LOWER(c.company_name) = @name"
        );
        let rows = self
            .container()
            .query(&query, vec![QueryParam::new("@name", name_lower)])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| Self::parse_existing(row, DuplicateMatchKey::CompanyName, name_lower)))
    }

    async fn read_company(&self, id: &str, domain_hint: &str) -> Result<Option<CompanyRecord>> {
        let candidates = Self::pk_candidates(&[domain_hint, id]);
        let Some(doc) = self.read_with_candidates(id, &candidates).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(doc).ok())
    }

    async fn upsert_company(&self, record: &CompanyRecord) -> Result<UpsertResult> {
        let mut doc = serde_json::to_value(record)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(
                "partition_key".to_string(),
                Value::String(record.normalized_domain.clone()),
            );
        }
        let id = record.id.clone().unwrap_or_default();
        let candidates = Self::pk_candidates(&[&record.normalized_domain, &id]);
        self.upsert_with_candidates(&doc, &candidates).await
    }

    async fn read_control_doc(&self, id: &str) -> Result<Option<Value>> {
        let candidates = Self::pk_candidates(&[CONTROL_PARTITION, id]);
        self.read_with_candidates(id, &candidates).await
    }

    async fn upsert_control_doc(&self, doc: &Value) -> Result<()> {
        let id = doc.get("id").and_then(Value::as_str).unwrap_or_default();
        let candidates = Self::pk_candidates(&[CONTROL_PARTITION, id]);
        self.upsert_with_candidates(doc, &candidates).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pk_candidates_dedup_and_end_with_null() {
        let candidates = CosmosStore::pk_candidates(&["acme.com", "acme.com", "", "company_1"]);
        assert_eq!(
            candidates,
            vec![
                Value::String("acme.com".to_string()),
                Value::String("company_1".to_string()),
                Value::Null,
            ]
        );
    }

    #[test]
    fn existing_row_parses_with_match_key() {
        let row = serde_json::json!({ "id": "company_1", "normalized_domain": "acme.com" });
        let existing =
            CosmosStore::parse_existing(&row, DuplicateMatchKey::NormalizedDomain, "acme.com")
                .unwrap();
        assert_eq!(existing.id, "company_1");
        assert_eq!(existing.matched_key, DuplicateMatchKey::NormalizedDomain);
    }
}
