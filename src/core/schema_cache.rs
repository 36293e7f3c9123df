//! CloudFormation resource-type schema cache
//!
//! Schemas are fetched with `cloudformation describe-type` and kept both in
//! memory and as JSON files under `<cache_dir>/<region>/<Service__Provider__Type>.json`.
//! Each file records when it was fetched; entries older than the refresh
//! interval are fetched again on next use.

use crate::core::aws_cli::{AwsCli, CallOptions};
use crate::core::service::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Region used when neither the call nor the configuration names one
pub const FALLBACK_REGION: &str = "us-east-1";

/// One cached schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSchema {
    pub type_name: String,
    pub region: String,
    pub last_updated: DateTime<Utc>,
    pub schema: Value,
}

/// Validate a resource type name such as `AWS::S3::Bucket`
pub fn validate_type_name(type_name: &str) -> Result<(), ServiceError> {
    let parts: Vec<&str> = type_name.split("::").collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::invalid(format!(
            "invalid resource type '{}'; expected the form Service::Provider::Resource, e.g. AWS::S3::Bucket",
            type_name
        )))
    }
}

/// Validate a region name such as `eu-west-1`; it becomes a cache directory name
pub fn validate_region(region: &str) -> Result<(), ServiceError> {
    let valid = !region.is_empty()
        && region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::invalid(format!(
            "invalid region '{}'; expected a name such as us-east-1",
            region
        )))
    }
}

/// File name for a type, e.g. `AWS__S3__Bucket.json`
fn file_name(type_name: &str) -> String {
    format!("{}.json", type_name.replace("::", "__"))
}

/// Schema cache backed by memory and the filesystem
pub struct SchemaCache {
    aws: AwsCli,
    dir: PathBuf,
    max_age: chrono::Duration,
    entries: Mutex<HashMap<(String, String), CachedSchema>>,
}

impl SchemaCache {
    pub fn new(aws: AwsCli, dir: impl Into<PathBuf>, refresh_days: u64) -> Self {
        Self {
            aws,
            dir: dir.into(),
            max_age: i64::try_from(refresh_days)
                .ok()
                .and_then(chrono::Duration::try_days)
                .unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve the region a call should use
    pub fn resolve_region(&self, region: Option<&str>) -> String {
        region
            .filter(|r| !r.is_empty())
            .or(self.aws.default_region())
            .unwrap_or(FALLBACK_REGION)
            .to_string()
    }

    fn is_fresh(&self, entry: &CachedSchema) -> bool {
        Utc::now() - entry.last_updated < self.max_age
    }

    fn path_for(&self, region: &str, type_name: &str) -> PathBuf {
        self.dir.join(region).join(file_name(type_name))
    }

    /// Return the schema for a resource type, fetching it when stale
    pub async fn get_schema(&self, type_name: &str, region: Option<&str>) -> Result<Value, ServiceError> {
        validate_type_name(type_name)?;
        let region = self.resolve_region(region);
        validate_region(&region)?;
        let key = (region.clone(), type_name.to_string());

        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry) {
                    debug!("Schema cache hit for {} in {}", type_name, region);
                    return Ok(entry.schema.clone());
                }
            }
        }

        if let Some(entry) = self.load_from_disk(&region, type_name).await {
            if self.is_fresh(&entry) {
                let schema = entry.schema.clone();
                self.entries.lock().await.insert(key, entry);
                return Ok(schema);
            }
        }

        let entry = self.fetch(type_name, &region).await?;
        self.persist(&entry).await;
        let schema = entry.schema.clone();
        self.entries.lock().await.insert(key, entry);
        Ok(schema)
    }

    async fn load_from_disk(&self, region: &str, type_name: &str) -> Option<CachedSchema> {
        let path = self.path_for(region, type_name);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<CachedSchema>(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Ignoring corrupt schema cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn fetch(&self, type_name: &str, region: &str) -> Result<CachedSchema, ServiceError> {
        info!("Fetching schema for {} in {}", type_name, region);
        let response = self
            .aws
            .call(
                &CallOptions::region(Some(region.to_string())),
                "cloudformation",
                "describe-type",
                json!({ "Type": "RESOURCE", "TypeName": type_name }),
            )
            .await?;

        let raw = response
            .get("Schema")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Unexpected(format!("no schema returned for {}", type_name)))?;
        let schema: Value = serde_json::from_str(raw)?;

        Ok(CachedSchema {
            type_name: type_name.to_string(),
            region: region.to_string(),
            last_updated: Utc::now(),
            schema,
        })
    }

    /// Write an entry to disk; failures only cost a refetch later
    async fn persist(&self, entry: &CachedSchema) {
        let path = self.path_for(&entry.region, &entry.type_name);
        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let body = serde_json::to_vec_pretty(entry)?;
            tokio::fs::write(&path, body).await?;
            Ok::<_, ServiceError>(())
        };
        if let Err(e) = write.await {
            warn!("Could not write schema cache {}: {}", path.display(), e);
        }
    }

    /// Every schema present on disk, as `(region, type_name, last_updated)`
    pub async fn cached_entries(&self) -> Vec<(String, String, DateTime<Utc>)> {
        let mut found = Vec::new();
        let Ok(mut regions) = tokio::fs::read_dir(&self.dir).await else {
            return found;
        };
        while let Ok(Some(region_dir)) = regions.next_entry().await {
            let Ok(mut files) = tokio::fs::read_dir(region_dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let Ok(content) = tokio::fs::read_to_string(file.path()).await else {
                    continue;
                };
                if let Ok(entry) = serde_json::from_str::<CachedSchema>(&content) {
                    found.push((entry.region, entry.type_name, entry.last_updated));
                }
            }
        }
        found.sort();
        found
    }
}
