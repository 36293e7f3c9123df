//! Amazon DocumentDB through the MongoDB driver
//!
//! Connections are opened with `connect` and referenced by id. Filters,
//! documents and pipelines are accepted as Extended JSON; results come back
//! as relaxed Extended JSON.

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::config::DocumentDbConfig;
use crate::core::pool::ConnectionPool;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::info;

const DEFAULT_FIND_LIMIT: i64 = 10;
const MAX_FIND_LIMIT: i64 = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of documents to return: `default` when unset, otherwise clamped to `1..=1000`
fn result_limit(requested: Option<i64>, default: i64) -> i64 {
    requested.unwrap_or(default).clamp(1, MAX_FIND_LIMIT)
}

/// Convert an Extended JSON object into a BSON document
pub fn to_document(name: &str, value: Value) -> Result<Document, ServiceError> {
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(_) => Err(ServiceError::invalid(format!("{} must be an object", name))),
        Err(e) => Err(ServiceError::invalid(format!("{} is not valid Extended JSON: {}", name, e))),
    }
}

fn optional_document(name: &str, value: Option<Value>) -> Result<Document, ServiceError> {
    match value {
        None | Some(Value::Null) => Ok(Document::new()),
        Some(value) => to_document(name, value),
    }
}

/// Relaxed Extended JSON view of a document
pub fn to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

/// Hide the password part of a connection string
pub fn redact(connection_string: &str) -> String {
    let Some((scheme, rest)) = connection_string.split_once("://") else {
        return connection_string.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => connection_string.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    connection_string: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionParams {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct DatabaseParams {
    connection_id: String,
    database: String,
}

#[derive(Debug, Deserialize)]
struct FindParams {
    connection_id: String,
    database: String,
    collection: String,
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    projection: Option<Value>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CountParams {
    connection_id: String,
    database: String,
    collection: String,
    #[serde(default)]
    query: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AggregateParams {
    connection_id: String,
    database: String,
    collection: String,
    pipeline: Vec<Value>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InsertParams {
    connection_id: String,
    database: String,
    collection: String,
    documents: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    connection_id: String,
    database: String,
    collection: String,
    filter: Value,
    update: Value,
    #[serde(default)]
    many: bool,
    #[serde(default)]
    upsert: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    connection_id: String,
    database: String,
    collection: String,
    filter: Value,
    #[serde(default)]
    many: bool,
}

/// DocumentDB server
pub struct DocumentDbService {
    pool: ConnectionPool<Client>,
    config: DocumentDbConfig,
}

impl DocumentDbService {
    pub fn new(pool: ConnectionPool<Client>, config: DocumentDbConfig) -> Self {
        Self { pool, config }
    }

    fn ensure_writable(&self, tool: &str) -> Result<(), ServiceError> {
        if self.config.readonly {
            return Err(ServiceError::Forbidden(format!(
                "{} is disabled in read-only mode; restart with --allow-write",
                tool
            )));
        }
        Ok(())
    }

    async fn client(&self, connection_id: &str) -> Result<Client, ServiceError> {
        // Client is a cheap handle over the driver's own pool
        let handle = self.pool.get(connection_id).await?;
        let client = handle.lock().await.clone();
        Ok(client)
    }

    async fn collection(
        &self,
        connection_id: &str,
        database: &str,
        collection: &str,
    ) -> Result<Collection<Document>, ServiceError> {
        require_non_empty("database", database)?;
        require_non_empty("collection", collection)?;
        Ok(self
            .client(connection_id)
            .await?
            .database(database)
            .collection(collection))
    }

    async fn connect(&self, p: ConnectParams) -> Result<Value, ServiceError> {
        let connection_string = p
            .connection_string
            .filter(|c| !c.is_empty())
            .or_else(|| self.config.connection_string.clone())
            .ok_or_else(|| {
                ServiceError::invalid(
                    "no connection_string given and DOCUMENTDB_CONNECTION_STRING is not set",
                )
            })?;

        let mut options = ClientOptions::parse(&connection_string)
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        options.app_name.get_or_insert_with(|| "documentdb-mcp-server".to_string());
        let client = Client::with_options(options).map_err(|e| ServiceError::Connection(e.to_string()))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let target = redact(&connection_string);
        let connection_id = self.pool.insert(target.clone(), client).await?;
        info!("Connected to {} as {}", target, connection_id);
        Ok(json!({
            "connection_id": connection_id,
            "message": "Connected to DocumentDB",
        }))
    }

    async fn disconnect(&self, p: ConnectionParams) -> Result<Value, ServiceError> {
        if !self.pool.remove(&p.connection_id).await {
            return Err(ServiceError::NotFound(format!(
                "connection '{}' does not exist",
                p.connection_id
            )));
        }
        Ok(json!({ "success": true, "message": format!("Closed connection {}", p.connection_id) }))
    }

    async fn list_databases(&self, p: ConnectionParams) -> Result<Value, ServiceError> {
        let names = self.client(&p.connection_id).await?.list_database_names().await?;
        Ok(json!({ "databases": names, "count": names.len() }))
    }

    async fn list_collections(&self, p: DatabaseParams) -> Result<Value, ServiceError> {
        require_non_empty("database", &p.database)?;
        let names = self
            .client(&p.connection_id)
            .await?
            .database(&p.database)
            .list_collection_names()
            .await?;
        Ok(json!({ "database": p.database, "collections": names, "count": names.len() }))
    }

    async fn find(&self, p: FindParams) -> Result<Value, ServiceError> {
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let filter = optional_document("query", p.query)?;
        let limit = result_limit(p.limit, DEFAULT_FIND_LIMIT);

        let mut find = collection.find(filter).limit(limit);
        if let Some(projection) = p.projection.filter(|v| !v.is_null()) {
            find = find.projection(to_document("projection", projection)?);
        }
        let documents: Vec<Document> = find.await?.try_collect().await?;
        let documents: Vec<Value> = documents.into_iter().map(to_json).collect();
        Ok(json!({ "count": documents.len(), "documents": documents }))
    }

    async fn count_documents(&self, p: CountParams) -> Result<Value, ServiceError> {
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let count = collection
            .count_documents(optional_document("query", p.query)?)
            .await?;
        Ok(json!({ "count": count }))
    }

    async fn aggregate(&self, p: AggregateParams) -> Result<Value, ServiceError> {
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let pipeline = p
            .pipeline
            .into_iter()
            .enumerate()
            .map(|(i, stage)| to_document(&format!("pipeline[{}]", i), stage))
            .collect::<Result<Vec<_>, _>>()?;
        if self.config.readonly
            && pipeline
                .iter()
                .any(|stage| stage.contains_key("$out") || stage.contains_key("$merge"))
        {
            return Err(ServiceError::Forbidden(
                "$out and $merge stages are disabled in read-only mode".to_string(),
            ));
        }

        let limit = result_limit(p.limit, MAX_FIND_LIMIT) as usize;
        let mut cursor = collection.aggregate(pipeline).await?;
        let mut results = Vec::new();
        while results.len() < limit {
            match cursor.try_next().await? {
                Some(doc) => results.push(to_json(doc)),
                None => break,
            }
        }
        Ok(json!({ "count": results.len(), "results": results }))
    }

    async fn insert(&self, p: InsertParams) -> Result<Value, ServiceError> {
        self.ensure_writable("insert")?;
        if p.documents.is_empty() {
            return Err(ServiceError::invalid("documents must not be empty"));
        }
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let documents = p
            .documents
            .into_iter()
            .map(|d| to_document("document", d))
            .collect::<Result<Vec<_>, _>>()?;

        let result = collection.insert_many(documents).await?;
        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        let ids: Vec<Value> = ids.into_iter().map(|(_, id)| id.into_relaxed_extjson()).collect();
        Ok(json!({ "success": true, "inserted_count": ids.len(), "inserted_ids": ids }))
    }

    async fn update(&self, p: UpdateParams) -> Result<Value, ServiceError> {
        self.ensure_writable("update")?;
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let filter = to_document("filter", p.filter)?;
        let update = to_document("update", p.update)?;

        let result = if p.many {
            collection.update_many(filter, update).upsert(p.upsert).await?
        } else {
            collection.update_one(filter, update).upsert(p.upsert).await?
        };
        let mut response = Map::new();
        response.insert("success".into(), json!(true));
        response.insert("matched_count".into(), json!(result.matched_count));
        response.insert("modified_count".into(), json!(result.modified_count));
        if let Some(id) = result.upserted_id {
            response.insert("upserted_id".into(), id.into_relaxed_extjson());
        }
        Ok(Value::Object(response))
    }

    async fn delete(&self, p: DeleteParams) -> Result<Value, ServiceError> {
        self.ensure_writable("delete")?;
        let collection = self.collection(&p.connection_id, &p.database, &p.collection).await?;
        let filter = to_document("filter", p.filter)?;
        if filter.is_empty() && !p.many {
            return Err(ServiceError::invalid(
                "an empty filter deletes an arbitrary document; pass a filter",
            ));
        }
        let result = if p.many {
            collection.delete_many(filter).await?
        } else {
            collection.delete_one(filter).await?
        };
        Ok(json!({ "success": true, "deleted_count": result.deleted_count }))
    }
}

fn collection_schema(extra: Value) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": {
            "connection_id": { "type": "string" },
            "database": { "type": "string" },
            "collection": { "type": "string" }
        },
        "required": ["connection_id", "database", "collection"]
    });
    if let (Some(props), Some(extra)) = (schema["properties"].as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            if key != "required" {
                props.insert(key.clone(), value.clone());
            }
        }
    }
    if let (Some(required), Some(more)) = (
        schema["required"].as_array_mut(),
        extra.get("required").and_then(Value::as_array),
    ) {
        required.extend(more.iter().cloned());
    }
    schema
}

#[async_trait]
impl Service for DocumentDbService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::DocumentDb
    }

    fn instructions(&self) -> Option<String> {
        let mut text = String::from(
            "Query Amazon DocumentDB. Call connect first and pass the returned connection_id to \
             every other tool. Filters and documents use MongoDB Extended JSON.",
        );
        if self.config.readonly {
            text.push_str(" The server is read-only; insert, update and delete are disabled.");
        }
        Some(text)
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "connect",
                "Open a connection to a DocumentDB cluster",
                json!({
                    "type": "object",
                    "properties": {
                        "connection_string": { "type": "string", "description": "mongodb:// URI; defaults to DOCUMENTDB_CONNECTION_STRING" }
                    }
                }),
            ),
            Tool::new(
                "disconnect",
                "Close a connection",
                json!({
                    "type": "object",
                    "properties": { "connection_id": { "type": "string" } },
                    "required": ["connection_id"]
                }),
            ),
            Tool::new(
                "list_databases",
                "List databases",
                json!({
                    "type": "object",
                    "properties": { "connection_id": { "type": "string" } },
                    "required": ["connection_id"]
                }),
            ),
            Tool::new(
                "list_collections",
                "List collections in a database",
                json!({
                    "type": "object",
                    "properties": {
                        "connection_id": { "type": "string" },
                        "database": { "type": "string" }
                    },
                    "required": ["connection_id", "database"]
                }),
            ),
            Tool::new(
                "find",
                "Find documents matching a query",
                collection_schema(json!({
                    "query": { "type": "object" },
                    "projection": { "type": "object" },
                    "limit": { "type": "integer", "default": DEFAULT_FIND_LIMIT, "minimum": 1, "maximum": MAX_FIND_LIMIT }
                })),
            ),
            Tool::new(
                "count_documents",
                "Count documents matching a query",
                collection_schema(json!({ "query": { "type": "object" } })),
            ),
            Tool::new(
                "aggregate",
                "Run an aggregation pipeline",
                collection_schema(json!({
                    "pipeline": { "type": "array", "items": { "type": "object" } },
                    "limit": { "type": "integer", "minimum": 1, "maximum": MAX_FIND_LIMIT },
                    "required": ["pipeline"]
                })),
            ),
            Tool::new(
                "insert",
                "Insert documents",
                collection_schema(json!({
                    "documents": { "type": "array", "items": { "type": "object" } },
                    "required": ["documents"]
                })),
            ),
            Tool::new(
                "update",
                "Update one or many documents",
                collection_schema(json!({
                    "filter": { "type": "object" },
                    "update": { "type": "object", "description": "Update operators, e.g. {\"$set\": {...}}" },
                    "many": { "type": "boolean" },
                    "upsert": { "type": "boolean" },
                    "required": ["filter", "update"]
                })),
            ),
            Tool::new(
                "delete",
                "Delete one or many documents",
                collection_schema(json!({
                    "filter": { "type": "object" },
                    "many": { "type": "boolean" },
                    "required": ["filter"]
                })),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "connect" => self.connect(parse_args(arguments)?).await,
            "disconnect" => self.disconnect(parse_args(arguments)?).await,
            "list_databases" => self.list_databases(parse_args(arguments)?).await,
            "list_collections" => self.list_collections(parse_args(arguments)?).await,
            "find" => self.find(parse_args(arguments)?).await,
            "count_documents" => self.count_documents(parse_args(arguments)?).await,
            "aggregate" => self.aggregate(parse_args(arguments)?).await,
            "insert" => self.insert(parse_args(arguments)?).await,
            "update" => self.update(parse_args(arguments)?).await,
            "delete" => self.delete(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}
