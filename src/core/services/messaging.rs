//! Amazon SNS and SQS
//!
//! Topics and queues created here are tagged with the server version;
//! deleting a topic or queue is only allowed when that tag is present so the
//! agent cannot remove resources it did not create.

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions, Pagination};
use crate::core::constants::tag;
use crate::core::server::SERVER_VERSION;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::core::services::put;
use crate::models::mcp::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::{info, warn};

const FIFO_SUFFIX: &str = ".fifo";

#[derive(Debug, Deserialize)]
struct CreateParams {
    name: String,
    #[serde(default)]
    fifo: bool,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    topic_arn: String,
    message: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message_group_id: Option<String>,
    #[serde(default)]
    message_deduplication_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    topic_arn: String,
    protocol: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TopicParams {
    topic_arn: String,
}

#[derive(Debug, Deserialize)]
struct ListQueuesParams {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    queue_url: String,
    message_body: String,
    #[serde(default)]
    delay_seconds: Option<u32>,
    #[serde(default)]
    message_group_id: Option<String>,
    #[serde(default)]
    message_deduplication_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    queue_url: String,
    #[serde(default)]
    max_number_of_messages: Option<u32>,
    #[serde(default)]
    wait_time_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DeleteMessageParams {
    queue_url: String,
    receipt_handle: String,
}

#[derive(Debug, Deserialize)]
struct QueueParams {
    queue_url: String,
}

/// Apply the `.fifo` naming rule
fn resource_name(name: &str, fifo: bool) -> Result<String, ServiceError> {
    require_non_empty("name", name)?;
    if fifo && !name.ends_with(FIFO_SUFFIX) {
        Ok(format!("{}{}", name, FIFO_SUFFIX))
    } else if !fifo && name.ends_with(FIFO_SUFFIX) {
        Err(ServiceError::invalid(format!(
            "'{}' ends with {} but fifo is false; set fifo to true",
            name, FIFO_SUFFIX
        )))
    } else {
        Ok(name.to_string())
    }
}

/// SNS/SQS server
pub struct MessagingService {
    aws: AwsCli,
    allow_resource_creation: bool,
}

impl MessagingService {
    pub fn new(aws: AwsCli, allow_resource_creation: bool) -> Self {
        Self {
            aws,
            allow_resource_creation,
        }
    }

    fn ensure_creation_allowed(&self, what: &str) -> Result<(), ServiceError> {
        if self.allow_resource_creation {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "creating {} is disabled (--disallow-resource-creation)",
                what
            )))
        }
    }

    async fn sns(&self, operation: &str, params: Value) -> Result<Value, ServiceError> {
        self.aws.call(&CallOptions::default(), "sns", operation, params).await
    }

    async fn sqs(&self, operation: &str, params: Value) -> Result<Value, ServiceError> {
        self.aws.call(&CallOptions::default(), "sqs", operation, params).await
    }

    async fn create_topic(&self, params: CreateParams) -> Result<Value, ServiceError> {
        self.ensure_creation_allowed("topics")?;
        let name = resource_name(&params.name, params.fifo)?;
        let mut attributes = params.attributes;
        if params.fifo {
            attributes.insert("FifoTopic".to_string(), "true".to_string());
        }

        info!("Creating SNS topic {}", name);
        let response = self
            .sns(
                "create-topic",
                json!({
                    "Name": name,
                    "Attributes": attributes,
                    "Tags": [{ "Key": tag::MCP_SERVER_VERSION, "Value": SERVER_VERSION }],
                }),
            )
            .await?;
        Ok(json!({ "topic_arn": response["TopicArn"] }))
    }

    async fn list_topics(&self) -> Result<Value, ServiceError> {
        let topics = self
            .aws
            .paginate(
                &CallOptions::default(),
                "sns",
                "list-topics",
                json!({}),
                Pagination::next_token("Topics", None),
            )
            .await?;
        let arns: Vec<Value> = topics.iter().map(|t| t["TopicArn"].clone()).collect();
        Ok(json!({ "topics": arns }))
    }

    async fn publish(&self, params: PublishParams) -> Result<Value, ServiceError> {
        require_non_empty("topic_arn", &params.topic_arn)?;
        if params.topic_arn.ends_with(FIFO_SUFFIX) && params.message_group_id.is_none() {
            return Err(ServiceError::invalid("message_group_id is required for FIFO topics"));
        }
        let mut request = Map::new();
        request.insert("TopicArn".into(), json!(params.topic_arn));
        request.insert("Message".into(), json!(params.message));
        put(&mut request, "Subject", params.subject)?;
        put(&mut request, "MessageGroupId", params.message_group_id)?;
        put(&mut request, "MessageDeduplicationId", params.message_deduplication_id)?;

        let response = self.sns("publish", Value::Object(request)).await?;
        Ok(json!({
            "message_id": response["MessageId"],
            "sequence_number": response["SequenceNumber"],
        }))
    }

    async fn subscribe(&self, params: SubscribeParams) -> Result<Value, ServiceError> {
        require_non_empty("protocol", &params.protocol)?;
        require_non_empty("endpoint", &params.endpoint)?;
        let response = self
            .sns(
                "subscribe",
                json!({
                    "TopicArn": params.topic_arn,
                    "Protocol": params.protocol,
                    "Endpoint": params.endpoint,
                    "ReturnSubscriptionArn": true,
                }),
            )
            .await?;
        Ok(json!({ "subscription_arn": response["SubscriptionArn"] }))
    }

    async fn delete_topic(&self, params: TopicParams) -> Result<Value, ServiceError> {
        let tags = self
            .sns("list-tags-for-resource", json!({ "ResourceArn": params.topic_arn }))
            .await?;
        let tagged = tags["Tags"]
            .as_array()
            .map(|tags| tags.iter().any(|t| t["Key"] == tag::MCP_SERVER_VERSION))
            .unwrap_or(false);
        if !tagged {
            warn!("Refusing to delete untagged topic {}", params.topic_arn);
            return Err(untagged("topic", &params.topic_arn));
        }

        info!("Deleting SNS topic {}", params.topic_arn);
        self.sns("delete-topic", json!({ "TopicArn": params.topic_arn })).await?;
        Ok(json!({ "deleted": params.topic_arn }))
    }

    async fn create_queue(&self, params: CreateParams) -> Result<Value, ServiceError> {
        self.ensure_creation_allowed("queues")?;
        let name = resource_name(&params.name, params.fifo)?;
        let mut attributes = params.attributes;
        if params.fifo {
            attributes.insert("FifoQueue".to_string(), "true".to_string());
        }

        info!("Creating SQS queue {}", name);
        let mut request = Map::new();
        request.insert("QueueName".into(), json!(name));
        if !attributes.is_empty() {
            request.insert("Attributes".into(), json!(attributes));
        }
        request.insert("tags".into(), json!({ (tag::MCP_SERVER_VERSION): SERVER_VERSION }));

        let response = self.sqs("create-queue", Value::Object(request)).await?;
        Ok(json!({ "queue_url": response["QueueUrl"] }))
    }

    async fn list_queues(&self, params: ListQueuesParams) -> Result<Value, ServiceError> {
        let mut request = Map::new();
        put(&mut request, "QueueNamePrefix", params.prefix)?;
        let urls = self
            .aws
            .paginate(
                &CallOptions::default(),
                "sqs",
                "list-queues",
                Value::Object(request),
                Pagination::next_token("QueueUrls", None),
            )
            .await?;
        Ok(json!({ "queue_urls": urls }))
    }

    async fn send_message(&self, params: SendParams) -> Result<Value, ServiceError> {
        require_non_empty("queue_url", &params.queue_url)?;
        if params.queue_url.ends_with(FIFO_SUFFIX) && params.message_group_id.is_none() {
            return Err(ServiceError::invalid("message_group_id is required for FIFO queues"));
        }
        if params.delay_seconds.is_some_and(|d| d > 900) {
            return Err(ServiceError::invalid("delay_seconds must be between 0 and 900"));
        }
        let mut request = Map::new();
        request.insert("QueueUrl".into(), json!(params.queue_url));
        request.insert("MessageBody".into(), json!(params.message_body));
        put(&mut request, "DelaySeconds", params.delay_seconds)?;
        put(&mut request, "MessageGroupId", params.message_group_id)?;
        put(&mut request, "MessageDeduplicationId", params.message_deduplication_id)?;

        let response = self.sqs("send-message", Value::Object(request)).await?;
        Ok(json!({
            "message_id": response["MessageId"],
            "md5_of_message_body": response["MD5OfMessageBody"],
            "sequence_number": response["SequenceNumber"],
        }))
    }

    async fn receive_message(&self, params: ReceiveParams) -> Result<Value, ServiceError> {
        let max = params.max_number_of_messages.unwrap_or(1);
        if !(1..=10).contains(&max) {
            return Err(ServiceError::invalid("max_number_of_messages must be between 1 and 10"));
        }
        let wait = params.wait_time_seconds.unwrap_or(0);
        if wait > 20 {
            return Err(ServiceError::invalid("wait_time_seconds must be between 0 and 20"));
        }

        let response = self
            .sqs(
                "receive-message",
                json!({
                    "QueueUrl": params.queue_url,
                    "MaxNumberOfMessages": max,
                    "WaitTimeSeconds": wait,
                    "MessageSystemAttributeNames": ["All"],
                }),
            )
            .await?;
        let messages: Vec<Value> = response["Messages"]
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| {
                        json!({
                            "message_id": m["MessageId"],
                            "receipt_handle": m["ReceiptHandle"],
                            "body": m["Body"],
                            "attributes": m["Attributes"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "messages": messages }))
    }

    async fn delete_message(&self, params: DeleteMessageParams) -> Result<Value, ServiceError> {
        require_non_empty("receipt_handle", &params.receipt_handle)?;
        self.sqs(
            "delete-message",
            json!({ "QueueUrl": params.queue_url, "ReceiptHandle": params.receipt_handle }),
        )
        .await?;
        Ok(json!({ "deleted": true }))
    }

    async fn delete_queue(&self, params: QueueParams) -> Result<Value, ServiceError> {
        let tags = self
            .sqs("list-queue-tags", json!({ "QueueUrl": params.queue_url }))
            .await?;
        if tags["Tags"].get(tag::MCP_SERVER_VERSION).is_none() {
            warn!("Refusing to delete untagged queue {}", params.queue_url);
            return Err(untagged("queue", &params.queue_url));
        }

        info!("Deleting SQS queue {}", params.queue_url);
        self.sqs("delete-queue", json!({ "QueueUrl": params.queue_url })).await?;
        Ok(json!({ "deleted": params.queue_url }))
    }
}

fn untagged(kind: &str, id: &str) -> ServiceError {
    ServiceError::Forbidden(format!(
        "{} {} was not created by this server (missing '{}' tag)",
        kind,
        id,
        tag::MCP_SERVER_VERSION
    ))
}

fn create_schema(kind: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "description": format!("{} name", kind) },
            "fifo": { "type": "boolean", "description": "Create a FIFO resource; '.fifo' is appended to the name" },
            "attributes": { "type": "object", "additionalProperties": { "type": "string" } }
        },
        "required": ["name"]
    })
}

#[async_trait]
impl Service for MessagingService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::SnsSqs
    }

    fn instructions(&self) -> Option<String> {
        Some(
            "Publish and consume messages with Amazon SNS and SQS. Only topics and queues created \
             through this server can be deleted."
                .to_string(),
        )
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new("create_topic", "Create an SNS topic", create_schema("Topic")),
            Tool::new("list_topics", "List SNS topic ARNs", json!({ "type": "object", "properties": {} })),
            Tool::new(
                "publish",
                "Publish a message to an SNS topic",
                json!({
                    "type": "object",
                    "properties": {
                        "topic_arn": { "type": "string" },
                        "message": { "type": "string" },
                        "subject": { "type": "string" },
                        "message_group_id": { "type": "string", "description": "Required for FIFO topics" },
                        "message_deduplication_id": { "type": "string" }
                    },
                    "required": ["topic_arn", "message"]
                }),
            ),
            Tool::new(
                "subscribe",
                "Subscribe an endpoint to an SNS topic",
                json!({
                    "type": "object",
                    "properties": {
                        "topic_arn": { "type": "string" },
                        "protocol": { "type": "string", "description": "sqs, lambda, email, https, ..." },
                        "endpoint": { "type": "string" }
                    },
                    "required": ["topic_arn", "protocol", "endpoint"]
                }),
            ),
            Tool::new(
                "delete_topic",
                "Delete an SNS topic created by this server",
                json!({
                    "type": "object",
                    "properties": { "topic_arn": { "type": "string" } },
                    "required": ["topic_arn"]
                }),
            ),
            Tool::new("create_queue", "Create an SQS queue", create_schema("Queue")),
            Tool::new(
                "list_queues",
                "List SQS queue URLs",
                json!({
                    "type": "object",
                    "properties": { "prefix": { "type": "string" } }
                }),
            ),
            Tool::new(
                "send_message",
                "Send a message to an SQS queue",
                json!({
                    "type": "object",
                    "properties": {
                        "queue_url": { "type": "string" },
                        "message_body": { "type": "string" },
                        "delay_seconds": { "type": "integer", "minimum": 0, "maximum": 900 },
                        "message_group_id": { "type": "string", "description": "Required for FIFO queues" },
                        "message_deduplication_id": { "type": "string" }
                    },
                    "required": ["queue_url", "message_body"]
                }),
            ),
            Tool::new(
                "receive_message",
                "Receive messages from an SQS queue",
                json!({
                    "type": "object",
                    "properties": {
                        "queue_url": { "type": "string" },
                        "max_number_of_messages": { "type": "integer", "minimum": 1, "maximum": 10 },
                        "wait_time_seconds": { "type": "integer", "minimum": 0, "maximum": 20 }
                    },
                    "required": ["queue_url"]
                }),
            ),
            Tool::new(
                "delete_message",
                "Delete a received message from an SQS queue",
                json!({
                    "type": "object",
                    "properties": {
                        "queue_url": { "type": "string" },
                        "receipt_handle": { "type": "string" }
                    },
                    "required": ["queue_url", "receipt_handle"]
                }),
            ),
            Tool::new(
                "delete_queue",
                "Delete an SQS queue created by this server",
                json!({
                    "type": "object",
                    "properties": { "queue_url": { "type": "string" } },
                    "required": ["queue_url"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "create_topic" => self.create_topic(parse_args(arguments)?).await,
            "list_topics" => self.list_topics().await,
            "publish" => self.publish(parse_args(arguments)?).await,
            "subscribe" => self.subscribe(parse_args(arguments)?).await,
            "delete_topic" => self.delete_topic(parse_args(arguments)?).await,
            "create_queue" => self.create_queue(parse_args(arguments)?).await,
            "list_queues" => self.list_queues(parse_args(arguments)?).await,
            "send_message" => self.send_message(parse_args(arguments)?).await,
            "receive_message" => self.receive_message(parse_args(arguments)?).await,
            "delete_message" => self.delete_message(parse_args(arguments)?).await,
            "delete_queue" => self.delete_queue(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;
    use crate::core::config::AwsConfig;
    use std::sync::Arc;

    fn service(runner: Arc<MockRunner>, allow_creation: bool) -> MessagingService {
        MessagingService::new(AwsCli::new(runner, &AwsConfig::default()), allow_creation)
    }

    fn input_json(runner: &MockRunner, n: usize) -> Value {
        let args = runner.args(n);
        let at = args.iter().position(|a| a == "--cli-input-json").unwrap();
        serde_json::from_str(&args[at + 1]).unwrap()
    }

    #[test]
    fn test_resource_name() {
        assert_eq!(resource_name("orders", true).unwrap(), "orders.fifo");
        assert_eq!(resource_name("orders.fifo", true).unwrap(), "orders.fifo");
        assert_eq!(resource_name("orders", false).unwrap(), "orders");
        assert!(resource_name("orders.fifo", false).is_err());
    }

    #[tokio::test]
    async fn test_create_fifo_topic_is_tagged() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"TopicArn": "arn:aws:sns:us-east-1:1:orders.fifo"}"#);
        let svc = service(runner.clone(), true);
        let result = svc
            .call_tool("create_topic", json!({"name": "orders", "fifo": true}))
            .await
            .unwrap();
        assert_eq!(result["topic_arn"], "arn:aws:sns:us-east-1:1:orders.fifo");

        let input = input_json(&runner, 0);
        assert_eq!(input["Name"], "orders.fifo");
        assert_eq!(input["Attributes"]["FifoTopic"], "true");
        assert_eq!(input["Tags"][0]["Key"], tag::MCP_SERVER_VERSION);
    }

    #[tokio::test]
    async fn test_creation_can_be_disabled() {
        let runner = Arc::new(MockRunner::new());
        let svc = service(runner.clone(), false);
        let err = svc.call_tool("create_queue", json!({"name": "q"})).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_queue_uses_tag_map() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"QueueUrl": "https://sqs/1/q"}"#);
        let svc = service(runner.clone(), true);
        svc.call_tool("create_queue", json!({"name": "q"})).await.unwrap();
        let input = input_json(&runner, 0);
        assert_eq!(input["tags"][tag::MCP_SERVER_VERSION], SERVER_VERSION);
        assert!(input.get("Attributes").is_none());
    }

    #[tokio::test]
    async fn test_delete_untagged_topic_refused() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"Tags": [{"Key": "team", "Value": "x"}]}"#);
        let svc = service(runner.clone(), true);
        let err = svc
            .call_tool("delete_topic", json!({"topic_arn": "arn:t"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_tagged_queue() {
        let runner = Arc::new(MockRunner::new());
        runner
            .push_ok(r#"{"Tags": {"mcp_server_version": "0.1.0"}}"#)
            .push_ok("");
        let svc = service(runner.clone(), true);
        let result = svc
            .call_tool("delete_queue", json!({"queue_url": "https://sqs/1/q"}))
            .await
            .unwrap();
        assert_eq!(result["deleted"], "https://sqs/1/q");
        assert_eq!(&runner.args(1)[..2], ["sqs", "delete-queue"]);
    }

    #[tokio::test]
    async fn test_fifo_send_requires_group() {
        let svc = service(Arc::new(MockRunner::new()), true);
        let err = svc
            .call_tool(
                "send_message",
                json!({"queue_url": "https://sqs/1/q.fifo", "message_body": "hi"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_receive_message_reshapes() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(
            r#"{"Messages": [{"MessageId": "m1", "ReceiptHandle": "r1", "Body": "hello", "Attributes": {"SenderId": "x"}}]}"#,
        );
        let svc = service(runner.clone(), true);
        let result = svc
            .call_tool("receive_message", json!({"queue_url": "https://sqs/1/q", "max_number_of_messages": 5}))
            .await
            .unwrap();
        assert_eq!(result["messages"][0]["receipt_handle"], "r1");
        assert_eq!(input_json(&runner, 0)["MaxNumberOfMessages"], 5);

        let err = svc
            .call_tool("receive_message", json!({"queue_url": "u", "max_number_of_messages": 11}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }
}
