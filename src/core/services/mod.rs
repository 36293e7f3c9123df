//! Server implementations

pub mod cloudformation;
pub mod documentdb;
pub mod ecs;
pub mod finch;
pub mod kendra;
pub mod memcached;
pub mod messaging;
pub mod neptune;
pub mod sam;
pub mod terraform;
pub mod valkey;

pub use cloudformation::CloudFormationService;
pub use documentdb::DocumentDbService;
pub use ecs::EcsService;
pub use finch::FinchService;
pub use kendra::KendraService;
pub use memcached::MemcachedService;
pub use messaging::MessagingService;
pub use neptune::NeptuneService;
pub use sam::SamService;
pub use terraform::TerraformService;
pub use valkey::ValkeyService;

use crate::core::aws_cli::AwsCli;
use crate::core::command::CommandRunner;
use crate::core::config::{CacheConfig, Config};
use crate::core::pool::ConnectionPool;
use crate::core::schema_cache::SchemaCache;
use crate::core::service::{Service, ServiceError, ServiceKind};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Insert an optional request member, skipping `None`
pub(crate) fn put<T: Serialize>(
    map: &mut Map<String, Value>,
    key: &str,
    value: Option<T>,
) -> Result<(), ServiceError> {
    if let Some(value) = value {
        map.insert(key.to_string(), serde_json::to_value(value)?);
    }
    Ok(())
}

fn pool<C: Send + 'static>(
    max_connections: usize,
    idle_timeout_secs: u64,
    shutdown: &CancellationToken,
) -> ConnectionPool<C> {
    let pool = ConnectionPool::new(max_connections);
    pool.spawn_reaper(Duration::from_secs(idle_timeout_secs), shutdown.child_token());
    pool
}

fn cache_pool<C: Send + 'static>(config: &CacheConfig, shutdown: &CancellationToken) -> ConnectionPool<C> {
    pool(config.max_connections, config.idle_timeout_secs, shutdown)
}

/// Construct the server selected on the command line
///
/// Connection pools get an idle reaper that stops when `shutdown` is
/// cancelled, so this must run inside a tokio runtime.
pub fn build_service(
    kind: ServiceKind,
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn Service>, ServiceError> {
    debug!("Building {} server", kind);
    let aws = AwsCli::new(runner.clone(), &config.aws);

    let service: Arc<dyn Service> = match kind {
        ServiceKind::CloudFormation => {
            let schemas = SchemaCache::new(
                aws.clone(),
                config.schema_cache_dir(),
                config.cfn.schema_refresh_days,
            );
            Arc::new(CloudFormationService::new(aws, schemas, config.cfn.readonly))
        }
        ServiceKind::SnsSqs => Arc::new(MessagingService::new(
            aws,
            config.sns_sqs.allow_resource_creation,
        )),
        ServiceKind::Kendra => Arc::new(KendraService::new(
            aws,
            config.kendra.default_index_id.clone(),
        )),
        ServiceKind::Neptune => Arc::new(NeptuneService::new(
            aws,
            config.neptune.endpoint.as_deref(),
            config.neptune.port,
        )),
        ServiceKind::Ecs => Arc::new(EcsService::new(aws)),
        ServiceKind::Terraform => Arc::new(TerraformService::new(
            runner,
            config.terraform.clone(),
            config.request.timeout_secs,
        )?),
        ServiceKind::Sam => Arc::new(SamService::new(runner, config.sam.clone())),
        ServiceKind::Finch => Arc::new(FinchService::new(runner, aws, &config.finch)),
        ServiceKind::DocumentDb => {
            let docdb = &config.documentdb;
            Arc::new(DocumentDbService::new(
                pool(docdb.max_connections, docdb.idle_timeout_secs, shutdown),
                docdb.clone(),
            ))
        }
        ServiceKind::Valkey => Arc::new(ValkeyService::new(
            cache_pool(&config.valkey, shutdown),
            config.valkey.clone(),
        )),
        ServiceKind::Memcached => Arc::new(MemcachedService::new(
            cache_pool(&config.memcached, shutdown),
            config.memcached.clone(),
        )),
    };
    Ok(service)
}
