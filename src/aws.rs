//! S3-backed blob storage and DynamoDB-backed metadata storage. The
//! conditional expressions here are the whole concurrency story: there are
//! no locks, only `attribute_not_exists` and execution-id equality guards.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::SecondsFormat;
use tokio::io::AsyncRead;

use crate::meta::{
    ImageInfoItem, ImageKey, LayerProgress, LayerProgressKey, MetadataStore, Status,
};
use crate::store::BlobStore;
use crate::{error, Result};

/// Blob store over an S3 bucket
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

fn upstream<E: std::fmt::Display>(e: E) -> error::Error {
    error::Error::Upstream {
        reason: e.to_string(),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(upstream)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(upstream)?;
        debug!(target: "store", "stored s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(upstream)?;
        debug!(target: "store", "stored s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return error::BlobNotFoundSnafu {
                    key: key.to_string(),
                }
                .fail()
            }
            Err(e) => return Err(upstream(e)),
        };
        let bytes = output.body.collect().await.map_err(upstream)?;
        Ok(bytes.into_bytes())
    }

    async fn get_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return error::BlobNotFoundSnafu {
                    key: key.to_string(),
                }
                .fail()
            }
            Err(e) => return Err(upstream(e)),
        };
        Ok(Box::new(output.body.into_async_read()))
    }
}

/// Metadata store over a DynamoDB table with the composite `pk`/`sk` scheme
#[derive(Debug, Clone)]
pub struct DynamoMetadataStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoMetadataStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub async fn from_env(table: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(aws_sdk_dynamodb::Client::new(&config), table)
    }

    fn image_item(item: &ImageInfoItem) -> HashMap<String, AttributeValue> {
        let mut map = HashMap::new();
        map.insert("pk".to_string(), AttributeValue::S(item.key.pk()));
        map.insert("sk".to_string(), AttributeValue::S(item.key.sk()));
        map.insert(
            "Tags".to_string(),
            AttributeValue::L(
                item.tags
                    .iter()
                    .map(|t| AttributeValue::S(t.clone()))
                    .collect(),
            ),
        );
        map.insert(
            "TotalSize".to_string(),
            AttributeValue::N(item.total_size.to_string()),
        );
        map.insert(
            "Duration".to_string(),
            AttributeValue::N(item.duration.to_string()),
        );
        map.insert(
            "Retrieved".to_string(),
            AttributeValue::S(item.retrieved.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        map.insert(
            "ExecutionId".to_string(),
            AttributeValue::S(item.execution_id.clone()),
        );
        map.insert(
            "Status".to_string(),
            AttributeValue::S(status_string(item.status)),
        );
        if let Some(manifest) = item.manifest.as_ref() {
            map.insert(
                "Manifest".to_string(),
                AttributeValue::B(Blob::new(manifest.clone())),
            );
        }
        if let Some(raw_config) = item.raw_config.as_ref() {
            map.insert(
                "RawConfig".to_string(),
                AttributeValue::B(Blob::new(raw_config.clone())),
            );
        }
        map.insert("ttl".to_string(), AttributeValue::N(item.ttl.to_string()));
        map.insert("v".to_string(), AttributeValue::N(item.v.to_string()));
        map
    }

    fn progress_item(progress: &LayerProgress) -> HashMap<String, AttributeValue> {
        let mut map = HashMap::new();
        map.insert("pk".to_string(), AttributeValue::S(progress.key.pk()));
        map.insert("sk".to_string(), AttributeValue::S(progress.key.sk()));
        map.insert(
            "TotalBytes".to_string(),
            AttributeValue::N(progress.total_bytes.to_string()),
        );
        map.insert(
            "CompletedBytes".to_string(),
            AttributeValue::N(progress.completed_bytes.to_string()),
        );
        map.insert(
            "TotalFiles".to_string(),
            AttributeValue::N(progress.total_files.to_string()),
        );
        map.insert(
            "CompletedFiles".to_string(),
            AttributeValue::N(progress.completed_files.to_string()),
        );
        map.insert("ttl".to_string(), AttributeValue::N(progress.ttl.to_string()));
        map.insert("v".to_string(), AttributeValue::N(progress.v.to_string()));
        map
    }

    fn key_attrs(pk: String, sk: String) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("pk".to_string(), AttributeValue::S(pk)),
            ("sk".to_string(), AttributeValue::S(sk)),
        ])
    }
}

fn status_string(status: Status) -> String {
    match status {
        Status::Pending => "PENDING",
        Status::Running => "RUNNING",
        Status::Succeeded => "SUCCEEDED",
        Status::Failed => "FAILED",
    }
    .to_string()
}

fn parse_status(value: &str) -> Status {
    match value {
        "RUNNING" => Status::Running,
        "SUCCEEDED" => Status::Succeeded,
        "FAILED" => Status::Failed,
        _ => Status::Pending,
    }
}

fn attr_s(map: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.as_s().ok()).cloned()
}

fn attr_n(map: &HashMap<String, AttributeValue>, key: &str) -> u64 {
    map.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or_default()
}

fn attr_b(map: &HashMap<String, AttributeValue>, key: &str) -> Option<Vec<u8>> {
    map.get(key)
        .and_then(|v| v.as_b().ok())
        .map(|b| b.as_ref().to_vec())
}

fn parse_image_item(map: &HashMap<String, AttributeValue>) -> Result<ImageInfoItem> {
    let pk = attr_s(map, "pk").unwrap_or_default();
    let sk = attr_s(map, "sk").unwrap_or_default();
    let repo = pk.strip_prefix("image#").unwrap_or(&pk).to_string();
    let digest = sk.strip_prefix("digest#").unwrap_or(&sk).to_string();

    let tags = map
        .get("Tags")
        .and_then(|v| v.as_l().ok())
        .map(|l| {
            l.iter()
                .filter_map(|t| t.as_s().ok())
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let retrieved = attr_s(map, "Retrieved")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_default();

    Ok(ImageInfoItem {
        key: ImageKey::new(repo, digest),
        tags,
        total_size: attr_n(map, "TotalSize"),
        duration: attr_n(map, "Duration"),
        retrieved,
        execution_id: attr_s(map, "ExecutionId").unwrap_or_default(),
        status: parse_status(attr_s(map, "Status").unwrap_or_default().as_str()),
        manifest: attr_b(map, "Manifest"),
        raw_config: attr_b(map, "RawConfig"),
        ttl: attr_n(map, "ttl") as i64,
        v: attr_n(map, "v") as u32,
    })
}

fn parse_progress_item(map: &HashMap<String, AttributeValue>) -> Option<LayerProgress> {
    let pk = attr_s(map, "pk")?;
    let sk = attr_s(map, "sk")?;
    let repo = pk.strip_prefix("image#")?.to_string();
    // sk shape: digest#{image}#layer#{layer}
    let rest = sk.strip_prefix("digest#")?;
    let (image_digest, layer_digest) = rest.split_once("#layer#")?;

    Some(LayerProgress {
        key: LayerProgressKey {
            repo,
            image_digest: image_digest.to_string(),
            layer_digest: layer_digest.to_string(),
        },
        total_bytes: attr_n(map, "TotalBytes"),
        completed_bytes: attr_n(map, "CompletedBytes"),
        total_files: attr_n(map, "TotalFiles"),
        completed_files: attr_n(map, "CompletedFiles"),
        ttl: attr_n(map, "ttl") as i64,
        v: attr_n(map, "v") as u32,
    })
}

#[async_trait]
impl MetadataStore for DynamoMetadataStore {
    async fn create_image(&self, item: &ImageInfoItem) -> Result<()> {
        match self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::image_item(item)))
            .condition_expression("attribute_not_exists(pk)")
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                error::ConflictSnafu {
                    reason: format!("image row already exists for {}", item.key.sk()),
                }
                .fail()
            }
            Err(e) => Err(upstream(e)),
        }
    }

    async fn set_image_running(&self, key: &ImageKey, execution_id: &str) -> Result<()> {
        match self
            .client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attrs(key.pk(), key.sk())))
            .update_expression("SET #status = :status")
            .condition_expression("ExecutionId = :executionId")
            .expression_attribute_names("#status", "Status")
            .expression_attribute_values(":status", AttributeValue::S("RUNNING".to_string()))
            .expression_attribute_values(
                ":executionId",
                AttributeValue::S(execution_id.to_string()),
            )
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                error::ConflictSnafu {
                    reason: format!(
                        "image row for {} is owned by another execution",
                        key.sk()
                    ),
                }
                .fail()
            }
            Err(e) => Err(upstream(e)),
        }
    }

    async fn finalize_image(
        &self,
        key: &ImageKey,
        status: Status,
        duration_ms: u64,
        execution_id: &str,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attrs(key.pk(), key.sk())))
            .update_expression("SET #status = :status, #duration = :duration, ExecutionId = :executionId")
            .expression_attribute_names("#status", "Status")
            .expression_attribute_names("#duration", "Duration")
            .expression_attribute_values(":status", AttributeValue::S(status_string(status)))
            .expression_attribute_values(":duration", AttributeValue::N(duration_ms.to_string()))
            .expression_attribute_values(
                ":executionId",
                AttributeValue::S(execution_id.to_string()),
            )
            .send()
            .await
            .map_err(upstream)?;
        Ok(())
    }

    async fn set_image_details(
        &self,
        key: &ImageKey,
        total_size: u64,
        manifest: Vec<u8>,
        raw_config: Vec<u8>,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attrs(key.pk(), key.sk())))
            .update_expression("SET TotalSize = :TotalSize, RawConfig = :RawConfig, Manifest = :Manifest")
            .expression_attribute_values(":TotalSize", AttributeValue::N(total_size.to_string()))
            .expression_attribute_values(":RawConfig", AttributeValue::B(Blob::new(raw_config)))
            .expression_attribute_values(":Manifest", AttributeValue::B(Blob::new(manifest)))
            .send()
            .await
            .map_err(upstream)?;
        Ok(())
    }

    async fn get_image(&self, key: &ImageKey) -> Result<Option<ImageInfoItem>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attrs(key.pk(), key.sk())))
            .consistent_read(true)
            .send()
            .await
            .map_err(upstream)?;
        match output.item() {
            Some(item) => Ok(Some(parse_image_item(item)?)),
            None => Ok(None),
        }
    }

    async fn put_layer_progress(&self, progress: &LayerProgress) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::progress_item(progress)))
            .send()
            .await
            .map_err(upstream)?;
        Ok(())
    }

    async fn update_layer_progress(
        &self,
        key: &LayerProgressKey,
        completed_bytes: u64,
        completed_files: u64,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(Self::key_attrs(key.pk(), key.sk())))
            .update_expression("SET CompletedBytes = :CompletedBytes, CompletedFiles = :CompletedFiles")
            .expression_attribute_values(
                ":CompletedBytes",
                AttributeValue::N(completed_bytes.to_string()),
            )
            .expression_attribute_values(
                ":CompletedFiles",
                AttributeValue::N(completed_files.to_string()),
            )
            .send()
            .await
            .map_err(upstream)?;
        Ok(())
    }

    async fn list_layer_progress(&self, key: &ImageKey) -> Result<Vec<LayerProgress>> {
        let mut pages = self
            .client
            .query()
            .table_name(&self.table)
            .consistent_read(true)
            .key_condition_expression("pk = :pk AND begins_with(sk, :sk)")
            .expression_attribute_values(":pk", AttributeValue::S(key.pk()))
            .expression_attribute_values(
                ":sk",
                AttributeValue::S(format!("digest#{}#layer#", key.digest)),
            )
            .into_paginator()
            .send();

        let mut progresses = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(upstream)?;
            for item in page.items() {
                if let Some(progress) = parse_progress_item(item) {
                    progresses.push(progress);
                }
            }
        }
        progresses.sort_by(|a, b| a.key.layer_digest.cmp(&b.key.layer_digest));
        Ok(progresses)
    }
}
