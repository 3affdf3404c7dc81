//! Optional protobuf value layer: schemas travel as retained NT topics named
//! `/.schema/proto:<filename>` carrying a serialized `FileDescriptorProto`
//! (§4.7). Feature-gated behind `protobuf` since it pulls in `prost-reflect`.

use crate::inflight::InFlightMap;
use crate::prefix_topic::PrefixTopic;
use crate::registry::Registry;
use crate::topic::{SubscriberCallback, Topic};
use nt_protocol::{AnnounceParams, TopicProperties, TypeInfo, Value};
use prost::Message;
use prost_reflect::DescriptorPool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

const SCHEMA_PREFIX: &str = "/.schema/proto:";

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("reading schema file: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding FileDescriptorProto: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("building descriptor pool: {0}")]
    Pool(#[from] prost_reflect::DescriptorError),
    #[error("file descriptor carried no message types")]
    EmptyFile,
    #[error("message type '{0}' not found in any cached schema")]
    SchemaNotFound(String),
    #[error(transparent)]
    Topic(#[from] crate::topic::TopicError),
    #[error("{0}")]
    Other(String),
}

impl From<crate::inflight::InFlightError> for SchemaError {
    fn from(_: crate::inflight::InFlightError) -> Self {
        SchemaError::SchemaNotFound(String::from("operation rejected: client is cleaning up"))
    }
}

fn raw_type_info(message_full_name: &str) -> TypeInfo {
    TypeInfo {
        number: 5,
        name: format!("proto:{message_full_name}"),
    }
}

/// Tracks known protobuf schemas and lets callers register new ones.
pub struct ProtobufLayer {
    registry: Arc<Registry>,
    schema_prefix: Arc<PrefixTopic>,
    pools: Arc<RwLock<HashMap<String, Arc<DescriptorPool>>>>,
    inflight: InFlightMap<Result<Arc<DescriptorPool>, Arc<SchemaError>>>,
}

impl ProtobufLayer {
    pub(crate) fn new(registry: Arc<Registry>) -> ProtobufLayer {
        let schema_prefix = registry.prefix_topic(SCHEMA_PREFIX);
        let pools: Arc<RwLock<HashMap<String, Arc<DescriptorPool>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let pools_for_callback = pools.clone();
        schema_prefix.subscribe(
            Arc::new(move |value: &Value, params: &AnnounceParams| {
                let Value::Raw(bytes) = value else {
                    tracing::warn!(topic = %params.name, "schema topic value was not raw bytes");
                    return;
                };
                match decode_pool(bytes) {
                    Ok(pool) => {
                        let pool = Arc::new(pool);
                        let mut pools = pools_for_callback.write().unwrap();
                        pools.insert(params.name.clone(), pool.clone());
                        if let Some(filename) = params.name.strip_prefix(SCHEMA_PREFIX) {
                            pools.insert(filename.to_owned(), pool);
                        }
                    }
                    Err(e) => tracing::warn!(topic = %params.name, error = %e, "failed to decode schema"),
                }
            }),
            Default::default(),
            None,
            true,
        );

        ProtobufLayer {
            registry,
            schema_prefix,
            pools,
            inflight: InFlightMap::new(),
        }
    }

    /// Find the first cached schema root whose pool resolves `name`.
    pub fn fetch_message_type(
        &self,
        name: &str,
    ) -> Result<prost_reflect::MessageDescriptor, SchemaError> {
        self.pools
            .read()
            .unwrap()
            .values()
            .find_map(|pool| pool.get_message_by_name(name))
            .ok_or_else(|| SchemaError::SchemaNotFound(name.to_owned()))
    }

    /// Load `file_path` (a serialized `FileDescriptorProto`), publish it as a
    /// retained schema topic, and cache the resulting pool. Deduplicated per
    /// target topic so concurrent registrations of the same file share one
    /// publish.
    pub async fn register_schema(
        &self,
        file_path: impl AsRef<Path>,
        message_name: Option<String>,
    ) -> Result<(String, Arc<DescriptorPool>), SchemaError> {
        let file_path = file_path.as_ref().to_owned();
        let basename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string_lossy().into_owned());
        let topic_name = format!("{SCHEMA_PREFIX}{basename}");
        let key = format!("schema:{topic_name}");

        let registry = self.registry.clone();
        let pools = self.pools.clone();
        let topic_name_for_task = topic_name.clone();
        let basename_for_task = basename.clone();
        let result = self
            .inflight
            .get_or_create(&key, move || async move {
                publish_schema_file(registry, pools, file_path, topic_name_for_task, basename_for_task)
                    .await
                    .map_err(Arc::new)
            })
            .await?;
        let pool = result.map_err(|e| SchemaError::Other(e.to_string()))?;

        let resolved_name = match message_name {
            Some(name) => {
                if pool.get_message_by_name(&name).is_none() {
                    return Err(SchemaError::SchemaNotFound(name));
                }
                name
            }
            None => pool
                .all_messages()
                .next()
                .map(|m| m.full_name().to_owned())
                .ok_or(SchemaError::EmptyFile)?,
        };

        Ok((resolved_name, pool))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn schema_prefix(&self) -> &Arc<PrefixTopic> {
        &self.schema_prefix
    }
}

fn decode_pool(bytes: &[u8]) -> Result<DescriptorPool, SchemaError> {
    let fdp = prost_types::FileDescriptorProto::decode(bytes)?;
    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_proto(fdp)?;
    Ok(pool)
}

async fn publish_schema_file(
    registry: Arc<Registry>,
    pools: Arc<RwLock<HashMap<String, Arc<DescriptorPool>>>>,
    file_path: std::path::PathBuf,
    topic_name: String,
    basename: String,
) -> Result<Arc<DescriptorPool>, SchemaError> {
    let bytes = tokio::fs::read(&file_path).await?;
    let pool = decode_pool(&bytes)?;
    let pool = Arc::new(pool);

    let topic: Arc<Topic> = registry
        .topic(&topic_name, TypeInfo { number: 5, name: "proto:FileDescriptorProto".to_owned() }, None)
        .map_err(|e| SchemaError::SchemaNotFound(e.to_string()))?;
    topic.publish(TopicProperties::retained(), None).await?;
    topic.set_value(Value::Raw(bytes))?;

    let mut pools = pools.write().unwrap();
    pools.insert(topic_name, pool.clone());
    pools.insert(basename, pool.clone());
    Ok(pool)
}

/// A typed protobuf-backed topic: owns a raw [`Topic`] and translates
/// `T` to/from bytes at the boundary (delegation, not inheritance).
pub struct ProtobufTopic<T> {
    raw: Arc<Topic>,
    message_full_name: String,
    schema_file_path: Option<std::path::PathBuf>,
    layer: Arc<ProtobufLayer>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Message + Default + Clone + Send + Sync + 'static> ProtobufTopic<T> {
    pub fn new(
        registry: &Arc<Registry>,
        layer: Arc<ProtobufLayer>,
        name: impl Into<String>,
        message_full_name: impl Into<String>,
        schema_file_path: Option<std::path::PathBuf>,
    ) -> Result<ProtobufTopic<T>, SchemaError> {
        let message_full_name = message_full_name.into();
        let raw = registry
            .topic(&name.into(), raw_type_info(&message_full_name), None)
            .map_err(|e| SchemaError::SchemaNotFound(e.to_string()))?;
        Ok(ProtobufTopic {
            raw,
            message_full_name,
            schema_file_path,
            layer,
            _marker: std::marker::PhantomData,
        })
    }

    pub async fn publish(&self, properties: TopicProperties) -> Result<AnnounceParams, SchemaError> {
        if let Some(path) = &self.schema_file_path {
            self.layer
                .register_schema(path, Some(self.message_full_name.clone()))
                .await?;
        }
        Ok(self.raw.publish(properties, None).await?)
    }

    pub fn set_value(&self, value: &T) -> Result<i64, crate::topic::TopicError> {
        self.raw.set_value(Value::Raw(value.encode_to_vec()))
    }

    /// Subscribe with a callback that decodes inbound bytes to `T`; decode
    /// failures are logged and dropped rather than delivered.
    pub fn subscribe(&self, callback: Arc<dyn Fn(T, &AnnounceParams) + Send + Sync>) -> i64 {
        let adapter: SubscriberCallback = Arc::new(move |value, params| {
            let Value::Raw(bytes) = value else {
                tracing::warn!(topic = %params.name, "protobuf topic value was not raw bytes");
                return;
            };
            match T::decode(bytes.as_slice()) {
                Ok(decoded) => callback(decoded, params),
                Err(e) => tracing::warn!(topic = %params.name, error = %e, "failed to decode protobuf value"),
            }
        });
        self.raw
            .subscribe(adapter, nt_protocol::SubscribeOptions::default(), None, true)
    }

    pub fn raw(&self) -> &Arc<Topic> {
        &self.raw
    }
}
