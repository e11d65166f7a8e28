//! `grpc` handler: dynamic unary calls with a JSON codec.
//!
//! Requests and responses are plain JSON values so flows stay
//! protocol-agnostic; the remote service must speak grpc+json. Protobuf
//! descriptors are deliberately not involved.

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use http::uri::PathAndQuery;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::{KeyAndValueRef, MetadataKey, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig};

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs one unary gRPC call.
///
/// Config: `{ address, service, method, request, metadata?, timeout?,
/// use_tls? }`. Output: `{ response, status_code, latency_ms, metadata }`.
pub struct GrpcHandler;

#[async_trait]
impl ActionHandler for GrpcHandler {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let address = view.require_str("address")?;
        let service = view.require_str("service")?;
        let method = view.require_str("method")?;
        let request_body = view.require_value("request")?.clone();
        let use_tls = view.bool_opt("use_tls")?.unwrap_or(false);
        let timeout = match view.str_opt("timeout")? {
            Some(text) => humantime::parse_duration(text)
                .map_err(|e| Error::InvalidConfig(format!("invalid timeout `{text}`: {e}")))?,
            None => DEFAULT_TIMEOUT,
        };

        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else if use_tls {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Channel::from_shared(uri.clone())
            .map_err(|e| Error::InvalidConfig(format!("invalid gRPC address `{address}`: {e}")))?;
        if use_tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| Error::Handler(format!("TLS setup failed: {e}")))?;
        }

        let path = PathAndQuery::try_from(format!("/{service}/{method}"))
            .map_err(|e| Error::InvalidConfig(format!("invalid service/method path: {e}")))?;

        let mut request = tonic::Request::new(request_body);
        if let Some(metadata) = view.object_opt("metadata")? {
            for (name, value) in metadata {
                let key = MetadataKey::from_bytes(name.as_bytes()).map_err(|e| {
                    Error::InvalidConfig(format!("invalid metadata key `{name}`: {e}"))
                })?;
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let value = MetadataValue::try_from(text.as_str()).map_err(|e| {
                    Error::InvalidConfig(format!("invalid metadata value for `{name}`: {e}"))
                })?;
                request.metadata_mut().insert(key, value);
            }
        }

        let started = Instant::now();
        let call = async {
            let channel = endpoint
                .connect()
                .await
                .map_err(|e| Error::Handler(format!("failed to connect to {uri}: {e}")))?;
            let mut grpc = tonic::client::Grpc::new(channel);
            grpc.ready()
                .await
                .map_err(|e| Error::Handler(format!("gRPC channel not ready: {e}")))?;
            grpc.unary(request, path, JsonCodec)
                .await
                .map_err(|status| status_error(&status))
        };

        let response = tokio::select! {
            _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
            response = tokio::time::timeout(timeout, call) => response
                .map_err(|_| Error::Timeout(format!(
                    "gRPC call {service}/{method} exceeded {}",
                    humantime::format_duration(timeout)
                )))??,
        };

        let mut response_metadata = Map::new();
        for entry in response.metadata().iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry {
                if let Ok(text) = value.to_str() {
                    response_metadata.insert(key.to_string(), json!(text));
                }
            }
        }

        let mut output = Output::new();
        output.insert("response".into(), response.into_inner());
        output.insert("status_code".into(), json!(0));
        output.insert(
            "latency_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        output.insert("metadata".into(), Value::Object(response_metadata));
        Ok(output)
    }
}

fn status_error(status: &Status) -> Error {
    Error::Handler(format!(
        "gRPC call failed with {:?} ({}): {}",
        status.code(),
        status.code() as i32,
        status.message()
    ))
}

/// JSON message codec: both halves of the unary call are serde_json values.
#[derive(Debug, Clone, Copy, Default)]
struct JsonCodec;

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonEncoder;

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Value, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        serde_json::to_writer(dst.writer(), &item)
            .map_err(|e| Status::internal(format!("failed to encode JSON request: {e}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonDecoder;

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Value>, Status> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let bytes = src.copy_to_bytes(src.remaining());
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Status::internal(format!("failed to decode JSON response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmesh_core::ResourceId;

    fn envelope() -> CallEnvelope {
        CallEnvelope::new(ResourceId::new(), ResourceId::new(), "grpc-step")
    }

    #[tokio::test]
    async fn test_requires_address_service_method() {
        let handler = GrpcHandler;
        let err = handler
            .execute(&envelope(), &json!({ "service": "S", "method": "M" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let handler = GrpcHandler;
        let config = json!({
            "address": "127.0.0.1:9",
            "service": "test.Echo",
            "method": "Ping",
            "request": { "msg": "x" },
            "timeout": "2s"
        });
        let err = handler.execute(&envelope(), &config).await.unwrap_err();
        assert!(err.is_retryable() || matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invalid_metadata_key_is_a_config_error() {
        let handler = GrpcHandler;
        let config = json!({
            "address": "127.0.0.1:50051",
            "service": "S",
            "method": "M",
            "request": {},
            "metadata": { "bad key!": "v" }
        });
        let err = handler.execute(&envelope(), &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_json_codec_round_trip() {
        use bytes::BytesMut;

        let value = json!({ "a": 1, "b": "x" });
        let mut buffer = BytesMut::new();
        serde_json::to_writer((&mut buffer).writer(), &value).unwrap();
        let decoded: Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(decoded, value);
    }
}
