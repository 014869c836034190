//! gRPC front end: the `InferenceService` implementation.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info_span, Instrument};

use sauti_core::params::Params;
use sauti_core::ResponseMetadata;
use sauti_proto::inference::v1::inference_service_server::InferenceService;
use sauti_proto::inference::v1::{
    InferenceMetadata, InferenceRequest, InferenceResponse, StreamChunk,
};

use crate::dispatch::Dispatcher;

pub struct InferenceGrpc {
    dispatcher: Arc<Dispatcher>,
}

impl InferenceGrpc {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl InferenceService for InferenceGrpc {
    async fn infer(
        &self,
        request: Request<InferenceRequest>,
    ) -> Result<Response<InferenceResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!("grpc_infer", provider = %req.provider, model_id = %req.model_id);

        async {
            let parameters = struct_to_params(req.parameters);

            // Cancelled when the client goes away and tonic drops us.
            let ctx = CancellationToken::new();
            let _guard = ctx.clone().drop_guard();

            let resp = self
                .dispatcher
                .infer(&ctx, &req.provider, &req.model_id, req.input, parameters)
                .await
                .map_err(to_status)?;

            Ok(Response::new(InferenceResponse {
                output: resp.output,
                metadata: Some(to_proto_metadata(resp.metadata)),
            }))
        }
        .instrument(span)
        .await
    }

    type InferStreamStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, Status>> + Send>>;

    async fn infer_stream(
        &self,
        request: Request<Streaming<InferenceRequest>>,
    ) -> Result<Response<Self::InferStreamStream>, Status> {
        let mut incoming = request.into_inner();
        let Some(req) = incoming.message().await? else {
            return Err(Status::invalid_argument("missing initial request"));
        };

        let span =
            info_span!("grpc_infer_stream", provider = %req.provider, model_id = %req.model_id);
        let parameters = struct_to_params(req.parameters);
        let ctx = CancellationToken::new();
        let rx = self
            .dispatcher
            .infer_stream(&ctx, &req.provider, &req.model_id, req.input, parameters)
            .instrument(span)
            .await
            .map_err(to_status)?;

        // Dropping the output stream (client disconnect) cancels the
        // backend call and tears the child request down.
        let guard = ctx.drop_guard();
        let output = async_stream::stream! {
            let _guard = guard;
            let mut rx = rx;
            while let Some(chunk) = rx.recv().await {
                match chunk.error {
                    Some(err) => {
                        yield Ok(StreamChunk {
                            data: Vec::new(),
                            done: true,
                            error: err.to_string(),
                        });
                        return;
                    }
                    None => {
                        let done = chunk.done;
                        yield Ok(StreamChunk {
                            data: chunk.data,
                            done,
                            error: String::new(),
                        });
                        if done {
                            return;
                        }
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(output)))
    }
}

/// Map core errors onto gRPC status codes.
fn to_status(err: sauti_core::Error) -> Status {
    use sauti_core::Error;
    match &err {
        Error::Validation(_) => Status::invalid_argument(err.to_string()),
        Error::BackendNotFound(_) | Error::ModelNotFound(_) => Status::not_found(err.to_string()),
        Error::NotStreamable(_) => Status::unimplemented(err.to_string()),
        Error::Canceled => Status::cancelled(err.to_string()),
        Error::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
        Error::Transport(_) | Error::BackendStatus { .. } => Status::internal(err.to_string()),
        _ => Status::unknown(err.to_string()),
    }
}

fn to_proto_metadata(meta: ResponseMetadata) -> InferenceMetadata {
    InferenceMetadata {
        provider: meta.provider,
        model: meta.model,
        timestamp: Some(prost_types::Timestamp {
            seconds: meta.timestamp.timestamp(),
            nanos: meta.timestamp.timestamp_subsec_nanos() as i32,
        }),
        output_size_bytes: meta.output_size_bytes as i64,
        duration_seconds: meta.duration_seconds,
        backend_specific: json_to_struct(meta.backend_specific),
    }
}

/// Protobuf `Struct` → native parameter map.
fn struct_to_params(params: Option<prost_types::Struct>) -> Params {
    params
        .map(|s| {
            s.fields
                .into_iter()
                .map(|(key, value)| (key, proto_value_to_json(value)))
                .collect()
        })
        .unwrap_or_default()
}

fn proto_value_to_json(value: prost_types::Value) -> serde_json::Value {
    use prost_types::value::Kind;
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .into_iter()
                .map(|(key, value)| (key, proto_value_to_json(value)))
                .collect(),
        ),
        Some(Kind::ListValue(l)) => serde_json::Value::Array(
            l.values.into_iter().map(proto_value_to_json).collect(),
        ),
    }
}

fn json_to_struct(value: serde_json::Value) -> Option<prost_types::Struct> {
    match value {
        serde_json::Value::Object(map) => Some(prost_types::Struct {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, json_to_proto_value(value)))
                .collect(),
        }),
        _ => None,
    }
}

fn json_to_proto_value(value: serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind;
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(values) => Kind::ListValue(prost_types::ListValue {
            values: values.into_iter().map(json_to_proto_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, json_to_proto_value(value)))
                .collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}
