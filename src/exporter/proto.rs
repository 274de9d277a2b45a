//! # SkyWalking v3 Event Protocol
//!
//! Messages of `event/Event.proto` and `common/Command.proto` plus a client for the
//! client-streaming `skywalking.v3.EventService/collect` call. The records are also
//! serialized as JSON by the console sink.

use std::collections::HashMap;

use serde::{Serialize, Serializer};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

const COLLECT_PATH: &str = "/skywalking.v3.EventService/collect";

// ================================================================================================
// MESSAGES
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Type {
    Normal = 0,
    Error = 1,
}

impl Type {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Type::Normal => "Normal",
            Type::Error => "Error",
        }
    }
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub service_instance: String,
    #[prost(string, tag = "3")]
    pub endpoint: String,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(message, optional, tag = "2")]
    pub source: Option<Source>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(enumeration = "Type", tag = "4")]
    #[serde(rename = "type", serialize_with = "serialize_type")]
    pub r#type: i32,
    #[prost(string, tag = "5")]
    pub message: String,
    #[prost(map = "string, string", tag = "6")]
    pub parameters: HashMap<String, String>,
    #[prost(int64, tag = "7")]
    pub start_time: i64,
    #[prost(int64, tag = "8")]
    pub end_time: i64,
    #[prost(string, tag = "9")]
    pub layer: String,
}

fn serialize_type<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
    let name = Type::try_from(*value)
        .map(|t| t.as_str_name())
        .unwrap_or("Normal");
    serializer.serialize_str(name)
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyStringValuePair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(message, repeated, tag = "2")]
    pub args: Vec<KeyStringValuePair>,
}

/// Response of `collect`. The collector may piggyback commands; they are logged.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Commands {
    #[prost(message, repeated, tag = "1")]
    pub commands: Vec<Command>,
}

// ================================================================================================
// CLIENT
// ================================================================================================

/// Client of `skywalking.v3.EventService`.
#[derive(Debug, Clone)]
pub struct EventServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl EventServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Streams events to the collector. Resolves when the request stream ends or the
    /// call fails.
    pub async fn collect(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = Event>,
    ) -> Result<tonic::Response<Commands>, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(COLLECT_PATH);
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
