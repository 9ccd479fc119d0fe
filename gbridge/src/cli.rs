//! # CLI
//!
//! This module defines the command-line interface of `gbridge` using `clap`.
//!
//! Every flag can also be set through a `GBRIDGE_*` environment variable. Durations use the
//! `humantime` syntax (`500ms`, `5s`, `1m`).
use clap::{Parser, ValueEnum};
use gbridge_core::codec::CodecOptions;
use gbridge_core::engine::EngineOptions;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "gbridge",
    version,
    about = "Expose any gRPC server with reflection as a plain HTTP/JSON API"
)]
pub struct Cli {
    /// Backend address (e.g. localhost:50051 or http://localhost:50051)
    #[arg(long, env = "GBRIDGE_GRPC_ADDR")]
    pub grpc_addr: String,

    /// Address to listen on
    #[arg(long, env = "GBRIDGE_HTTP_ADDR", default_value = "0.0.0.0")]
    pub http_addr: String,

    /// Port to listen on
    #[arg(long, env = "GBRIDGE_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// How long to wait for the backend connection at startup
    #[arg(long, env = "GBRIDGE_CONNECT_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Deadline for a whole request, also sent to the backend as the gRPC deadline
    #[arg(long, env = "GBRIDGE_REQUEST_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Deadline for a single reflection request
    #[arg(long, env = "GBRIDGE_REFLECTION_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub reflection_timeout: Duration,

    /// Include fields holding their default value in responses
    #[arg(long, env = "GBRIDGE_EMIT_DEFAULTS")]
    pub emit_defaults: bool,

    /// Use proto field names (snake_case) instead of JSON names in responses
    #[arg(long, env = "GBRIDGE_PROTO_FIELD_NAMES")]
    pub proto_field_names: bool,

    /// Drop unknown fields in request bodies instead of rejecting the request
    #[arg(long, env = "GBRIDGE_IGNORE_UNKNOWN_FIELDS")]
    pub ignore_unknown_fields: bool,

    #[arg(long, env = "GBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Enable debug logs
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// The backend URI, with `http://` added when no scheme is given.
    pub fn grpc_uri(&self) -> String {
        if self.grpc_addr.contains("://") {
            self.grpc_addr.clone()
        } else {
            format!("http://{}", self.grpc_addr)
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            codec: CodecOptions {
                emit_defaults: self.emit_defaults,
                use_proto_field_names: self.proto_field_names,
                ignore_unknown_fields: self.ignore_unknown_fields,
            },
            reflection_timeout: self.reflection_timeout,
        }
    }
}
