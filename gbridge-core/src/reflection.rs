//! # Server Reflection
//!
//! This module contains the logic necessary to interact with the gRPC Server Reflection Protocol.
//!
//! It enables the bridge to query a backend for its own Protobuf schema at runtime. The
//! [`DescriptorSource`] trait is the seam between the protocol and the rest of the engine:
//! the descriptor store and the method resolver only ever talk to a `DescriptorSource`.
pub mod client;

use std::future::Future;

/// Errors produced while talking to the reflection service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReflectionError {
    #[error("The backend does not serve the reflection protocol: '{0}'")]
    Unsupported(#[source] tonic::Status),

    #[error("Reflection stream failed after a retry, backend unavailable: '{0}'")]
    BackendUnavailable(#[source] tonic::Status),

    #[error("Reflection could not resolve '{subject}' (code {code}): {message}")]
    NotFound {
        subject: String,
        code: i32,
        message: String,
    },

    #[error("Protocol error: Received unexpected response type: {0}")]
    UnexpectedResponseType(String),
}

/// Something able to answer the three reflection queries the engine needs.
///
/// File queries return the raw, encoded `FileDescriptorProto`s exactly as the server sent them.
/// A server is free to include more files than the one requested (usually its imports).
pub trait DescriptorSource: Clone + Send + Sync + 'static {
    /// Fully qualified names of every service exposed by the backend.
    fn list_services(&self) -> impl Future<Output = Result<Vec<String>, ReflectionError>> + Send;

    /// The file defining `symbol` (e.g. `my.package.MyService`).
    fn file_containing_symbol(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, ReflectionError>> + Send;

    /// The file registered under `name` (e.g. `my/package/service.proto`).
    fn file_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, ReflectionError>> + Send;
}
