//! # Gbridge Core
//!
//! `gbridge-core` is the engine behind the `gbridge` HTTP/JSON to gRPC bridge. It invokes
//! unary methods of any gRPC server without compile-time knowledge of the Protobuf schema:
//! the schema is discovered at runtime through the server reflection protocol.
//!
//! ## Key Components
//!
//! * **[`ReflectionClient`](reflection::client::ReflectionClient):** Speaks `grpc.reflection.v1`
//!   over a single long-lived bidirectional stream, reopening it once on failure.
//! * **[`DescriptorStore`](store::DescriptorStore):** In-memory registry of file descriptors,
//!   populated lazily. Imports are resolved transitively before a file becomes visible.
//! * **[`MethodResolver`](resolver::MethodResolver):** Turns a `(service, method)` pair into a
//!   unary [`MethodDescriptor`](prost_reflect::MethodDescriptor), fetching schemas on a miss.
//! * **[`codec`]:** JSON to [`DynamicMessage`](prost_reflect::DynamicMessage) and back, following
//!   the protobuf JSON mapping.
//! * **[`InvocationEngine`](engine::InvocationEngine):** Resolve, decode, call, encode. Every
//!   failure ends up as an [`InvocationError`](engine::InvocationError).
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod codec;
pub mod engine;
pub mod grpc;
pub mod reflection;
pub mod resolver;
mod single_flight;
pub mod store;
#[cfg(test)]
mod testing;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
