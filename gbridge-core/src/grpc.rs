//! # Generic gRPC Transport
//!
//! This module contains the low-level building blocks for performing gRPC calls using
//! dynamic message types.
//!
//! Unlike standard `tonic` clients which are strongly typed (e.g., `HelloRequest`),
//! the components here carry [`prost_reflect::DynamicMessage`]s whose shape is only known at
//! runtime. JSON never reaches this layer: it is handled by [`crate::codec`].
pub mod client;
pub mod codec;
