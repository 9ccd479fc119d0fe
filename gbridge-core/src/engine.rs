//! # Invocation Engine
//!
//! Orchestrates a single call end to end:
//!
//! `Received -> Resolving -> Decoding -> Invoking -> Encoding -> Responded`
//!
//! Every stage can fail, and every failure is returned as an [`InvocationError`] carrying an
//! [`ErrorKind`] that maps onto an HTTP status. Nothing on this path panics on bad input.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gbridge_core::engine::{EngineOptions, Invocation, InvocationEngine};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = InvocationEngine::connect(
//!     "http://localhost:50051",
//!     Duration::from_secs(5),
//!     EngineOptions::default(),
//! )
//! .await?;
//!
//! let output = engine
//!     .invoke(Invocation::new("pkg.Greeter", "SayHello", br#"{"name":"Ada"}"#.to_vec()))
//!     .await?;
//!
//! println!("{}", output.body);
//! # Ok(())
//! # }
//! ```
use crate::BoxError;
use crate::codec::{self, CodecOptions, DecodeError, EncodeError};
use crate::grpc::client::{GrpcClient, GrpcRequestError};
use crate::reflection::client::{DEFAULT_ROUND_TRIP_TIMEOUT, ReflectionClient};
use crate::reflection::{DescriptorSource, ReflectionError};
use crate::resolver::{MethodResolver, ResolveError};
use crate::store::StoreError;
use http::StatusCode;
use http_body::Body as HttpBody;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::Instrument;

/// Errors that can occur when connecting to the backend.
#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

/// The failure families a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    BackendUnavailable,
    ResolutionNotFound,
    UnknownService,
    UnknownMethod,
    UnsupportedStreaming,
    BadRequest,
    NotFound,
    Forbidden,
    Unauthenticated,
    Timeout,
    Cancelled,
    UpstreamError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::ResolutionNotFound => "ResolutionNotFound",
            ErrorKind::UnknownService => "UnknownService",
            ErrorKind::UnknownMethod => "UnknownMethod",
            ErrorKind::UnsupportedStreaming => "UnsupportedStreaming",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::InternalError => "InternalError",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::UnknownService
            | ErrorKind::UnknownMethod
            | ErrorKind::ResolutionNotFound
            | ErrorKind::NotFound => StatusCode::NOT_FOUND,
            // Client Closed Request, as popularised by nginx.
            ErrorKind::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::UnsupportedStreaming => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra information attached to an [`InvocationError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    /// What is wrong with the request, and where.
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        reason: String,
    },
    /// The status returned by the backend.
    Upstream {
        grpc_code: i32,
        grpc_status: String,
        grpc_message: String,
    },
}

/// A failed invocation, serializable as `{kind, message, detail?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

impl InvocationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// A request rejected before reaching the backend.
    pub fn bad_request(message: impl Into<String>, field: Option<String>, reason: &str) -> Self {
        Self::new(ErrorKind::BadRequest, message).with_detail(ErrorDetail::Request {
            field,
            reason: reason.to_string(),
        })
    }

    fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Request did not complete within {after:?}"),
        )
    }

    fn from_reflection(err: &ReflectionError, message: String) -> Self {
        match err {
            ReflectionError::BackendUnavailable(_) => {
                Self::new(ErrorKind::BackendUnavailable, message)
            }
            ReflectionError::NotFound { .. } => Self::new(ErrorKind::ResolutionNotFound, message),
            ReflectionError::Unsupported(status) => {
                Self::new(ErrorKind::UpstreamError, message).with_detail(upstream_detail(status))
            }
            ReflectionError::UnexpectedResponseType(_) => {
                Self::new(ErrorKind::UpstreamError, message)
            }
        }
    }
}

impl From<ResolveError> for InvocationError {
    fn from(err: ResolveError) -> Self {
        let message = err.to_string();
        match err {
            ResolveError::UnknownService(_) => Self::new(ErrorKind::UnknownService, message),
            ResolveError::UnknownMethod { .. } => Self::new(ErrorKind::UnknownMethod, message),
            ResolveError::UnsupportedStreaming(_) => {
                Self::new(ErrorKind::UnsupportedStreaming, message)
            }
            ResolveError::Reflection(err) => Self::from_reflection(&err, message),
            ResolveError::Store(StoreError::Fetch { source, .. }) => {
                Self::from_reflection(&source, message)
            }
            // The backend sent descriptors we cannot use.
            ResolveError::Store(_) => Self::new(ErrorKind::UpstreamError, message),
        }
    }
}

impl From<DecodeError> for InvocationError {
    fn from(err: DecodeError) -> Self {
        let field = (!err.path.is_empty()).then(|| err.path.clone());
        Self::bad_request(err.to_string(), field, err.kind.as_str())
    }
}

impl From<EncodeError> for InvocationError {
    fn from(err: EncodeError) -> Self {
        Self::new(ErrorKind::InternalError, err.to_string())
    }
}

impl From<GrpcRequestError> for InvocationError {
    fn from(err: GrpcRequestError) -> Self {
        let message = err.to_string();
        match err {
            GrpcRequestError::ClientNotReady(_) => Self::new(ErrorKind::BackendUnavailable, message),
            GrpcRequestError::InvalidMetadataKey { key, .. }
            | GrpcRequestError::InvalidMetadataValue { key, .. } => {
                Self::bad_request(message, Some(key), "InvalidMetadata")
            }
            GrpcRequestError::InvalidPath(_) => Self::new(ErrorKind::InternalError, message),
        }
    }
}

impl From<Status> for InvocationError {
    fn from(status: Status) -> Self {
        let kind = match status.code() {
            Code::InvalidArgument
            | Code::OutOfRange
            | Code::FailedPrecondition
            | Code::ResourceExhausted => ErrorKind::BadRequest,
            Code::NotFound => ErrorKind::NotFound,
            Code::PermissionDenied => ErrorKind::Forbidden,
            Code::Unauthenticated => ErrorKind::Unauthenticated,
            Code::DeadlineExceeded => ErrorKind::Timeout,
            Code::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::UpstreamError,
        };

        Self::new(kind, status.message().to_string()).with_detail(upstream_detail(&status))
    }
}

fn upstream_detail(status: &Status) -> ErrorDetail {
    ErrorDetail::Upstream {
        grpc_code: status.code() as i32,
        grpc_status: code_name(status.code()).to_string(),
        grpc_message: status.message().to_string(),
    }
}

/// The canonical upper snake case name of a status code.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// The steps of a call, as they appear in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Resolving,
    Decoding,
    Invoking,
    Encoding,
    Responded,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Engine wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub codec: CodecOptions,
    /// Upper bound for a single reflection request/response exchange.
    pub reflection_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            codec: CodecOptions::default(),
            reflection_timeout: DEFAULT_ROUND_TRIP_TIMEOUT,
        }
    }
}

/// A call to perform.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Fully qualified service name (e.g. `pkg.Greeter`).
    pub service: String,
    pub method: String,
    /// JSON request body. Empty means `{}`.
    pub body: Vec<u8>,
    /// Request metadata forwarded to the backend.
    pub metadata: Vec<(String, String)>,
    /// Deadline for the whole call, also sent to the backend.
    pub timeout: Option<Duration>,
    /// Overrides [`CodecOptions::emit_defaults`] for this call.
    pub emit_defaults: Option<bool>,
}

impl Invocation {
    pub fn new(service: impl Into<String>, method: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            body,
            metadata: Vec::new(),
            timeout: None,
            emit_defaults: None,
        }
    }
}

/// The result of a successful call.
#[derive(Debug)]
pub struct InvocationOutput {
    pub body: serde_json::Value,
    /// Response headers and trailers sent by the backend.
    pub metadata: MetadataMap,
}

/// Turns JSON calls into unary gRPC calls against a single backend.
///
/// Cloning is cheap: clones share the connection and the descriptor store.
pub struct InvocationEngine<S = Channel, R = ReflectionClient<S>> {
    grpc: GrpcClient<S>,
    resolver: MethodResolver<R>,
    options: EngineOptions,
}

impl<S: Clone, R: Clone> Clone for InvocationEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            grpc: self.grpc.clone(),
            resolver: self.resolver.clone(),
            options: self.options,
        }
    }
}

impl<S, R> fmt::Debug for InvocationEngine<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationEngine")
            .field("resolver", &self.resolver)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl InvocationEngine<Channel> {
    /// Connects to the backend at `addr` (e.g. `http://localhost:50051`).
    ///
    /// # Returns
    ///
    /// * `Ok(InvocationEngine)` - The connected engine.
    /// * `Err(ClientConnectError)` - If the URL is invalid or connection fails.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        options: EngineOptions,
    ) -> Result<Self, ClientConnectError> {
        let endpoint = Endpoint::new(addr.to_string())
            .map_err(|e| ClientConnectError::InvalidUrl(addr.to_string(), e))?
            .connect_timeout(connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientConnectError::ConnectionFailed(addr.to_string(), e))?;

        Ok(Self::from_service(channel, options))
    }
}

impl<S> InvocationEngine<S, ReflectionClient<S>>
where
    S: tonic::client::GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Builds an engine on top of an existing service, discovering schemas through reflection
    /// on that same service.
    pub fn from_service(service: S, options: EngineOptions) -> Self {
        let reflection = ReflectionClient::new(service.clone())
            .with_round_trip_timeout(options.reflection_timeout);
        Self::with_source(service, reflection, options)
    }
}

impl<S, R> InvocationEngine<S, R>
where
    S: tonic::client::GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    R: DescriptorSource,
{
    /// Builds an engine calling `service` and discovering schemas through `source`.
    pub fn with_source(service: S, source: R, options: EngineOptions) -> Self {
        Self {
            grpc: GrpcClient::new(service),
            resolver: MethodResolver::new(source),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn resolver(&self) -> &MethodResolver<R> {
        &self.resolver
    }

    /// Services exposed by the backend, without the reflection services.
    pub async fn list_services(&self) -> Result<Vec<String>, InvocationError> {
        Ok(self.resolver.list_services().await?)
    }

    /// Performs `invocation`.
    ///
    /// The whole call, schema resolution included, is bounded by `invocation.timeout`.
    /// Dropping the returned future cancels the call.
    pub async fn invoke(
        &self,
        invocation: Invocation,
    ) -> Result<InvocationOutput, InvocationError> {
        let span = tracing::info_span!(
            "invoke",
            service = %invocation.service,
            method = %invocation.method
        );
        let deadline = invocation.timeout;

        async move {
            tracing::debug!(stage = %Stage::Received, bytes = invocation.body.len());

            let call = self.run(invocation);
            let result = match deadline {
                Some(after) => tokio::time::timeout(after, call)
                    .await
                    .unwrap_or_else(|_| Err(InvocationError::timeout(after))),
                None => call.await,
            };

            match &result {
                Ok(_) => tracing::debug!(stage = %Stage::Responded),
                Err(err) => tracing::debug!(stage = %Stage::Failed, kind = %err.kind, %err),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, invocation: Invocation) -> Result<InvocationOutput, InvocationError> {
        let Invocation {
            service,
            method,
            body,
            metadata,
            timeout,
            emit_defaults,
        } = invocation;

        tracing::debug!(stage = %Stage::Resolving);
        let descriptor = self.resolver.resolve(&service, &method).await?;

        tracing::debug!(stage = %Stage::Decoding);
        let request = codec::decode(&body, &descriptor.input(), &self.options.codec)?;

        tracing::debug!(stage = %Stage::Invoking);
        let mut grpc = self.grpc.clone();
        let response = match grpc.unary(&descriptor, request, metadata, timeout).await? {
            Ok(response) => response,
            Err(status) => {
                if status.code() == Code::Unimplemented && self.resolver.invalidate(&service) {
                    tracing::warn!(%service, "backend stopped implementing the method, schema dropped");
                }
                return Err(status.into());
            }
        };

        tracing::debug!(stage = %Stage::Encoding);
        let (metadata, message, _) = response.into_parts();
        let options = CodecOptions {
            emit_defaults: emit_defaults.unwrap_or(self.options.codec.emit_defaults),
            ..self.options.codec
        };
        let body = codec::encode(&message, &options)?;

        Ok(InvocationOutput { body, metadata })
    }
}
