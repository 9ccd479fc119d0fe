//! # Reflection Client
//!
//! A client implementation for `grpc.reflection.v1`.
//!
//! The protocol is a single bidirectional stream on which requests and responses are paired
//! in order. This client keeps one such stream open and reuses it for every query, allowing a
//! single outstanding request at a time. Concurrent callers queue on the stream.
//!
//! When the stream breaks (connection reset, backend restart, round trip timeout) the client
//! opens a new stream and retries that one request. A second failure is reported as
//! [`ReflectionError::BackendUnavailable`]. Negative answers from the server (`ErrorResponse` or
//! a `NOT_FOUND` status) are reported as [`ReflectionError::NotFound`] and never retried.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use super::{DescriptorSource, ReflectionError};
use crate::BoxError;
use http_body::Body as HttpBody;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Status, Streaming, client::GrpcService};
use tonic_reflection::pb::v1::{
    ServerReflectionRequest, ServerReflectionResponse,
    server_reflection_client::ServerReflectionClient, server_reflection_request::MessageRequest,
    server_reflection_response::MessageResponse,
};

// The host defined in the reflection requests doesn't seem to be a mandatory field
// and there is no documentation about what it is about.
// So we won't enforce it from the user.
const EMPTY_HOST: &str = "";

/// Default upper bound for a single request/response exchange on the reflection stream.
pub const DEFAULT_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(10);

/// A client for the gRPC Server Reflection Protocol sharing one stream between all callers.
///
/// Cloning is cheap: clones share the same underlying stream.
pub struct ReflectionClient<T = Channel> {
    client: ServerReflectionClient<T>,
    stream: Arc<Mutex<Option<ReflectionStream>>>,
    round_trip_timeout: Duration,
}

impl<T: Clone> Clone for ReflectionClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            stream: Arc::clone(&self.stream),
            round_trip_timeout: self.round_trip_timeout,
        }
    }
}

impl<T> std::fmt::Debug for ReflectionClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectionClient")
            .field("round_trip_timeout", &self.round_trip_timeout)
            .finish_non_exhaustive()
    }
}

/// Why a single attempt failed.
enum AttemptError {
    /// The stream is unusable. Worth one retry on a fresh stream.
    Reset(Status),
    /// The server answered, and the answer is final.
    Fatal(ReflectionError),
}

impl From<ReflectionError> for AttemptError {
    fn from(err: ReflectionError) -> Self {
        AttemptError::Fatal(err)
    }
}

/// One open `ServerReflectionInfo` call.
struct ReflectionStream {
    requests: mpsc::Sender<ServerReflectionRequest>,
    responses: Streaming<ServerReflectionResponse>,
}

impl ReflectionStream {
    /// Opens a new stream with `first` already queued.
    ///
    /// Some servers only send response headers together with the first message, so the
    /// request must be in flight before we wait for the call to be accepted.
    async fn open<T>(
        mut client: ServerReflectionClient<T>,
        first: ServerReflectionRequest,
        subject: &str,
    ) -> Result<Self, AttemptError>
    where
        T: GrpcService<tonic::body::Body>,
        T::Error: Into<BoxError>,
        T::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
        <T::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    {
        let (requests, rx) = mpsc::channel(1);

        requests
            .send(first)
            .await
            .map_err(|_| AttemptError::Reset(Status::unavailable("reflection request queue closed")))?;

        let responses = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(|status| classify_status(status, subject))?
            .into_inner();

        Ok(Self {
            requests,
            responses,
        })
    }

    async fn send(&mut self, request: ServerReflectionRequest) -> Result<(), AttemptError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| AttemptError::Reset(Status::unavailable("reflection stream closed")))
    }

    async fn receive(&mut self, subject: &str) -> Result<MessageResponse, AttemptError> {
        match self.responses.message().await {
            Ok(Some(ServerReflectionResponse {
                message_response: Some(response),
                ..
            })) => Ok(response),
            Ok(Some(_)) => Err(ReflectionError::UnexpectedResponseType("Empty Message".into()).into()),
            Ok(None) => Err(AttemptError::Reset(Status::unavailable(
                "reflection stream closed unexpectedly",
            ))),
            Err(status) => Err(classify_status(status, subject)),
        }
    }
}

fn classify_status(status: Status, subject: &str) -> AttemptError {
    match status.code() {
        Code::NotFound => AttemptError::Fatal(ReflectionError::NotFound {
            subject: subject.to_string(),
            code: Code::NotFound as i32,
            message: status.message().to_string(),
        }),
        Code::Unimplemented => AttemptError::Fatal(ReflectionError::Unsupported(status)),
        _ => AttemptError::Reset(status),
    }
}

impl<T> ReflectionClient<T>
where
    T: GrpcService<tonic::body::Body> + Clone,
    T::Error: Into<BoxError>,
    T::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <T::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(channel: T) -> Self {
        Self {
            client: ServerReflectionClient::new(channel),
            stream: Arc::new(Mutex::new(None)),
            round_trip_timeout: DEFAULT_ROUND_TRIP_TIMEOUT,
        }
    }

    /// Sets the upper bound for a single exchange on the stream.
    ///
    /// An exchange that exceeds it counts as a stream failure.
    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = timeout;
        self
    }

    /// Lists all services exposed by the server.
    pub async fn list_services(&self) -> Result<Vec<String>, ReflectionError> {
        let subject = "services";
        match self
            .round_trip(MessageRequest::ListServices(String::new()), subject)
            .await?
        {
            MessageResponse::ListServicesResponse(resp) => {
                Ok(resp.service.into_iter().map(|s| s.name).collect())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Asks the reflection service for the file containing the requested symbol
    /// (e.g., `my.package.MyService`).
    ///
    /// # Returns
    ///
    /// * `Ok(files)` - The encoded `FileDescriptorProto`s sent by the server.
    /// * `Err(ReflectionError)` - The symbol is unknown or the stream failed twice.
    pub async fn file_containing_symbol(
        &self,
        symbol: &str,
    ) -> Result<Vec<Vec<u8>>, ReflectionError> {
        let request = MessageRequest::FileContainingSymbol(symbol.to_string());
        match self.round_trip(request, symbol).await? {
            MessageResponse::FileDescriptorResponse(resp) => Ok(resp.file_descriptor_proto),
            other => Err(unexpected(other)),
        }
    }

    /// Asks the reflection service for a file by its name (e.g., `google/protobuf/empty.proto`).
    pub async fn file_by_name(&self, name: &str) -> Result<Vec<Vec<u8>>, ReflectionError> {
        let request = MessageRequest::FileByFilename(name.to_string());
        match self.round_trip(request, name).await? {
            MessageResponse::FileDescriptorResponse(resp) => Ok(resp.file_descriptor_proto),
            other => Err(unexpected(other)),
        }
    }

    async fn round_trip(
        &self,
        request: MessageRequest,
        subject: &str,
    ) -> Result<MessageResponse, ReflectionError> {
        match self.attempt(request.clone(), subject).await {
            Ok(response) => Ok(response),
            Err(AttemptError::Fatal(err)) => Err(err),
            Err(AttemptError::Reset(status)) => {
                tracing::warn!(%status, subject, "reflection stream failed, reopening it");

                self.attempt(request, subject)
                    .await
                    .map_err(|err| match err {
                        AttemptError::Reset(status) => ReflectionError::BackendUnavailable(status),
                        AttemptError::Fatal(err) => err,
                    })
            }
        }
    }

    async fn attempt(
        &self,
        request: MessageRequest,
        subject: &str,
    ) -> Result<MessageResponse, AttemptError> {
        let mut slot = self.stream.lock().await;

        // The stream stays out of the slot while an exchange is in flight. If this future is
        // dropped halfway, the half-used stream is dropped with it and never reused.
        let exchange = async {
            let request = ServerReflectionRequest {
                host: EMPTY_HOST.to_string(),
                message_request: Some(request),
            };

            let mut stream = match slot.take() {
                Some(mut stream) => {
                    stream.send(request).await?;
                    stream
                }
                None => {
                    tracing::debug!("opening reflection stream");
                    ReflectionStream::open(self.client.clone(), request, subject).await?
                }
            };

            let response = stream.receive(subject).await?;
            Ok::<_, AttemptError>((stream, response))
        };

        let (stream, response) = tokio::time::timeout(self.round_trip_timeout, exchange)
            .await
            .map_err(|_| {
                AttemptError::Reset(Status::deadline_exceeded(format!(
                    "reflection round trip exceeded {:?}",
                    self.round_trip_timeout
                )))
            })??;

        *slot = Some(stream);

        match response {
            MessageResponse::ErrorResponse(e) => Err(AttemptError::Fatal(ReflectionError::NotFound {
                subject: subject.to_string(),
                code: e.error_code,
                message: e.error_message,
            })),
            response => Ok(response),
        }
    }
}

fn unexpected(response: MessageResponse) -> ReflectionError {
    ReflectionError::UnexpectedResponseType(format!("{response:?}"))
}

impl<T> DescriptorSource for ReflectionClient<T>
where
    T: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    T::Future: Send,
    T::Error: Into<BoxError>,
    T::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <T::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    async fn list_services(&self) -> Result<Vec<String>, ReflectionError> {
        ReflectionClient::list_services(self).await
    }

    async fn file_containing_symbol(&self, symbol: &str) -> Result<Vec<Vec<u8>>, ReflectionError> {
        ReflectionClient::file_containing_symbol(self, symbol).await
    }

    async fn file_by_name(&self, name: &str) -> Result<Vec<Vec<u8>>, ReflectionError> {
        ReflectionClient::file_by_name(self, name).await
    }
}
