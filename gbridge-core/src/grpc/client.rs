//! # Generic gRPC Client
//!
//! This module wraps a standard `tonic` client to perform unary calls against any method
//! described by a [`MethodDescriptor`].
//!
//! ## Features
//!
//! * **Dynamic Pathing**: Constructs the HTTP/2 path (e.g., `/package.Service/Method`) at runtime.
//! * **Metadata Handling**: Converts string pairs into Tonic's `MetadataMap`.
//! * **Deadlines**: An optional timeout is sent to the server as `grpc-timeout`.
use super::codec::DynamicCodec;
use crate::BoxError;
use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::str::FromStr;
use std::time::Duration;
use tonic::{
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
    #[error("Method '{0}' does not map to a valid gRPC path")]
    InvalidPath(String),
}

/// A gRPC client that is agnostic to the messages it exchanges.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Unary gRPC call (Single Request -> Single Response).
    ///
    /// # Returns
    /// * `Ok(Ok(Response))` - Successful RPC execution, with the response metadata.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(GrpcRequestError)` - Failed to build or send the request.
    pub async fn unary(
        &mut self,
        method: &MethodDescriptor,
        payload: DynamicMessage,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Result<tonic::Response<DynamicMessage>, tonic::Status>, GrpcRequestError> {
        let path = http_path(method)?;
        let mut request = build_request(payload, headers)?;
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = DynamicCodec::new(method.output());
        Ok(self.client.unary(request, path, codec).await)
    }
}

fn http_path(method: &MethodDescriptor) -> Result<http::uri::PathAndQuery, GrpcRequestError> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path).map_err(|_| GrpcRequestError::InvalidPath(path))
}

fn build_request<T>(
    payload: T,
    headers: Vec<(String, String)>,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);
    for (k, v) in headers {
        let key =
            MetadataKey::from_str(&k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(&v)
            .map_err(|source| GrpcRequestError::InvalidMetadataValue { key: k, source })?;
        request.metadata_mut().append(key, val);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_appended_in_order() {
        let request = build_request(
            (),
            vec![
                ("authorization".to_string(), "Bearer t".to_string()),
                ("x-tenant".to_string(), "a".to_string()),
                ("x-tenant".to_string(), "b".to_string()),
            ],
        )
        .unwrap();

        let tenants: Vec<_> = request
            .metadata()
            .get_all("x-tenant")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(tenants, vec!["a", "b"]);
        assert_eq!(request.metadata().get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn invalid_metadata_key_is_reported() {
        let err = build_request((), vec![("bad key".to_string(), "v".to_string())]).unwrap_err();
        assert!(matches!(err, GrpcRequestError::InvalidMetadataKey { key, .. } if key == "bad key"));
    }

    #[test]
    fn invalid_metadata_value_is_reported() {
        let err =
            build_request((), vec![("x-ok".to_string(), "line\nbreak".to_string())]).unwrap_err();
        assert!(matches!(err, GrpcRequestError::InvalidMetadataValue { key, .. } if key == "x-ok"));
    }
}
