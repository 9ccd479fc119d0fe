//! # HTTP Server
//!
//! The HTTP face of the bridge:
//!
//! * `POST /{*rpc}` invokes `<service>/<method>` with the JSON body as the request.
//! * `GET /services` lists the services exposed by the backend.
//! * `GET /health` reports whether the backend answers reflection queries.
//!
//! Errors are returned as `{kind, message, detail?}` with a status derived from the kind.
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gbridge_core::engine::{
    ErrorDetail, ErrorKind, Invocation, InvocationEngine, InvocationError,
};
use gbridge_core::tonic::metadata::{KeyAndValueRef, MetadataMap};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Prefix of the HTTP headers carrying gRPC metadata, in both directions.
const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

/// Response metadata that describes the gRPC transport rather than the call.
const RESERVED_METADATA: &[&str] = &[
    "content-type",
    "content-length",
    "date",
    "te",
    "trailer",
    "transfer-encoding",
    "user-agent",
];

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    engine: InvocationEngine,
    grpc_addr: Arc<str>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(
        engine: InvocationEngine,
        grpc_addr: impl Into<Arc<str>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            grpc_addr: grpc_addr.into(),
            request_timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(services))
        .route("/{*rpc}", post(invoke))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// An [`InvocationError`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(InvocationError);

impl From<InvocationError> for ApiError {
    fn from(err: InvocationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.kind.http_status();
        if status.is_server_error() {
            tracing::warn!(kind = %self.0.kind, message = %self.0.message, "request failed");
        } else {
            tracing::debug!(kind = %self.0.kind, message = %self.0.message, "request rejected");
        }

        let grpc_code = match &self.0.detail {
            Some(ErrorDetail::Upstream { grpc_code, .. }) => Some(*grpc_code),
            _ => None,
        };

        let mut response = (status, Json(self.0)).into_response();
        if let Some(code) = grpc_code {
            response
                .headers_mut()
                .insert("grpc-status", HeaderValue::from(code));
        }
        response
    }
}

fn panic_response(_: Box<dyn Any + Send + 'static>) -> Response {
    ApiError(InvocationError::new(
        ErrorKind::InternalError,
        "The request handler panicked",
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RpcQuery {
    emit_defaults: Option<bool>,
}

async fn invoke(
    State(state): State<AppState>,
    Path(rpc): Path<String>,
    query: Result<Query<RpcQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| {
        InvocationError::bad_request(e.body_text(), None, "InvalidQuery")
    })?;
    let (service, method) = split_rpc_path(&rpc)?;

    let invocation = Invocation {
        service,
        method,
        body: body.to_vec(),
        metadata: forwarded_metadata(&headers),
        timeout: Some(state.request_timeout),
        emit_defaults: query.emit_defaults,
    };

    let output = state.engine.invoke(invocation).await?;

    let mut response = Json(output.body).into_response();
    copy_response_metadata(&output.metadata, response.headers_mut());
    response
        .headers_mut()
        .insert("grpc-status", HeaderValue::from_static("0"));
    Ok(response)
}

#[derive(Debug, Serialize)]
struct ServiceList {
    services: Vec<String>,
}

async fn services(State(state): State<AppState>) -> Result<Json<ServiceList>, ApiError> {
    let services = state.engine.list_services().await?;
    Ok(Json(ServiceList { services }))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    grpc_addr: String,
    reflection: bool,
    /// Seconds since the Unix epoch.
    timestamp: u64,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let reflection = match state.engine.list_services().await {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(%err, "backend reflection is not answering");
            false
        }
    };

    let (status, code) = if reflection {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    let health = Health {
        status,
        grpc_addr: state.grpc_addr.to_string(),
        reflection,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };
    (code, Json(health))
}

/// Splits `pkg.Service/Method` (or `pkg/Service/Method`) into a fully qualified service name
/// and a method name.
fn split_rpc_path(rpc: &str) -> Result<(String, String), InvocationError> {
    let invalid = |reason: &str| {
        InvocationError::bad_request(
            format!("Invalid RPC path '/{rpc}': {reason}"),
            None,
            "InvalidPath",
        )
    };

    let (service, method) = rpc
        .rsplit_once('/')
        .ok_or_else(|| invalid("expected /<service>/<method>"))?;

    if method.is_empty() || method.contains('.') {
        return Err(invalid("the method name must be a single identifier"));
    }

    let service = service.replace('/', ".");
    if service.split('.').any(str::is_empty) {
        return Err(invalid("the service name contains an empty segment"));
    }

    Ok((service, method.to_string()))
}

/// `authorization` and `grpc-metadata-<key>` headers, as gRPC metadata.
fn forwarded_metadata(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = match name.as_str() {
                "authorization" => "authorization",
                other => other.strip_prefix(METADATA_HEADER_PREFIX)?,
            };
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Exposes the ASCII response metadata as `grpc-metadata-<key>` headers.
fn copy_response_metadata(metadata: &MetadataMap, headers: &mut HeaderMap) {
    for entry in metadata.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            continue;
        };
        let key = key.as_str();
        if key.starts_with("grpc-") || RESERVED_METADATA.contains(&key) {
            continue;
        }

        let name = HeaderName::try_from(format!("{METADATA_HEADER_PREFIX}{key}"));
        let value = value.to_str().ok().and_then(|v| HeaderValue::from_str(v).ok());
        if let (Ok(name), Some(value)) = (name, value) {
            headers.append(name, value);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_paths() {
        assert_eq!(
            split_rpc_path("pkg.Greeter/SayHello").unwrap(),
            ("pkg.Greeter".to_string(), "SayHello".to_string())
        );
        assert_eq!(
            split_rpc_path("pkg/v1.Greeter/SayHello").unwrap(),
            ("pkg.v1.Greeter".to_string(), "SayHello".to_string())
        );
        assert_eq!(
            split_rpc_path("Greeter/SayHello").unwrap(),
            ("Greeter".to_string(), "SayHello".to_string())
        );

        for invalid in [
            "SayHello",
            "pkg.Greeter/",
            "/SayHello",
            "pkg//Greeter/SayHello",
            "pkg.Greeter/Say.Hello",
        ] {
            let err = split_rpc_path(invalid).unwrap_err();
            assert_eq!(err.kind, ErrorKind::BadRequest, "{invalid}");
        }
    }

    #[test]
    fn only_metadata_headers_are_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("grpc-metadata-x-tenant", HeaderValue::from_static("acme"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let mut forwarded = forwarded_metadata(&headers);
        forwarded.sort();

        assert_eq!(
            forwarded,
            vec![
                ("authorization".to_string(), "Bearer t".to_string()),
                ("x-tenant".to_string(), "acme".to_string()),
            ]
        );
    }

    #[test]
    fn transport_metadata_is_not_exposed() {
        let mut metadata = MetadataMap::new();
        metadata.insert("content-type", "application/grpc".parse().unwrap());
        metadata.insert("grpc-status", "0".parse().unwrap());
        metadata.insert("x-greeter-version", "1".parse().unwrap());

        let mut headers = HeaderMap::new();
        copy_response_metadata(&metadata, &mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["grpc-metadata-x-greeter-version"], "1");
    }
}
