//! # Method Resolver
//!
//! Turns a `(service, method)` pair into a [`MethodDescriptor`], fetching the service's schema
//! from the backend on a cache miss.
//!
//! Resolution goes through the following steps:
//!
//! 1. Look the method up in the [`DescriptorStore`].
//! 2. On a miss, check that the backend exposes the service (`list_services`), fetch the file
//!    defining it (`file_containing_symbol`), and insert it into the store.
//! 3. Look the method up again.
//!
//! A service whose schema is cached but lacks the requested method may be stale. Its file is
//! fetched again and swapped in place, so the service never disappears from the store while
//! the refresh runs. A service is refreshed at most once per [`MIN_REFRESH_INTERVAL`]; within
//! that window the method is reported as unknown straight away.
//!
//! Concurrent fetches and refreshes of the same service share one round trip.
use crate::reflection::{DescriptorSource, ReflectionError};
use crate::single_flight::SingleFlight;
use crate::store::{DescriptorStore, LookupError, StoreError};
use prost_reflect::MethodDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Services every reflection-enabled server exposes, which are never useful to invoke.
const REFLECTION_SERVICES: &[&str] = &[
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

/// Minimum time between two schema fetches of the same service triggered by unknown methods.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Service '{0}' is not exposed by the backend")]
    UnknownService(String),

    #[error("Method '{method}' not found in service '{service}'")]
    UnknownMethod { service: String, method: String },

    #[error("Method '{0}' is streaming, only unary methods can be invoked")]
    UnsupportedStreaming(String),

    #[error(transparent)]
    Reflection(#[from] ReflectionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves methods on top of a [`DescriptorStore`].
///
/// Cloning is cheap: clones share the store and the in-progress fetches.
pub struct MethodResolver<R> {
    store: DescriptorStore<R>,
    fetches: Arc<SingleFlight<Result<(), ResolveError>>>,
    refreshes: Arc<SingleFlight<Result<(), ResolveError>>>,
    fetched_at: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<R: Clone> Clone for MethodResolver<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fetches: Arc::clone(&self.fetches),
            refreshes: Arc::clone(&self.refreshes),
            fetched_at: Arc::clone(&self.fetched_at),
        }
    }
}

impl<R> std::fmt::Debug for MethodResolver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodResolver")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<R: DescriptorSource> MethodResolver<R> {
    pub fn new(source: R) -> Self {
        Self::with_store(DescriptorStore::new(source))
    }

    pub fn with_store(store: DescriptorStore<R>) -> Self {
        Self {
            store,
            fetches: Arc::new(SingleFlight::default()),
            refreshes: Arc::new(SingleFlight::default()),
            fetched_at: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &DescriptorStore<R> {
        &self.store
    }

    /// Resolves `service`/`method` to a unary [`MethodDescriptor`].
    ///
    /// # Errors
    ///
    /// * [`ResolveError::UnknownService`] - The backend does not list `service`.
    /// * [`ResolveError::UnknownMethod`] - The service exists but has no such method.
    /// * [`ResolveError::UnsupportedStreaming`] - The method streams in either direction.
    /// * [`ResolveError::Reflection`] / [`ResolveError::Store`] - The schema could not be fetched.
    pub async fn resolve(
        &self,
        service: &str,
        method: &str,
    ) -> Result<MethodDescriptor, ResolveError> {
        let descriptor = match self.store.lookup_method(service, method) {
            Ok(descriptor) => descriptor,
            Err(LookupError::ServiceNotFound(_)) => {
                tracing::debug!(service, "schema not cached, fetching it");
                self.fetch_service(service).await?;
                self.lookup_after_fetch(service, method).await?
            }
            Err(LookupError::MethodNotFound { .. }) if self.fetched_recently(service) => {
                return Err(unknown_method(service, method));
            }
            Err(LookupError::MethodNotFound { .. }) => {
                tracing::debug!(service, method, "method missing from cached schema, refreshing it");
                self.refresh_service(service).await?;
                self.lookup_after_fetch(service, method).await?
            }
        };

        ensure_unary(descriptor)
    }

    /// Services exposed by the backend, without the reflection services themselves.
    pub async fn list_services(&self) -> Result<Vec<String>, ResolveError> {
        let mut services: Vec<String> = self
            .store
            .source()
            .list_services()
            .await?
            .into_iter()
            .filter(|s| !REFLECTION_SERVICES.contains(&s.as_str()))
            .collect();
        services.sort();
        services.dedup();
        Ok(services)
    }

    /// Drops the cached schema of `service`. See [`DescriptorStore::invalidate`].
    pub fn invalidate(&self, service: &str) -> bool {
        self.fetched_at().remove(service);
        self.store.invalidate(service)
    }

    /// Looks the method up once the backend has listed `service` and its file was inserted.
    async fn lookup_after_fetch(
        &self,
        service: &str,
        method: &str,
    ) -> Result<MethodDescriptor, ResolveError> {
        let mut refetched = false;
        loop {
            match self.store.lookup_method(service, method) {
                Ok(descriptor) => return Ok(descriptor),
                // Invalidated again between the fetch and this lookup.
                Err(LookupError::ServiceNotFound(_)) if !refetched => {
                    refetched = true;
                    self.fetch_service(service).await?;
                }
                // The backend lists the service, so only the method can be missing.
                Err(_) => return Err(unknown_method(service, method)),
            }
        }
    }

    async fn fetch_service(&self, service: &str) -> Result<(), ResolveError> {
        let resolver = self.clone();
        let name = service.to_string();

        self.fetches
            .run(service, move || async move {
                // Someone may have fetched it while we were waiting to start.
                if resolver.store.lookup_service(&name).is_some() {
                    return Ok(());
                }
                resolver.download(&name).await
            })
            .await
    }

    /// Fetches the file of a cached `service` again. The new version replaces the old one
    /// when published, so lookups keep seeing the service throughout.
    async fn refresh_service(&self, service: &str) -> Result<(), ResolveError> {
        let resolver = self.clone();
        let name = service.to_string();

        self.refreshes
            .run(service, move || async move { resolver.download(&name).await })
            .await
    }

    async fn download(&self, service: &str) -> Result<(), ResolveError> {
        let services = self.store.source().list_services().await?;
        if !services.iter().any(|s| s == service) {
            self.invalidate(service);
            return Err(ResolveError::UnknownService(service.to_string()));
        }

        let files = self.store.source().file_containing_symbol(service).await?;
        self.store.insert(files).await?;
        self.fetched_at().insert(service.to_string(), Instant::now());
        tracing::debug!(service, "schema fetched");
        Ok(())
    }

    fn fetched_recently(&self, service: &str) -> bool {
        self.fetched_at()
            .get(service)
            .is_some_and(|at| at.elapsed() < MIN_REFRESH_INTERVAL)
    }

    fn fetched_at(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.fetched_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_method(service: &str, method: &str) -> ResolveError {
    ResolveError::UnknownMethod {
        service: service.to_string(),
        method: method.to_string(),
    }
}

fn ensure_unary(method: MethodDescriptor) -> Result<MethodDescriptor, ResolveError> {
    if method.is_client_streaming() || method.is_server_streaming() {
        return Err(ResolveError::UnsupportedStreaming(method.full_name().to_string()));
    }
    Ok(method)
}
