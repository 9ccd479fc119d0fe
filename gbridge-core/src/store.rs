//! # Descriptor Store
//!
//! An in-memory registry of Protobuf file descriptors, keyed by file name and populated
//! lazily from a [`DescriptorSource`].
//!
//! ## Guarantees
//!
//! * A file only becomes visible once every file it imports (transitively) is present. Files
//!   waiting on their imports live in the inserting task and are invisible to lookups.
//! * Readers work on an immutable snapshot ([`DescriptorPool`]). Every insert builds a new pool
//!   and publishes it in one step, so a lookup never observes a half-inserted file.
//! * At most one file per name is retained. A file arriving with the same name and different
//!   content replaces the previous one.
//! * Concurrent requests for the same missing import share a single fetch.
use crate::reflection::{DescriptorSource, ReflectionError};
use crate::single_flight::SingleFlight;
use futures_util::future::{BoxFuture, FutureExt};
use prost::Message;
use prost_reflect::{
    DescriptorError, DescriptorPool, MessageDescriptor, MethodDescriptor, ServiceDescriptor,
};
use prost_types::FileDescriptorProto;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to decode FileDescriptorProto: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Received a file descriptor without a name")]
    UnnamedFile,

    #[error("Import cycle detected through '{0}'")]
    ImportCycle(String),

    #[error("Failed to fetch imported file '{file}': {source}")]
    Fetch {
        file: String,
        #[source]
        source: ReflectionError,
    },

    #[error("The backend answered a request for '{0}' without that file")]
    MissingFile(String),

    #[error("Failed to build descriptors: {0}")]
    Descriptor(#[source] Arc<DescriptorError>),
}

/// Why a method lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
}

#[derive(Clone)]
struct Snapshot {
    pool: DescriptorPool,
    files: HashMap<String, FileDescriptorProto>,
}

struct StoreState {
    snapshot: RwLock<Snapshot>,
    fetches: SingleFlight<Result<(), StoreError>>,
}

/// Registry of descriptors fetched from a [`DescriptorSource`].
///
/// Cloning is cheap: clones share the same registry.
pub struct DescriptorStore<R> {
    source: R,
    state: Arc<StoreState>,
}

impl<R: Clone> Clone for DescriptorStore<R> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<R> std::fmt::Debug for DescriptorStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorStore")
            .field("files", &self.file_names())
            .finish_non_exhaustive()
    }
}

impl<R> DescriptorStore<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            state: Arc::new(StoreState {
                snapshot: RwLock::new(Snapshot {
                    pool: DescriptorPool::new(),
                    files: HashMap::new(),
                }),
                fetches: SingleFlight::default(),
            }),
        }
    }

    /// The source this store fetches missing files from.
    pub fn source(&self) -> &R {
        &self.source
    }

    /// The currently published descriptors.
    pub fn pool(&self) -> DescriptorPool {
        self.read().pool.clone()
    }

    pub fn contains_file(&self, name: &str) -> bool {
        self.read().files.contains_key(name)
    }

    /// Names of every visible file, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn lookup_message(&self, name: &str) -> Option<MessageDescriptor> {
        self.read().pool.get_message_by_name(name)
    }

    pub fn lookup_service(&self, name: &str) -> Option<ServiceDescriptor> {
        self.read().pool.get_service_by_name(name)
    }

    pub fn lookup_method(
        &self,
        service: &str,
        method: &str,
    ) -> Result<MethodDescriptor, LookupError> {
        self.lookup_service(service)
            .ok_or_else(|| LookupError::ServiceNotFound(service.to_string()))?
            .methods()
            .find(|m| m.name() == method)
            .ok_or_else(|| LookupError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Forgets the file defining `service`, and every file importing it, so that the next
    /// resolution fetches a fresh copy from the backend.
    ///
    /// Returns `false` when the service was not known.
    pub fn invalidate(&self, service: &str) -> bool {
        let mut snapshot = self.write();

        let Some(file) = snapshot
            .pool
            .get_service_by_name(service)
            .map(|s| s.parent_file().name().to_string())
        else {
            return false;
        };

        let mut files = snapshot.files.clone();
        for name in dependents_of(&files, &file) {
            tracing::debug!(file = %name, "dropping cached file descriptor");
            files.remove(&name);
        }

        // Removing a file together with everything importing it keeps the remaining set closed
        // under imports, so the rebuild only fails if the set was already broken.
        let pool = build_pool(&files).unwrap_or_else(|err| {
            tracing::warn!(%err, "cached descriptors are inconsistent, clearing the store");
            files.clear();
            DescriptorPool::new()
        });

        tracing::warn!(service, file = %file, "invalidated cached schema");
        *snapshot = Snapshot { pool, files };
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.state.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `files` visible in one step, replacing any previous file of the same name.
    fn publish(&self, staged: Vec<FileDescriptorProto>) -> Result<(), StoreError> {
        let mut snapshot = self.write();
        let mut files = snapshot.files.clone();
        let mut changed = Vec::new();

        for file in staged {
            let name = file.name().to_string();
            if files.get(&name) == Some(&file) {
                continue;
            }
            if files.contains_key(&name) {
                tracing::info!(file = %name, "replacing file descriptor with a newer version");
            }
            files.insert(name.clone(), file);
            changed.push(name);
        }

        if changed.is_empty() {
            return Ok(());
        }

        let pool = build_pool(&files)?;
        tracing::debug!(files = ?changed, "published file descriptors");
        *snapshot = Snapshot { pool, files };
        Ok(())
    }
}

impl<R: DescriptorSource> DescriptorStore<R> {
    /// Registers encoded `FileDescriptorProto`s.
    ///
    /// Imports that are neither registered nor part of `files` are fetched from the source,
    /// depth first. The files only become visible once all of their imports are.
    pub async fn insert(&self, files: Vec<Vec<u8>>) -> Result<(), StoreError> {
        self.insert_with_chain(files, Vec::new()).await
    }

    /// `chain` holds the names of files whose insertion is waiting on this one.
    fn insert_with_chain(
        &self,
        files: Vec<Vec<u8>>,
        chain: Vec<String>,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        let store = self.clone();

        async move {
            let staged = decode_files(files)?;
            let missing = store.missing_imports(&staged);

            let mut chain = chain;
            chain.extend(staged.iter().map(|f| f.name().to_string()));

            for import in missing {
                if chain.contains(&import) {
                    return Err(StoreError::ImportCycle(import));
                }
                store.ensure_file(import, chain.clone()).await?;
            }

            store.publish(staged)
        }
        .boxed()
    }

    /// Fetches and registers `name` unless it is already present.
    async fn ensure_file(&self, name: String, chain: Vec<String>) -> Result<(), StoreError> {
        let store = self.clone();
        let key = name.clone();

        self.state
            .fetches
            .run(&key, move || async move {
                if store.contains_file(&name) {
                    return Ok(());
                }

                tracing::debug!(file = %name, "fetching imported file");
                let files = store
                    .source
                    .file_by_name(&name)
                    .await
                    .map_err(|source| StoreError::Fetch {
                        file: name.clone(),
                        source,
                    })?;

                let mut chain = chain;
                chain.push(name.clone());
                store.insert_with_chain(files, chain).await?;

                if store.contains_file(&name) {
                    Ok(())
                } else {
                    Err(StoreError::MissingFile(name))
                }
            })
            .await
    }

    /// Imports of `staged` that are neither registered nor staged, in declaration order.
    fn missing_imports(&self, staged: &[FileDescriptorProto]) -> Vec<String> {
        let snapshot = self.read();
        let staged_names: HashSet<&str> = staged.iter().map(|f| f.name()).collect();
        let mut missing = Vec::new();

        for import in staged.iter().flat_map(|f| f.dependency.iter()) {
            if !snapshot.files.contains_key(import)
                && !staged_names.contains(import.as_str())
                && !missing.contains(import)
            {
                missing.push(import.clone());
            }
        }

        missing
    }
}

fn decode_files(raw: Vec<Vec<u8>>) -> Result<Vec<FileDescriptorProto>, StoreError> {
    let mut files: Vec<FileDescriptorProto> = Vec::with_capacity(raw.len());

    for bytes in raw {
        let file = FileDescriptorProto::decode(bytes.as_slice())?;
        if file.name().is_empty() {
            return Err(StoreError::UnnamedFile);
        }
        if !files.iter().any(|f| f.name() == file.name()) {
            files.push(file);
        }
    }

    Ok(files)
}

/// Builds a pool holding `files`, adding every file after its imports.
fn build_pool(files: &HashMap<String, FileDescriptorProto>) -> Result<DescriptorPool, StoreError> {
    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_protos(dependency_order(files)?)
        .map_err(|err| StoreError::Descriptor(Arc::new(err)))?;
    Ok(pool)
}

/// Sorts `files` so that every file comes after the files it imports.
fn dependency_order(
    files: &HashMap<String, FileDescriptorProto>,
) -> Result<Vec<FileDescriptorProto>, StoreError> {
    fn visit<'a>(
        name: &'a str,
        files: &'a HashMap<String, FileDescriptorProto>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
        ordered: &mut Vec<FileDescriptorProto>,
    ) -> Result<(), StoreError> {
        if done.contains(name) {
            return Ok(());
        }
        let Some(file) = files.get(name) else {
            // Reported by the pool as a missing import.
            return Ok(());
        };
        if !visiting.insert(name) {
            return Err(StoreError::ImportCycle(name.to_string()));
        }
        for import in &file.dependency {
            visit(import, files, visiting, done, ordered)?;
        }
        visiting.remove(name);
        done.insert(name);
        ordered.push(file.clone());
        Ok(())
    }

    let mut names: Vec<&str> = files.keys().map(String::as_str).collect();
    names.sort_unstable();

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    let mut ordered = Vec::with_capacity(files.len());
    for name in names {
        visit(name, files, &mut visiting, &mut done, &mut ordered)?;
    }
    Ok(ordered)
}

/// `file` plus every file importing it, directly or not.
fn dependents_of(files: &HashMap<String, FileDescriptorProto>, file: &str) -> Vec<String> {
    let mut found = vec![file.to_string()];
    let mut cursor = 0;

    while cursor < found.len() {
        let target = found[cursor].clone();
        for (name, candidate) in files {
            if candidate.dependency.contains(&target) && !found.contains(name) {
                found.push(name.clone());
            }
        }
        cursor += 1;
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSource;

    fn file(name: &str, package: &str, imports: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            package: Some(package.to_string()),
            dependency: imports.iter().map(|s| s.to_string()).collect(),
            syntax: Some("proto3".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_fetches_missing_imports_transitively() {
        let source = FakeSource::greeter();
        let store = DescriptorStore::new(source.clone());

        let greeter = source.encoded_file("pkg/greeter.proto");
        store.insert(vec![greeter]).await.unwrap();

        assert_eq!(
            store.file_names(),
            vec![
                "google/protobuf/timestamp.proto",
                "pkg/greeter.proto",
                "pkg/types.proto",
            ]
        );
        assert!(store.lookup_message("pkg.types.Profile").is_some());
        assert!(store.lookup_message("google.protobuf.Timestamp").is_some());
        assert_eq!(
            source.calls(),
            vec![
                "file_by_name:pkg/types.proto",
                "file_by_name:google/protobuf/timestamp.proto",
            ]
        );
    }

    #[tokio::test]
    async fn files_already_present_are_not_fetched_again() {
        let source = FakeSource::greeter();
        let store = DescriptorStore::new(source.clone());

        store
            .insert(vec![source.encoded_file("pkg/types.proto")])
            .await
            .unwrap();
        source.clear_calls();

        store
            .insert(vec![source.encoded_file("pkg/greeter.proto")])
            .await
            .unwrap();

        assert!(source.calls().is_empty());
        assert!(store.lookup_method("pkg.Greeter", "SayHello").is_ok());
    }

    #[tokio::test]
    async fn failed_import_leaves_the_file_invisible() {
        let source = FakeSource::default();
        let store = DescriptorStore::new(source.clone());

        let orphan = file("orphan.proto", "orphan", &["missing.proto"]).encode_to_vec();
        let result = store.insert(vec![orphan]).await;

        assert!(matches!(
            result,
            Err(StoreError::Fetch { file, source: ReflectionError::NotFound { .. } }) if file == "missing.proto"
        ));
        assert!(!store.contains_file("orphan.proto"));
        assert!(store.file_names().is_empty());
    }

    #[tokio::test]
    async fn import_cycles_are_rejected() {
        let source = FakeSource::default();
        source.add_file(file("b.proto", "b", &["a.proto"]));
        let store = DescriptorStore::new(source.clone());

        let a = file("a.proto", "a", &["b.proto"]).encode_to_vec();
        let result = store.insert(vec![a]).await;

        assert!(matches!(result, Err(StoreError::ImportCycle(name)) if name == "a.proto"));
        assert!(store.file_names().is_empty());
    }

    #[tokio::test]
    async fn cycles_inside_one_batch_are_rejected() {
        let store = DescriptorStore::new(FakeSource::default());

        let a = file("a.proto", "a", &["b.proto"]).encode_to_vec();
        let b = file("b.proto", "b", &["a.proto"]).encode_to_vec();

        assert!(matches!(
            store.insert(vec![a, b]).await,
            Err(StoreError::ImportCycle(_))
        ));
        assert!(store.file_names().is_empty());
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_decode_error() {
        let store = DescriptorStore::new(FakeSource::default());
        let result = store.insert(vec![vec![0xff, 0xff, 0xff]]).await;
        assert!(matches!(result, Err(StoreError::Decode(_))));
    }

    #[tokio::test]
    async fn lookup_method_distinguishes_service_and_method() {
        let source = FakeSource::greeter();
        let store = DescriptorStore::new(source.clone());
        store
            .insert(vec![source.encoded_file("pkg/greeter.proto")])
            .await
            .unwrap();

        let method = store.lookup_method("pkg.Greeter", "SayHello").unwrap();
        assert_eq!(method.input().full_name(), "pkg.HelloRequest");
        assert_eq!(method.output().full_name(), "pkg.HelloReply");

        assert_eq!(
            store.lookup_method("pkg.Ghost", "SayHello").unwrap_err(),
            LookupError::ServiceNotFound("pkg.Ghost".to_string())
        );
        assert_eq!(
            store.lookup_method("pkg.Greeter", "Nonexistent").unwrap_err(),
            LookupError::MethodNotFound {
                service: "pkg.Greeter".to_string(),
                method: "Nonexistent".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn invalidate_drops_the_service_file_and_its_dependents() {
        let source = FakeSource::greeter();
        let store = DescriptorStore::new(source.clone());
        store
            .insert(vec![source.encoded_file("pkg/greeter.proto")])
            .await
            .unwrap();
        let previous = store.lookup_service("pkg.Greeter").unwrap();

        assert!(store.invalidate("pkg.Greeter"));
        assert!(!store.invalidate("pkg.Greeter"));

        assert!(store.lookup_service("pkg.Greeter").is_none());
        assert!(store.contains_file("pkg/types.proto"));
        // Descriptors handed out earlier stay usable.
        assert_eq!(previous.methods().count(), 5);
    }

    #[tokio::test]
    async fn a_changed_file_replaces_the_previous_version() {
        let store = DescriptorStore::new(FakeSource::default());

        let mut v1 = file("svc.proto", "svc", &[]);
        v1.message_type.push(prost_types::DescriptorProto {
            name: Some("Old".to_string()),
            ..Default::default()
        });
        store.insert(vec![v1.encode_to_vec()]).await.unwrap();

        let mut v2 = file("svc.proto", "svc", &[]);
        v2.message_type.push(prost_types::DescriptorProto {
            name: Some("New".to_string()),
            ..Default::default()
        });
        store.insert(vec![v2.encode_to_vec()]).await.unwrap();

        assert_eq!(store.file_names(), vec!["svc.proto"]);
        assert!(store.lookup_message("svc.Old").is_none());
        assert!(store.lookup_message("svc.New").is_some());
    }

    #[tokio::test]
    async fn concurrent_inserts_fetch_each_import_once() {
        let source = FakeSource::greeter().with_delay(std::time::Duration::from_millis(20));
        let store = DescriptorStore::new(source.clone());
        let greeter = source.encoded_file("pkg/greeter.proto");

        let inserts = (0..6).map(|_| {
            let store = store.clone();
            let greeter = greeter.clone();
            tokio::spawn(async move { store.insert(vec![greeter]).await })
        });
        for handle in inserts.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }

        let fetches = source.calls();
        assert_eq!(
            fetches
                .iter()
                .filter(|c| *c == "file_by_name:pkg/types.proto")
                .count(),
            1
        );
        assert_eq!(
            fetches
                .iter()
                .filter(|c| *c == "file_by_name:google/protobuf/timestamp.proto")
                .count(),
            1
        );
    }
}
