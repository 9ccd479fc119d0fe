//! In-memory [`DescriptorSource`] for unit tests.
use crate::reflection::{DescriptorSource, ReflectionError};
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct State {
    files: BTreeMap<String, FileDescriptorProto>,
    calls: Vec<String>,
}

/// Serves files from memory and records every query it receives.
///
/// File queries answer with the requested file only, never with its imports.
#[derive(Clone, Default)]
pub(crate) struct FakeSource {
    state: Arc<Mutex<State>>,
    delay: Duration,
}

impl FakeSource {
    pub(crate) fn greeter() -> Self {
        let set = FileDescriptorSet::decode(greeter_service::FILE_DESCRIPTOR_SET).unwrap();
        let source = Self::default();
        for file in set.file {
            source.add_file(file);
        }
        source
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn add_file(&self, file: FileDescriptorProto) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(file.name().to_string(), file);
    }

    pub(crate) fn remove_file(&self, name: &str) {
        self.state.lock().unwrap().files.remove(name);
    }

    pub(crate) fn encoded_file(&self, name: &str) -> Vec<u8> {
        self.state.lock().unwrap().files[name].encode_to_vec()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn not_found(subject: &str) -> ReflectionError {
        ReflectionError::NotFound {
            subject: subject.to_string(),
            code: tonic::Code::NotFound as i32,
            message: "not found".to_string(),
        }
    }
}

fn defines(file: &FileDescriptorProto, symbol: &str) -> bool {
    let qualify = |name: &str| match file.package() {
        "" => name.to_string(),
        package => format!("{package}.{name}"),
    };

    file.service.iter().any(|s| qualify(s.name()) == symbol)
        || file.message_type.iter().any(|m| qualify(m.name()) == symbol)
        || file.enum_type.iter().any(|e| qualify(e.name()) == symbol)
}

impl DescriptorSource for FakeSource {
    async fn list_services(&self) -> Result<Vec<String>, ReflectionError> {
        self.record("list_services".to_string());
        tokio::time::sleep(self.delay).await;

        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .values()
            .flat_map(|file| {
                file.service.iter().map(move |s| match file.package() {
                    "" => s.name().to_string(),
                    package => format!("{package}.{}", s.name()),
                })
            })
            .collect())
    }

    async fn file_containing_symbol(&self, symbol: &str) -> Result<Vec<Vec<u8>>, ReflectionError> {
        self.record(format!("file_containing_symbol:{symbol}"));
        tokio::time::sleep(self.delay).await;

        let state = self.state.lock().unwrap();
        state
            .files
            .values()
            .find(|file| defines(file, symbol))
            .map(|file| vec![file.encode_to_vec()])
            .ok_or_else(|| Self::not_found(symbol))
    }

    async fn file_by_name(&self, name: &str) -> Result<Vec<Vec<u8>>, ReflectionError> {
        self.record(format!("file_by_name:{name}"));
        tokio::time::sleep(self.delay).await;

        let state = self.state.lock().unwrap();
        state
            .files
            .get(name)
            .map(|file| vec![file.encode_to_vec()])
            .ok_or_else(|| Self::not_found(name))
    }
}
