//! # Greeter Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC backend and a
//! descriptor set for integration testing the `gbridge` bridge.
//! It is not intended for production use.
use futures_util::Stream;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tonic::metadata::MetadataValue;
use tonic::{Code, Request, Response, Status, Streaming};

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/pkg.rs"));

    pub mod types {
        include!(concat!(env!("OUT_DIR"), "/pkg.types.rs"));
    }
}

pub use pb::greeter_server::{Greeter, GreeterServer};
use pb::{FailRequest, HelloReply, HelloRequest, types::Profile};

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

/// Metadata key attached to every successful `SayHello` response.
pub const VERSION_METADATA_KEY: &str = "x-greeter-version";

/// A backend whose behaviour is fully determined by its inputs.
///
/// * `SayHello` answers `Hello, <name>` and rejects an empty name with `INVALID_ARGUMENT`.
/// * `UpdateProfile` echoes the profile back.
/// * `Fail` answers with the requested status code and message.
/// * `StreamGreetings` and `CollectNames` exist so that streaming methods can be discovered.
#[derive(Debug, Default, Clone)]
pub struct GreeterBackend;

#[tonic::async_trait]
impl Greeter for GreeterBackend {
    type StreamGreetingsStream = Pin<Box<dyn Stream<Item = Result<HelloReply, Status>> + Send>>;

    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let name = request.into_inner().name;

        if name.is_empty() {
            return Err(Status::invalid_argument("name must not be empty"));
        }

        let mut response = Response::new(HelloReply {
            greeting: format!("Hello, {name}"),
        });
        response
            .metadata_mut()
            .insert(VERSION_METADATA_KEY, MetadataValue::from_static("1"));

        Ok(response)
    }

    async fn update_profile(
        &self,
        request: Request<Profile>,
    ) -> Result<Response<Profile>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    async fn fail(&self, request: Request<FailRequest>) -> Result<Response<HelloReply>, Status> {
        let FailRequest { code, message } = request.into_inner();
        Err(Status::new(Code::from_i32(code), message))
    }

    async fn stream_greetings(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<Self::StreamGreetingsStream>, Status> {
        let name = request.into_inner().name;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for i in 0..3 {
                let reply = HelloReply {
                    greeting: format!("Hello #{i}, {name}"),
                };
                tx.send(Ok(reply)).await.ok();
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn collect_names(
        &self,
        request: Request<Streaming<HelloRequest>>,
    ) -> Result<Response<HelloReply>, Status> {
        let mut stream = request.into_inner();
        let mut names = Vec::new();

        while let Some(req) = stream.next().await {
            names.push(req?.name);
        }

        Ok(Response::new(HelloReply {
            greeting: format!("Hello, {}", names.join(" & ")),
        }))
    }
}
