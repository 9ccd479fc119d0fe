use gbridge_core::engine::{EngineOptions, InvocationEngine};
use greeter_service::{FILE_DESCRIPTOR_SET, GreeterBackend, GreeterServer};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tonic::service::Routes;
use tonic::transport::Server;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("gbridge_core=debug")
        .with_test_writer()
        .try_init();
}

/// The greeter backend with reflection enabled, served in process.
pub fn backend() -> Routes {
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();

    Routes::new(reflection_service).add_service(GreeterServer::new(GreeterBackend))
}

/// The greeter backend without reflection.
#[allow(dead_code)]
pub fn backend_without_reflection() -> Routes {
    Routes::new(GreeterServer::new(GreeterBackend))
}

#[allow(dead_code)]
pub fn engine(options: EngineOptions) -> InvocationEngine<Routes> {
    init_tracing();
    InvocationEngine::from_service(backend(), options)
}

/// The greeter backend served over TCP from its own thread and runtime.
///
/// Stopping it tears the runtime down, which closes every connection at once, open streams
/// included.
#[allow(dead_code)]
pub struct TcpBackend {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl TcpBackend {
    pub fn start(addr: SocketAddr) -> Self {
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                let server = Server::builder()
                    .add_routes(backend())
                    .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener));

                tokio::select! {
                    _ = server => {},
                    _ = rx => {},
                }
            });
        });

        Self {
            addr,
            shutdown: Some(tx),
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
