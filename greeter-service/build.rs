use prost::Message;
use std::env::var;
use std::fs;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // List of proto files containing a service or message definition
    let proto_files = &["proto/pkg/greeter.proto", "proto/pkg/types.proto"];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = PathBuf::from(var("OUT_DIR")?);

    // protox is a pure Rust compiler, no `protoc` binary is needed on the build host
    let file_descriptor_set = protox::compile(proto_files, [proto_folder])?;

    fs::write(
        out_dir.join("descriptors.bin"),
        file_descriptor_set.encode_to_vec(),
    )?;

    tonic_prost_build::configure()
        .build_client(false)
        .compile_fds(file_descriptor_set)?;

    for file in proto_files {
        println!("cargo:rerun-if-changed={file}");
    }

    Ok(())
}
