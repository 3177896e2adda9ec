// Build script to generate Rust code from protobuf definitions
use std::io::Result;

fn main() -> Result<()> {
    // Use the vendored protoc unless the environment already points at one
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/worker.proto", "proto/fabric.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/worker.proto");
    println!("cargo:rerun-if-changed=proto/fabric.proto");

    Ok(())
}
