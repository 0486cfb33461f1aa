#![allow(clippy::unwrap_used)]

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/proto/lnrpc.proto");

    tonic_prost_build::configure()
        .build_server(false)
        .build_transport(false)
        .type_attribute(".", "#[allow(missing_docs)]")
        .field_attribute(".", "#[allow(missing_docs)]")
        .compile_protos(&["src/proto/lnrpc.proto"], &["src/proto"])?;

    Ok(())
}
