fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Messages and both server and client stubs; kubicctl compiles its own copy
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/kubicd.proto"], &["proto"])?;

    // Tell cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed=proto/kubicd.proto");

    Ok(())
}
