fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(false)
        .compile_protos(&["../proto/kubicd.proto"], &["../proto"])?;

    // Tell cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed=../proto/kubicd.proto");

    Ok(())
}
