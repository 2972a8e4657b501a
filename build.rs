fn main() -> Result<(), Box<dyn std::error::Error>> {
    // compile registry service proto files
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        // the server half is only needed by stub registries in tests
        .server_mod_attribute(
            "registry.v1",
            "#[cfg(any(test, feature = \"registry-server\"))]",
        )
        .compile_protos(&["proto/registry.proto"], &["proto"])?;

    // notify Cargo to rerun if source files change
    println!("cargo:rerun-if-changed=proto/registry.proto");
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
