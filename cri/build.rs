fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CRI protobuf definitions for both supported API versions
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(
            &["proto/v1/api.proto", "proto/v1alpha2/api.proto"],
            &["proto"],
        )?;

    Ok(())
}
