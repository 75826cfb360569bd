fn main() -> Result<(), Box<dyn std::error::Error>> {
    // kettle.proto: management surface served on the daemon-wide socket
    // shim.proto: task control surface served by each shim on its own socket
    tonic_build::configure().compile_protos(
        &["proto/kettle.proto", "proto/shim.proto"],
        &["proto"],
    )?;
    Ok(())
}
