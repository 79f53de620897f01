fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = "proto";
    let files = ["weather.proto", "snowgauge.proto"];

    for file in &files {
        println!("cargo:rerun-if-changed={proto_dir}/{file}");
    }

    let file_descriptor_set = protox::compile(files, [proto_dir])?;

    let descriptor_path = std::path::PathBuf::from(std::env::var("OUT_DIR")?).join("weather_descriptor.bin");
    std::fs::write(&descriptor_path, prost::Message::encode_to_vec(&file_descriptor_set))?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(&descriptor_path)
        .skip_protoc_run()
        .compile_fds(file_descriptor_set)?;

    Ok(())
}
