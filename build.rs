// build.rs
fn main() {
    println!("cargo:rerun-if-changed=proto/fleetbench.proto");

    // Use the vendored protoc unless the caller already points at one.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc is available");
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/fleetbench.proto"], &["proto"])
        .unwrap();
}
