extern crate tonic_build;

fn main() {
    tonic_build::configure()
        .build_server(true)
        .compile(&["proto/csi.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("CSI protobuf compilation failed: {}", e));
    println!("cargo:rerun-if-changed=proto/csi.proto");
}
