fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Messages are prost-derived in src/grpc/proto.rs, so the service stubs
    // are described by hand instead of compiled from a .proto file.
    let ratelimiter = tonic_build::manual::Service::builder()
        .name("Ratelimiter")
        .package("sluice")
        .method(
            tonic_build::manual::Method::builder()
                .name("fetch")
                .route_name("Fetch")
                .input_type("crate::grpc::proto::FetchRequest")
                .output_type("crate::grpc::proto::FetchResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new()
        .build_server(true)
        .build_client(false)
        .compile(&[ratelimiter]);
}
