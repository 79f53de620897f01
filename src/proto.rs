//! Generated protobuf/gRPC bindings, compiled in `build.rs` via `protox`
//! (no system `protoc` required) and `tonic-build`.

pub mod weather {
    tonic::include_proto!("weather");
}

pub mod snowgauge {
    tonic::include_proto!("snowgauge");
}

pub const WEATHER_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/weather_descriptor.bin"));
