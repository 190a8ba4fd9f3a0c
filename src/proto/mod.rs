//! Generated kubelet device plugin API types
//!
//! Compiled by `build.rs` from `proto/deviceplugin/v1beta1/api.proto`.

#[allow(clippy::all, missing_docs)]
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Device plugin API version announced at registration
pub const API_VERSION: &str = "v1beta1";
