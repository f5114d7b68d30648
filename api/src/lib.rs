#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the CRD types consumed and served by the sync agent.
//!
//! The `v1alpha1` module holds the service-side `PublishedResource` CRD; the
//! `platform` module holds the platform-plane types (`ApiExport`,
//! `ApiResourceSchema`) the agent reads and writes but does not own.

pub mod platform;
pub mod v1alpha1;

/// GROUP is the kubernetes API group of the agent's own CRDs.
pub static GROUP: &str = "syncagent.servicebridge.io";

/// PLATFORM_GROUP is the API group of the platform-plane types.
pub static PLATFORM_GROUP: &str = "platform.servicebridge.io";

#[cfg(test)]
mod tests {
    use super::*;

    use kube::core::{CustomResourceExt, Resource};

    #[test]
    fn dummy() {
        println!("name = {}", v1alpha1::PublishedResource::crd_name());
        println!("kind = {}", v1alpha1::PublishedResource::kind(&()));
    }

    #[test]
    fn crd_groups() {
        assert_eq!(v1alpha1::PublishedResource::group(&()), GROUP);
        assert_eq!(platform::ApiExport::group(&()), PLATFORM_GROUP);
        assert_eq!(platform::ApiResourceSchema::group(&()), PLATFORM_GROUP);
    }
}
