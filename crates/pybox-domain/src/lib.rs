#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod descriptor;
pub mod errors;
pub mod platform;
pub mod release;
pub mod requirement;
pub mod version;

pub use descriptor::{descriptor_version, DESCRIPTOR_FILE};
pub use errors::ProvisionError;
pub use platform::{Platform, PLATFORMS};
pub use release::{
    install_only_version, ArchiveFormat, Release, ReleaseAsset, RemoteAsset, ResolvedRelease,
    CHECKSUM_SUFFIX,
};
pub use requirement::{
    canonicalize_package_name, InstalledPackage, PackageRequirement, PACKAGE_MANAGER,
};
pub use version::{descending, VersionConstraint};
