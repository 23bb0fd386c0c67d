//! Resolve container image references to digest-pinned references.
//!
//! [`ImageReference::parse`] normalizes a reference the way Docker does,
//! [`InsecureRegistries`] decides whether a registry gets TLS verification,
//! the [`keychain`] module builds the ordered credential chain, and
//! [`DigestResolver`] ties them together with a [`DigestQuery`] against the
//! registry.

pub mod config;
pub mod digest;
pub mod error;
pub mod image_reference;
pub mod insecure_registry;
pub mod keychain;
pub mod registry;
pub mod secret_string;

pub use config::{Config, load_config};
pub use digest::DigestResolver;
pub use error::{Error, Result};
pub use image_reference::{ImageReference, image_without_digest};
pub use insecure_registry::{InsecureRegistries, TransportPolicy};
pub use keychain::{Credentials, Keychain, KeychainBuilder, MultiKeychain};
pub use registry::{DigestQuery, RegistryClient};
