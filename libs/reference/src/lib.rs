//! # prefetch-reference
//!
//! Parsing of container image references such as `alpine`,
//! `ghcr.io/org/app:v1` or `localhost:5000/app@sha256:...`.
//!
//! ## Normalization
//!
//! Only the normalization of the standard Docker reference grammar is applied:
//!
//! - a reference without a registry component lives on `index.docker.io`
//! - a single-component Docker Hub repository is prefixed with `library/`
//! - a reference with neither tag nor digest is tag `latest`
//!
//! Anything else that does not match the grammar is rejected with a
//! [`ReferenceError`]; parsing never produces a partial reference.

mod error;
mod reference;

pub use error::ReferenceError;
pub use reference::{ImageReference, DEFAULT_REGISTRY, DEFAULT_TAG};
