//! image-prefetch agent library
//!
//! Warms the local container runtime's image store ahead of a build: each
//! submitted image is pulled in the background through the Docker daemon,
//! with registry credentials resolved on the caller's behalf and pull
//! progress reported through `tracing`.
//!
//! ## Architecture
//!
//! ```text
//! Prefetcher ──► CredentialResolver   (registry host → credential)
//!     │
//!     └────────► ImageRuntime         (one shared handle, e.g. DockerClient)
//!                    │
//!                    └─► ProgressDecoder ─► ProgressLog ─► log
//! ```
//!
//! ## Modules
//!
//! - `prefetch`: submit/join orchestration of background pulls
//! - `progress`: pull stream decoding and log projection
//! - `credentials`: registry credential resolution
//! - `docker`: Docker Engine API runtime
//! - `runtime`: runtime interface and mock

pub mod config;
pub mod credentials;
pub mod docker;
pub mod prefetch;
pub mod progress;
pub mod runtime;

// Re-export commonly used types
pub use credentials::{Credential, CredentialResolver, DockerConfigKeychain, ResolveError};
pub use prefetch::{PullError, Prefetcher};
pub use prefetch_reference::{ImageReference, ReferenceError};
pub use progress::{EveryEvent, ProgressDecoder, ProgressEvent, ProgressLog, SkipTransferTicks};
pub use runtime::{ImageRuntime, MockRuntime, PullStartError, PullStream};
