//! Background image pulls.
//!
//! [`Prefetcher::submit`] starts one task per image and returns immediately;
//! [`Prefetcher::join`] waits for every task submitted so far. Failures never
//! reach the submitter: each task logs its own outcome.
//!
//! ```text
//! submit(image) ──► task: parse ─► resolve credentials ─► pull_image ─► decode ─► log
//!                     │
//!                     └── Outstanding guard, released once the task ends
//! ```
//!
//! Each step fails with its own [`PullError`] variant. A frame in which the
//! daemon itself reports an error (`error`/`errorDetail`) ends the task with
//! [`PullError::Daemon`], so such a pull is never logged as pulled.
//!
//! Credential lookups may read files and run on the blocking pool.
//!
//! There is no bound on concurrent pulls, no deduplication of identical
//! images, and no cancellation; a pull runs until its stream ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use prefetch_reference::{ImageReference, ReferenceError};

use crate::credentials::{CredentialResolver, ResolveError};
use crate::docker::AuthEnvelope;
use crate::progress::{ProgressDecoder, ProgressError, ProgressLog, SkipTransferTicks};
use crate::runtime::{ImageRuntime, PullStartError};

/// Why a pull task ended without pulling its image.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("invalid image reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("failed to resolve credentials for {registry}: {source}")]
    Credentials {
        registry: String,
        #[source]
        source: ResolveError,
    },

    #[error("credential lookup for {registry} did not complete: {source}")]
    CredentialsTask {
        registry: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("failed to encode registry auth: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("failed to start pull: {0}")]
    Start(#[from] PullStartError),

    #[error("malformed progress message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to read pull stream: {0}")]
    Stream(#[source] std::io::Error),

    #[error("daemon reported: {0}")]
    Daemon(String),
}

impl From<ProgressError> for PullError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Decode(e) => PullError::Decode(e),
            ProgressError::Stream(e) => PullError::Stream(e),
        }
    }
}

/// Count of unfinished pull tasks.
#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn enter(self: &Arc<Self>) -> OutstandingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        OutstandingGuard(Arc::clone(self))
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            // Register before checking so a release between the check and
            // the await is not missed.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one task's share of the counter when dropped, on every exit path
/// of the task including a panic.
struct OutstandingGuard(Arc<Outstanding>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Starts image pulls in the background and waits for them on request.
pub struct Prefetcher {
    runtime: Arc<dyn ImageRuntime>,
    credentials: Arc<dyn CredentialResolver>,
    progress_log: Arc<dyn ProgressLog>,
    outstanding: Arc<Outstanding>,
    handle: Handle,
}

impl Prefetcher {
    /// Create a prefetcher that pulls through `runtime` and spawns its tasks
    /// on `handle`.
    pub fn new(
        runtime: Arc<dyn ImageRuntime>,
        credentials: Arc<dyn CredentialResolver>,
        handle: Handle,
    ) -> Self {
        Self {
            runtime,
            credentials,
            progress_log: Arc::new(SkipTransferTicks),
            outstanding: Arc::new(Outstanding::default()),
            handle,
        }
    }

    /// Replace the policy deciding which progress events are logged.
    pub fn with_progress_log(mut self, progress_log: Arc<dyn ProgressLog>) -> Self {
        self.progress_log = progress_log;
        self
    }

    /// Start pulling an image in the background.
    ///
    /// Returns immediately. The task is counted before this returns, so a
    /// following [`join`](Self::join) waits for it. Submitting the same
    /// image twice pulls it twice.
    pub fn submit(&self, image: impl Into<String>) {
        let image = image.into();
        info!("Pulling image, {image}");

        let guard = self.outstanding.enter();
        let task = PullTask {
            image,
            runtime: Arc::clone(&self.runtime),
            credentials: Arc::clone(&self.credentials),
            progress_log: Arc::clone(&self.progress_log),
        };

        self.handle.spawn(async move {
            let _guard = guard;
            task.run_logged().await;
        });
    }

    /// Wait until every task submitted before this call has finished.
    ///
    /// Tasks submitted while a join is already waiting may or may not be
    /// waited for, depending on whether the counter reached zero first.
    pub async fn join(&self) {
        self.outstanding.wait_idle().await;
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }
}

/// One image pull.
struct PullTask {
    image: String,
    runtime: Arc<dyn ImageRuntime>,
    credentials: Arc<dyn CredentialResolver>,
    progress_log: Arc<dyn ProgressLog>,
}

impl PullTask {
    /// Run the pull and log its failure; nothing is returned to the submitter.
    async fn run_logged(self) {
        if let Err(e) = self.run().await {
            error!(image = %self.image, error = %e, "Image pull failed");
        }
    }

    async fn run(&self) -> Result<(), PullError> {
        let reference = ImageReference::parse(&self.image)?;

        let registry = reference.registry().to_string();
        let credentials = Arc::clone(&self.credentials);
        let lookup = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || credentials.resolve(&registry))
        };
        let credential = match lookup.await {
            Ok(Ok(credential)) => credential,
            Ok(Err(source)) => return Err(PullError::Credentials { registry, source }),
            Err(source) => return Err(PullError::CredentialsTask { registry, source }),
        };
        debug!(
            image = %self.image,
            registry = %registry,
            anonymous = credential.is_anonymous(),
            "Resolved registry credentials"
        );

        let auth = AuthEnvelope::encode(&credential).map_err(PullError::Envelope)?;
        let stream = self.runtime.pull_image(&reference, &auth).await?;

        let mut decoder = ProgressDecoder::new(stream);
        while let Some(event) = decoder.next_event().await? {
            if let Some(message) = event.error_message() {
                return Err(PullError::Daemon(message.to_string()));
            }
            if let Some(line) = self.progress_log.line(&event) {
                info!(image = %self.image, "{line}");
            }
        }

        info!("Pulled image, {}", self.image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_with_nothing_outstanding() {
        let outstanding = Arc::new(Outstanding::default());
        tokio::time::timeout(Duration::from_secs(1), outstanding.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_release_wakes_waiter() {
        let outstanding = Arc::new(Outstanding::default());
        let first = outstanding.enter();
        let second = outstanding.enter();
        assert_eq!(outstanding.get(), 2);

        let waiter = tokio::spawn({
            let outstanding = Arc::clone(&outstanding);
            async move { outstanding.wait_idle().await }
        });

        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outstanding.get(), 0);
    }

    #[test]
    fn test_progress_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        assert!(matches!(
            PullError::from(ProgressError::Stream(io)),
            PullError::Stream(_)
        ));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            PullError::from(ProgressError::Decode(json)),
            PullError::Decode(_)
        ));
    }
}
