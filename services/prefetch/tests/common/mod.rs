//! Shared fixtures for prefetch integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::subscriber::DefaultGuard;

use prefetch_agent::docker::AuthEnvelope;
use prefetch_agent::{
    Credential, CredentialResolver, ImageReference, ImageRuntime, PullStartError, PullStream,
    ResolveError,
};

/// Log lines written by the fmt subscriber installed for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }

    /// Assert that each needle appears on some line, in the given order.
    pub fn assert_in_order(&self, needles: &[&str]) {
        let lines = self.lines();
        let mut from = 0;
        for needle in needles {
            let position = lines[from..]
                .iter()
                .position(|line| line.contains(needle))
                .unwrap_or_else(|| panic!("missing log line {needle:?} in {lines:#?}"));
            from += position + 1;
        }
    }
}

/// Capture info-level logs on this thread. Tests using this must run on a
/// current-thread runtime so spawned pull tasks log to the same subscriber.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}

/// Resolver returning the same credential for every registry.
pub struct StaticResolver(pub Credential);

impl CredentialResolver for StaticResolver {
    fn resolve(&self, _registry: &str) -> Result<Credential, ResolveError> {
        Ok(self.0.clone())
    }
}

/// Resolver that fails for every registry.
pub struct FailingResolver;

impl CredentialResolver for FailingResolver {
    fn resolve(&self, registry: &str) -> Result<Credential, ResolveError> {
        Err(ResolveError::NotFound(registry.to_string()))
    }
}

/// Resolver that blocks its thread until the test opens the gate.
pub struct GatedResolver {
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl GatedResolver {
    pub fn new() -> (Self, std::sync::mpsc::Sender<()>) {
        let (open, gate) = std::sync::mpsc::channel();
        (
            Self {
                gate: Mutex::new(gate),
            },
            open,
        )
    }
}

impl CredentialResolver for GatedResolver {
    fn resolve(&self, registry: &str) -> Result<Credential, ResolveError> {
        self.gate
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| ResolveError::NotFound(registry.to_string()))?;
        Ok(Credential::Anonymous)
    }
}

/// Runtime whose pull streams stay open until the test feeds or closes them.
#[derive(Default)]
pub struct ChannelRuntime {
    senders: Mutex<Vec<mpsc::Sender<io::Result<Bytes>>>>,
}

impl ChannelRuntime {
    pub fn started(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Wait until `count` pulls have been started.
    pub async fn wait_for_pulls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pulls did not start");
    }

    /// Send a frame on every open stream.
    pub async fn broadcast(&self, frame: &'static str) {
        let senders = self.senders.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(Ok(Bytes::from_static(frame.as_bytes()))).await;
        }
    }

    /// Close the stream of the pull started `index`-th.
    pub fn close(&self, index: usize) {
        let mut senders = self.senders.lock().unwrap();
        let (closed, _) = mpsc::channel(1);
        senders[index] = closed;
    }
}

#[async_trait]
impl ImageRuntime for ChannelRuntime {
    async fn pull_image(
        &self,
        _reference: &ImageReference,
        _auth: &AuthEnvelope,
    ) -> Result<PullStream, PullStartError> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().push(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
