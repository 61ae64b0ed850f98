//! Async cleanup stack for the resources behind a session

use std::future::Future;

use futures::future::BoxFuture;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Ordered set of async release actions, unwound last-in first-out.
///
/// Connectors push one entry per acquired resource as soon as it is acquired,
/// so a failure at any later step can release everything held so far.
#[derive(Default)]
pub struct ExitStack {
    entries: Vec<(String, Release)>,
}

impl ExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action for a resource that was just acquired
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries
            .push((label.into(), Box::new(move || Box::pin(release()))));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every release action in reverse order of registration.
    ///
    /// A failing action does not stop the remaining ones; all failures are
    /// reported together once the stack is empty.
    pub async fn close(mut self) -> anyhow::Result<()> {
        let mut failures = Vec::new();

        while let Some((label, release)) = self.entries.pop() {
            match release().await {
                Ok(()) => tracing::debug!(resource = %label, "released"),
                Err(e) => {
                    tracing::warn!(resource = %label, "release failed: {:#}", e);
                    failures.push(format!("{}: {:#}", label, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(failures.join("; ")))
        }
    }
}

impl std::fmt::Debug for ExitStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(label, _)| label))
            .finish()
    }
}
