//! Events whose preconditions were not met, kept until a later invocation can handle them.

use anyhow::{Context, Result};
use oathkeeper_operator_reconcile::{self as reconcile, Event, Outcome, Reconciler};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// Handles a single event.
#[async_trait::async_trait]
pub trait Handler {
    async fn handle(&self, event: &Event) -> Result<Outcome, reconcile::Error>;
}

/// A queue of deferred events, persisted as JSON between invocations.
#[derive(Debug)]
pub struct DeferredQueue {
    path: PathBuf,
    events: Vec<Event>,
}

// === impl DeferredQueue ===

impl DeferredQueue {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let events = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to decode {}", path.display()))?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self { path, events })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn push(&mut self, event: Event) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec(&self.events)?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Re-runs every deferred event, in order, followed by `current`.
    ///
    /// Events that are deferred again stay queued. A fatal error stops processing: the failed
    /// event and everything after it stay queued and the error is returned. Non-fatal errors are
    /// logged and the event is dropped.
    pub async fn run<H: Handler + Sync>(
        &mut self,
        handler: &H,
        current: Option<Event>,
    ) -> Result<()> {
        let mut pending = std::mem::take(&mut self.events);
        if let Some(event) = current {
            if !pending.contains(&event) {
                pending.push(event);
            }
        }

        let mut pending = pending.into_iter();
        let mut failure = None;
        while let Some(event) = pending.next() {
            match handler.handle(&event).await {
                Ok(Outcome::Deferred(reason)) => {
                    info!(%event, %reason, "Deferring event");
                    self.push(event);
                }
                Ok(outcome) => debug!(%event, ?outcome, "Handled event"),
                Err(error) if !error.is_fatal() => {
                    warn!(%event, %error, "Failed to handle event");
                }
                Err(error) => {
                    self.push(event);
                    for event in pending.by_ref() {
                        self.push(event);
                    }
                    failure = Some(error);
                }
            }
        }

        self.save().await?;
        match failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Handler for Reconciler {
    async fn handle(&self, event: &Event) -> Result<Outcome, reconcile::Error> {
        Reconciler::handle(self, event).await
    }
}
