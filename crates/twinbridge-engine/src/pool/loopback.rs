//! In-process protocol driver.
//!
//! Accepts every connection and records what it publishes. Failures and
//! delays can be injected, which makes it the driver for local runs and for
//! exercising supervision paths without a broker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use twinbridge_core::headers::Headers;
use twinbridge_core::model::Connection;

use crate::pool::client::{ClientContext, ClientError, InstantiationError, OutboundMessage, ProtocolClient, WorkerFactory};

#[derive(Default)]
struct LoopbackState {
    fail_creations: AtomicU32,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    connect_delay_ms: AtomicU64,
    hang_on_disconnect: AtomicBool,
    created: AtomicU32,
    connects: AtomicU32,
    disconnects: AtomicU32,
    dry_runs: AtomicU32,
    published: Mutex<Vec<OutboundMessage>>,
}

/// Consume one unit of an injected-failure budget.
fn take(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct LoopbackFactory {
    state: Arc<LoopbackState>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` client creations fail.
    pub fn fail_next_creations(&self, n: u32) -> &Self {
        self.state.fail_creations.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_next_connects(&self, n: u32) -> &Self {
        self.state.fail_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_next_publishes(&self, n: u32) -> &Self {
        self.state.fail_publishes.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        self.state
            .connect_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
        self
    }

    /// Disconnects never complete while set.
    pub fn hang_on_disconnect(&self, hang: bool) -> &Self {
        self.state.hang_on_disconnect.store(hang, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> u32 {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn dry_runs(&self) -> u32 {
        self.state.dry_runs.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.published.lock().clone()
    }
}

impl WorkerFactory for LoopbackFactory {
    fn create(&self, connection: &Connection, _headers: &Headers) -> Result<Box<dyn ProtocolClient>, InstantiationError> {
        if take(&self.state.fail_creations) {
            return Err(InstantiationError(format!(
                "loopback client for {} could not be created",
                connection.id()
            )));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackClient {
            state: self.state.clone(),
        }))
    }
}

struct LoopbackClient {
    state: Arc<LoopbackState>,
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(&mut self, ctx: &ClientContext) -> Result<(), ClientError> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take(&self.state.fail_connects) {
            return Err(ClientError::Connect(format!("{} refused the connection", ctx.connection().uri())));
        }
        if ctx.is_dry_run() {
            self.state.dry_runs.fetch_add(1, Ordering::SeqCst);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        debug!(worker = %ctx.worker(), "loopback connected");
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), ClientError> {
        if take(&self.state.fail_publishes) {
            return Err(ClientError::Publish(format!("{} rejected the message", message.address)));
        }
        self.state.published.lock().push(message.clone());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.state.hang_on_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
