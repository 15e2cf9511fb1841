//! Shared runtime for manager modules.
//!
//! One dispatcher loop per process: subscribe `<module>.#`, parse the
//! request envelope, look the operation up in the handler table, and spawn
//! the handler. Handlers convert every failure into a bus message; nothing
//! propagates back into the loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusError, MessageBus};
use crate::config::Settings;
use crate::lock::{LockError, LockName, LockService};
use crate::rpc::{Liveness, LivenessStatus, Pinger, RequestEnvelope};
use crate::signals::SignalHub;
use crate::task::{TaskRegistry, TaskSupervisor};

/// Errors that abort a manager at startup or teardown.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Another instance of this module already runs on the host.
    #[error("module lock for '{module}' is held by pid {holder}")]
    SelfLock { module: String, holder: u32 },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("signal handler installation failed: {0}")]
    Signals(std::io::Error),
}

/// Everything a handler needs, shared across one manager process.
pub struct ModuleContext {
    pub module: &'static str,
    pub settings: Settings,
    pub bus: Arc<MessageBus>,
    pub locks: Arc<LockService>,
    pub registry: Arc<TaskRegistry>,
    pub liveness: Arc<Liveness>,
    pub supervisor: Arc<TaskSupervisor>,
    pub hub: SignalHub,
}

impl ModuleContext {
    /// Wire up bus, locks, registry, liveness and signal handling for a
    /// manager process.
    pub fn initialize(
        module: &'static str,
        settings: Settings,
    ) -> Result<Arc<Self>, ModuleError> {
        let bus = Arc::new(MessageBus::new(settings.ipc_dir())?);
        let locks = Arc::new(LockService::new(settings.lock_dir())?);
        let registry = TaskRegistry::new();
        let liveness = Liveness::new(module);
        let supervisor = Arc::new(TaskSupervisor::new(
            Arc::clone(&bus),
            Arc::clone(&locks),
            Arc::clone(&registry),
            Arc::clone(&liveness),
        ));
        let hub = SignalHub::install().map_err(ModuleError::Signals)?;

        Ok(Arc::new(Self {
            module,
            settings,
            bus,
            locks,
            registry,
            liveness,
            supervisor,
            hub,
        }))
    }

    /// Context over an existing bus/lock pair (used by tests and the
    /// embedded managers in integration scenarios).
    pub fn with_parts(
        module: &'static str,
        settings: Settings,
        bus: Arc<MessageBus>,
        locks: Arc<LockService>,
        hub: SignalHub,
    ) -> Arc<Self> {
        let registry = TaskRegistry::new();
        let liveness = Liveness::new(module);
        let supervisor = Arc::new(TaskSupervisor::new(
            Arc::clone(&bus),
            Arc::clone(&locks),
            Arc::clone(&registry),
            Arc::clone(&liveness),
        ));
        Arc::new(Self {
            module,
            settings,
            bus,
            locks,
            registry,
            liveness,
            supervisor,
            hub,
        })
    }
}

/// An operation handler: consumes the parsed envelope, replies on the bus.
pub type Handler = Box<
    dyn Fn(Arc<ModuleContext>, RequestEnvelope) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// The dispatcher for one manager module.
pub struct ModuleRuntime {
    ctx: Arc<ModuleContext>,
    handlers: HashMap<String, Handler>,
}

impl ModuleRuntime {
    pub fn new(ctx: Arc<ModuleContext>) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
        }
    }

    /// The shared context (for embedding tests).
    pub fn context(&self) -> &Arc<ModuleContext> {
        &self.ctx
    }

    /// Register a handler for `<module>.<operation>`.
    pub fn register<F, Fut>(&mut self, operation: &str, handler: F)
    where
        F: Fn(Arc<ModuleContext>, RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            operation.to_string(),
            Box::new(move |ctx, envelope| Box::pin(handler(ctx, envelope))),
        );
    }

    /// Run the dispatcher until shutdown.
    ///
    /// Acquires the module's own lock first; a second instance of the same
    /// manager on one host is refused.
    pub async fn run(self) -> Result<(), ModuleError> {
        let module = self.ctx.module;
        let module_lock = LockName::module(module);
        match self.ctx.locks.acquire(&module_lock) {
            Ok(()) => {}
            Err(LockError::Busy { holder }) => {
                return Err(ModuleError::SelfLock {
                    module: module.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(module, pid = std::process::id(), "manager starting");
        let pinger = Pinger::spawn(Arc::clone(&self.ctx.bus), Arc::clone(&self.ctx.liveness));
        self.ctx.liveness.set_status(LivenessStatus::Ready);

        let mut sub = self.ctx.bus.subscribe(&format!("{module}.#"));
        let shutdown = self.ctx.hub.shutdown_token();
        let prefix = format!("{module}.");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = sub.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let Some(operation) = message.topic.strip_prefix(&prefix) else {
                continue;
            };
            if operation == "ping" {
                continue;
            }
            let Some(handler) = self.handlers.get(operation) else {
                debug!(module, operation, "no handler registered");
                continue;
            };
            let envelope = match RequestEnvelope::from_value(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // No replyTo to answer on; all we can do is log.
                    warn!(module, topic = %message.topic, "unparseable request: {e}");
                    continue;
                }
            };

            debug!(module, operation, request_id = %envelope.request_id, "dispatching");
            tokio::spawn(handler(Arc::clone(&self.ctx), envelope));
        }

        info!(module, "manager shutting down");
        // Cancel in-flight tasks and give them a moment to publish their
        // terminal status.
        for snapshot in self.ctx.registry.snapshots() {
            self.ctx.registry.cancel(&snapshot.key);
        }
        let wind_down = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
        while !self.ctx.registry.snapshots().is_empty()
            && tokio::time::Instant::now() < wind_down
        {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        pinger.stop().await;
        self.ctx.bus.unsubscribe_all();
        self.ctx.bus.stop_watching().await;
        self.ctx.locks.release(&module_lock)?;
        Ok(())
    }
}
