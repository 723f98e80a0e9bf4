//! JSON-lines host bridge
//!
//! One JSON object per line in both directions. Inbound lines carry entity
//! state updates, user commands and priority controls; outbound lines carry
//! service calls, notifications, bus events and status replies. The host on
//! the other side performs the calls and reports the resulting states back.

use crate::config::AppConfig;
use crate::controller::{ControllerStatus, UserCommand};
use crate::dispatch::{CommandDispatcher, Notifier, ServiceCall};
use crate::error::{EvcmError, Result};
use crate::events::BusEvent;
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{JsonFileStore, KeyValueStore};
use crate::priority::PrioritySnapshot;
use crate::sensor::{EntityState, MemoryStateStore};
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

/// How long buffered output may take to drain on exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages read from the host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// New state of an entity; `null` means the entity is gone
    State {
        entity_id: String,
        #[serde(default)]
        state: Option<String>,
    },
    Command {
        entry_id: String,
        command: UserCommand,
    },
    PriorityMode {
        enabled: bool,
    },
    PriorityOrder {
        order: Vec<String>,
    },
    /// Move a charger to a 1-based position in the priority order
    PriorityIndex {
        entry_id: String,
        index: usize,
    },
    Status,
    RemoveCharger {
        entry_id: String,
    },
    Shutdown,
}

/// Messages written to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Call(ServiceCall),
    Notify {
        id: String,
        title: String,
        message: String,
    },
    Dismiss {
        id: String,
    },
    Event {
        event: BusEvent,
    },
    Status {
        chargers: Vec<ControllerStatus>,
        priority: PrioritySnapshot,
    },
    Error {
        message: String,
    },
}

/// Parse one inbound line
pub fn parse_line(line: &str) -> Result<Inbound> {
    serde_json::from_str(line.trim())
        .map_err(|e| EvcmError::serialization(format!("Invalid bridge message: {e}")))
}

/// Queue towards the output writer; doubles as dispatcher and notifier
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundSink {
    pub const fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: Outbound) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| EvcmError::io("bridge output closed"))
    }
}

// Success only means the call was handed to the host; controllers verify
// the effect through later state updates.
#[async_trait]
impl CommandDispatcher for OutboundSink {
    async fn call(&self, call: ServiceCall) -> Result<()> {
        self.send(Outbound::Call(call))
    }
}

#[async_trait]
impl Notifier for OutboundSink {
    async fn notify(&self, id: &str, title: &str, message: &str) -> Result<()> {
        self.send(Outbound::Notify {
            id: id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        })
    }

    async fn dismiss(&self, id: &str) -> Result<()> {
        self.send(Outbound::Dismiss { id: id.to_string() })
    }
}

async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn forward_events(mut rx: broadcast::Receiver<BusEvent>, sink: OutboundSink) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if sink.send(Outbound::Event { event }).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Supervisor wired to a line reader and writer
pub struct Bridge {
    supervisor: Supervisor,
    sink: OutboundSink,
    logger: StructuredLogger,
}

impl Bridge {
    /// Handle one inbound message; returns false when the host asked to stop
    pub async fn handle(&mut self, msg: Inbound) -> Result<bool> {
        match msg {
            Inbound::State { entity_id, state } => {
                let notified = self
                    .supervisor
                    .ingest_state(&entity_id, state.map(EntityState::new));
                self.logger
                    .debug(&format!("{entity_id} routed to {notified} controller(s)"));
            }
            Inbound::Command { entry_id, command } => {
                self.supervisor.command(&entry_id, command)?;
            }
            Inbound::PriorityMode { enabled } => self.supervisor.set_priority_mode(enabled),
            Inbound::PriorityOrder { order } => self.supervisor.set_priority_order(&order),
            Inbound::PriorityIndex { entry_id, index } => {
                self.supervisor.set_order_index(&entry_id, index)?;
            }
            Inbound::Status => {
                let chargers = self
                    .supervisor
                    .statuses()
                    .iter()
                    .map(|s| s.as_ref().clone())
                    .collect();
                self.sink.send(Outbound::Status {
                    chargers,
                    priority: self.supervisor.priority(),
                })?;
            }
            Inbound::RemoveCharger { entry_id } => {
                self.supervisor.remove_charger(&entry_id).await?;
            }
            Inbound::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        let result = match parse_line(line) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(keep_going) => keep_going,
            Err(e) => {
                self.logger.warn(&e.to_string());
                let _ = self.sink.send(Outbound::Error {
                    message: e.to_string(),
                });
                true
            }
        }
    }
}

/// Serve the bridge until the reader ends, the host sends `shutdown`, or
/// `stop` resolves. Controller state is stored under `config.storage_dir`.
pub async fn serve<R, W, F>(config: &AppConfig, reader: R, writer: W, stop: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&config.storage_dir));
    serve_with_store(config, kv, reader, writer, stop).await
}

/// [`serve`] over an explicit key-value store
pub async fn serve_with_store<R, W, F>(
    config: &AppConfig,
    kv: Arc<dyn KeyValueStore>,
    reader: R,
    writer: W,
    stop: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let logger = get_logger("bridge");
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = OutboundSink::new(tx);
    let writer_task = tokio::spawn(write_outbound(rx, writer));

    let store = Arc::new(MemoryStateStore::new());
    let supervisor = Supervisor::start(
        config,
        store,
        Arc::new(sink.clone()),
        Arc::new(sink.clone()),
        kv,
    )
    .await?;
    let forwarder = tokio::spawn(forward_events(supervisor.bus().subscribe(), sink.clone()));

    let mut bridge = Bridge {
        supervisor,
        sink,
        logger: logger.clone(),
    };
    let mut lines = reader.lines();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            () = &mut stop => {
                logger.info("Stop requested");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !bridge.handle_line(&line).await {
                        logger.info("Host requested shutdown");
                        break;
                    }
                }
                Ok(None) => {
                    logger.info("Input closed");
                    break;
                }
                Err(e) => {
                    logger.error(&format!("Failed to read input: {e}"));
                    break;
                }
            }
        }
    }

    let Bridge { supervisor, sink, .. } = bridge;
    supervisor.shutdown().await;
    forwarder.abort();
    drop(sink);
    match tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(EvcmError::generic(format!("Output writer failed: {e}"))),
        Err(_) => {
            logger.warn("Output did not drain in time");
            Ok(())
        }
    }
}
