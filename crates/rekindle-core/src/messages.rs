// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance message log.
//!
//! Messages are appended to the [`MessageStore`] and pulled into memory by a
//! single-flight delivery pass:
//!
//! ```text
//!   notify ──► Idle ──► Running ──(pass done)──► Idle
//!                          │  ▲
//!               notify     │  │ re-run pass
//!                          ▼  │
//!                   RunningWithPending
//! ```
//!
//! A notification that arrives while a pass is running never starts a second
//! pass; it marks the running one as pending so it repeats before going idle.
//! Notifications come from local appends and from the store's change feed,
//! which covers appends made by other processes.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::error::Result;
use crate::serializer::Serializer;
use crate::sink::{Component, ExceptionSink, FrameworkError};
use crate::store::{FunctionStore, MessageStore, StoredMessage};
use crate::types::FunctionId;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RUNNING_WITH_PENDING: u8 = 2;

/// Appends messages to a function's log from outside the function.
#[derive(Clone)]
pub struct MessageWriter {
    function_id: FunctionId,
    messages: Arc<dyn MessageStore>,
    functions: Arc<dyn FunctionStore>,
    serializer: Arc<dyn Serializer>,
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("function_id", &self.function_id)
            .finish_non_exhaustive()
    }
}

impl MessageWriter {
    /// Create a writer for `function_id`.
    pub fn new(
        function_id: FunctionId,
        messages: Arc<dyn MessageStore>,
        functions: Arc<dyn FunctionStore>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            function_id,
            messages,
            functions,
            serializer,
        }
    }

    /// Target function.
    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    /// Append `message`. Returns false when `idempotency_key` was already used
    /// in this log, in which case nothing is stored.
    pub async fn append<T: Serialize>(
        &self,
        message: &T,
        idempotency_key: Option<&str>,
    ) -> Result<bool> {
        let payload = self.serializer.as_ref().to_payload(message)?;
        let appended = self
            .messages
            .append_message(
                &self.function_id,
                payload,
                idempotency_key.map(str::to_string),
            )
            .await?;
        if !appended {
            debug!(
                function_id = %self.function_id,
                idempotency_key,
                "Duplicate message ignored"
            );
            return Ok(false);
        }

        self.functions
            .increment_interrupt_count(&self.function_id)
            .await?;
        trace!(function_id = %self.function_id, "Message appended");
        Ok(true)
    }
}

#[derive(Default)]
struct Delivered {
    messages: Vec<StoredMessage>,
    seen_keys: HashSet<String>,
    cursor: usize,
    subscribers: Vec<mpsc::UnboundedSender<StoredMessage>>,
}

struct LogInner {
    function_id: FunctionId,
    store: Arc<dyn MessageStore>,
    serializer: Arc<dyn Serializer>,
    sink: ExceptionSink,
    delivery: AtomicU8,
    delivered: Mutex<Delivered>,
}

impl LogInner {
    /// Request a delivery pass. Returns once a pass has been started or an
    /// already running pass has been told to repeat.
    async fn notify(&self) {
        loop {
            match self
                .delivery
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(RUNNING) => {
                    if self
                        .delivery
                        .compare_exchange(
                            RUNNING,
                            RUNNING_WITH_PENDING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    // Raced with the pass finishing; try again.
                }
                Err(_) => return,
            }
        }

        loop {
            if let Err(e) = self.pull().await {
                self.sink.report(
                    FrameworkError::new(
                        Component::MessageDelivery,
                        format!("message delivery failed: {e}"),
                    )
                    .with_function(&self.function_id),
                );
            }

            if self
                .delivery
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            self.delivery.store(RUNNING, Ordering::Release);
        }
    }

    async fn pull(&self) -> Result<()> {
        let mut delivered = self.delivered.lock().await;
        let fresh = self
            .store
            .get_messages(&self.function_id, delivered.cursor)
            .await?;

        for message in fresh {
            delivered.cursor += 1;
            if let Some(key) = &message.idempotency_key
                && !delivered.seen_keys.insert(key.clone())
            {
                continue;
            }
            delivered
                .subscribers
                .retain(|tx| tx.send(message.clone()).is_ok());
            delivered.messages.push(message);
        }
        Ok(())
    }
}

/// In-process view of one function's message log.
///
/// Cloning is cheap; the change-feed listener stops when the last clone drops.
#[derive(Clone)]
pub struct MessageLog {
    inner: Arc<LogInner>,
    writer: MessageWriter,
    _listener: Arc<DropGuard>,
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog")
            .field("function_id", &self.inner.function_id)
            .finish_non_exhaustive()
    }
}

impl MessageLog {
    /// Attach to `function_id`'s log and load the messages stored so far.
    pub async fn open(
        function_id: FunctionId,
        messages: Arc<dyn MessageStore>,
        functions: Arc<dyn FunctionStore>,
        serializer: Arc<dyn Serializer>,
        sink: ExceptionSink,
    ) -> Result<Self> {
        let inner = Arc::new(LogInner {
            function_id: function_id.clone(),
            store: messages.clone(),
            serializer: serializer.clone(),
            sink,
            delivery: AtomicU8::new(IDLE),
            delivered: Mutex::new(Delivered::default()),
        });

        let changes = messages.subscribe_to_changes();
        let cancel = CancellationToken::new();
        tokio::spawn(listen(Arc::downgrade(&inner), changes, cancel.clone()));

        inner.pull().await?;

        Ok(Self {
            inner,
            writer: MessageWriter::new(function_id, messages, functions, serializer),
            _listener: Arc::new(cancel.drop_guard()),
        })
    }

    /// Append `message` and deliver it to local subscribers before returning.
    ///
    /// Returns false when `idempotency_key` was already used in this log.
    pub async fn append<T: Serialize>(
        &self,
        message: &T,
        idempotency_key: Option<&str>,
    ) -> Result<bool> {
        let appended = self.writer.append(message, idempotency_key).await?;
        if appended {
            // A running pass may not see this message; pull under the lock.
            self.inner.pull().await?;
        }
        Ok(appended)
    }

    /// Pull anything the store holds that has not been delivered yet.
    pub async fn sync(&self) -> Result<()> {
        self.inner.pull().await
    }

    /// Messages delivered so far, in position order.
    pub async fn existing(&self) -> Vec<StoredMessage> {
        self.inner.delivered.lock().await.messages.clone()
    }

    /// Number of messages delivered so far.
    pub async fn len(&self) -> usize {
        self.inner.delivered.lock().await.messages.len()
    }

    /// Whether no message has been delivered yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delivered messages whose type tag matches `T`, decoded.
    pub async fn of_type<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let type_name = std::any::type_name::<T>();
        let delivered = self.existing().await;
        delivered
            .iter()
            .filter(|m| m.payload.type_name == type_name)
            .map(|m| self.decode(m))
            .collect()
    }

    /// Decode a delivered message.
    pub fn decode<T: DeserializeOwned>(&self, message: &StoredMessage) -> Result<T> {
        self.inner.serializer.as_ref().from_payload(&message.payload)
    }

    /// Receive messages from position `skip` onwards: first the delivered
    /// prefix, then every message delivered later.
    pub async fn subscribe(&self, skip: usize) -> MessageSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut delivered = self.inner.delivered.lock().await;
        for message in delivered.messages.iter().skip(skip) {
            let _ = tx.send(message.clone());
        }
        delivered.subscribers.push(tx);
        MessageSubscription {
            rx,
            serializer: self.inner.serializer.clone(),
        }
    }

    /// Writer appending to the same log.
    pub fn writer(&self) -> &MessageWriter {
        &self.writer
    }
}

async fn listen(
    inner: Weak<LogInner>,
    mut changes: broadcast::Receiver<FunctionId>,
    cancel: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            changed = changes.recv() => changed,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match changed {
            Ok(function_id) if function_id == inner.function_id => inner.notify().await,
            Ok(_) => {}
            // Missed notifications; a pass picks up whatever is new.
            Err(broadcast::error::RecvError::Lagged(_)) => inner.notify().await,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Ordered stream of messages handed out by [`MessageLog::subscribe`].
pub struct MessageSubscription {
    rx: mpsc::UnboundedReceiver<StoredMessage>,
    serializer: Arc<dyn Serializer>,
}

impl std::fmt::Debug for MessageSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSubscription").finish_non_exhaustive()
    }
}

impl MessageSubscription {
    /// Next message, or `None` once the log is gone.
    pub async fn recv(&mut self) -> Option<StoredMessage> {
        self.rx.recv().await
    }

    /// Next message decoded as `T`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.rx.recv().await {
            Some(message) => Ok(Some(self.serializer.as_ref().from_payload(&message.payload)?)),
            None => Ok(None),
        }
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StoredMessage> {
        self.rx.try_recv().ok()
    }
}

impl Stream for MessageSubscription {
    type Item = StoredMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
