use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::buffer::ReorderBuffer;
use crate::manifest::ManifestTable;
use crate::message::Message;
use crate::sink::FileSink;
use crate::{Error, Result};

/// Grace period between processing an `is_last` message and persisting the
/// manifest, so the transport's trailing stream close can land first.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(40);

/// Receives ingress callbacks, keeps the manifest table and reorder buffer
/// consistent, and forwards sequentially complete bytes to the sink. Cheap to
/// clone; clones share one state.
///
/// Locking: `gate` makes the match-check and the `expected` advance one
/// atomic step, so exactly one caller can accept a given chunk index; the
/// inner locks only guard the collections themselves. Sink I/O always runs
/// with the gate released.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Shared>,
}

struct Shared {
    table: RwLock<ManifestTable>,
    buffer: Mutex<ReorderBuffer>,
    gate: tokio::sync::Mutex<()>,
    sink: Arc<dyn FileSink>,
    close_grace: Duration,
    stopping: AtomicBool,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl Coordinator {
    pub fn new(sink: Arc<dyn FileSink>) -> (Self, oneshot::Receiver<()>) {
        Self::with_close_grace(sink, DEFAULT_CLOSE_GRACE)
    }

    pub fn with_close_grace(
        sink: Arc<dyn FileSink>,
        close_grace: Duration,
    ) -> (Self, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        let coordinator = Self {
            inner: Arc::new(Shared {
                table: RwLock::new(ManifestTable::new()),
                buffer: Mutex::new(ReorderBuffer::new()),
                gate: tokio::sync::Mutex::new(()),
                sink,
                close_grace,
                stopping: AtomicBool::new(false),
                done: Mutex::new(Some(done_tx)),
            }),
        };
        (coordinator, done_rx)
    }

    /// One self-contained text or small-file field. Text never touches the
    /// buffer; small files are created, written and closed in one go.
    pub async fn handle_unary(&self, msg: Message) -> Result<()> {
        debug_assert!(msg.is_unary());
        let ts = msg.ts().to_string();
        let is_last = msg.is_last();

        self.inner
            .table
            .write()
            .expect("manifest table lock poisoned")
            .upsert(&msg)?;

        let mut sink_err = None;
        if let Some(filename) = msg.filename() {
            match self
                .inner
                .sink
                .create(msg.ts(), msg.field(), filename)
                .await
            {
                Ok(_) => {
                    if let Err(e) = self
                        .inner
                        .sink
                        .write(msg.ts(), msg.field(), msg.bytes())
                        .await
                    {
                        tracing::error!(
                            event = "sink.write_failed",
                            ts = %msg.ts(),
                            field = %msg.field(),
                            error = %e,
                            "sink.write_failed"
                        );
                        sink_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        event = "sink.create_failed",
                        ts = %msg.ts(),
                        field = %msg.field(),
                        error = %e,
                        "sink.create_failed"
                    );
                    sink_err.get_or_insert(e);
                }
            }
            if let Err(e) = self.inner.sink.close(msg.ts(), msg.field()).await {
                tracing::error!(
                    event = "sink.close_failed",
                    ts = %msg.ts(),
                    field = %msg.field(),
                    error = %e,
                    "sink.close_failed"
                );
                sink_err.get_or_insert(e);
            }
        }

        if is_last {
            self.schedule_terminal(ts);
        }
        match sink_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Opens a streamed file field: table entry plus sink handle. Carries no
    /// payload bytes.
    pub async fn handle_stream_info(&self, msg: Message) -> Result<()> {
        debug_assert!(msg.is_stream_info());
        self.inner
            .table
            .write()
            .expect("manifest table lock poisoned")
            .upsert(&msg)?;

        let filename = msg.filename().unwrap_or_default();
        if let Err(e) = self
            .inner
            .sink
            .create(msg.ts(), msg.field(), filename)
            .await
        {
            tracing::error!(
                event = "sink.create_failed",
                ts = %msg.ts(),
                field = %msg.field(),
                error = %e,
                "sink.create_failed"
            );
            return Err(e);
        }
        Ok(())
    }

    /// One chunk of a streamed file field. A chunk that is not the next
    /// expected index is parked (reported as `OutOfOrder`, non-fatal) or, if
    /// its index was already written, dropped. An accepted chunk is written
    /// and then drains the buffer of chunks it made releasable.
    pub async fn handle_stream_data(&self, msg: Message) -> Result<()> {
        debug_assert!(msg.is_stream_data());

        {
            let _gate = self.inner.gate.lock().await;
            let table = self
                .inner
                .table
                .read()
                .expect("manifest table lock poisoned");
            if !table.matched(&msg) {
                let already_written = table
                    .expected(msg.ts(), msg.field())
                    .is_some_and(|expected| msg.index() < expected);
                drop(table);

                if already_written {
                    tracing::debug!(
                        event = "submit.duplicate_dropped",
                        ts = %msg.ts(),
                        field = %msg.field(),
                        index = msg.index(),
                        "submit.duplicate_dropped"
                    );
                    return Ok(());
                }

                let (ts, field, index) =
                    (msg.ts().to_string(), msg.field().to_string(), msg.index());
                self.inner
                    .buffer
                    .lock()
                    .expect("reorder buffer lock poisoned")
                    .park(msg);
                tracing::debug!(
                    event = "submit.parked",
                    ts = %ts,
                    field = %field,
                    index,
                    "submit.parked"
                );
                return Err(Error::OutOfOrder { ts, field, index });
            }
            drop(table);
            // Advance `expected` before releasing the gate: from here on this
            // call is the only writer for this chunk index.
            self.inner
                .table
                .write()
                .expect("manifest table lock poisoned")
                .upsert(&msg)?;
        }

        let mut sink_err = self.write_chunk(&msg).await.err();

        if msg.is_last() {
            self.schedule_terminal(msg.ts().to_string());
            return match sink_err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        // Drain rounds: each accepted chunk may make the next parked one
        // releasable, so repeat until a round releases nothing.
        let mut terminal_ts = None;
        'rounds: loop {
            let released = {
                let _gate = self.inner.gate.lock().await;
                let released = {
                    let table = self
                        .inner
                        .table
                        .read()
                        .expect("manifest table lock poisoned");
                    let mut buffer = self
                        .inner
                        .buffer
                        .lock()
                        .expect("reorder buffer lock poisoned");
                    match buffer.drain(msg.ts(), &table) {
                        Ok(released) => released,
                        Err(Error::EmptyBuffer) => break 'rounds,
                        Err(e) => return Err(e),
                    }
                };
                let mut table = self
                    .inner
                    .table
                    .write()
                    .expect("manifest table lock poisoned");
                for chunk in &released {
                    table.upsert(chunk)?;
                }
                released
            };
            if released.is_empty() {
                break;
            }
            for chunk in released {
                if let Err(e) = self.write_chunk(&chunk).await {
                    sink_err.get_or_insert(e);
                }
                if chunk.is_last() {
                    terminal_ts = Some(chunk.ts().to_string());
                }
            }
            if terminal_ts.is_some() {
                break;
            }
        }

        if let Some(ts) = terminal_ts {
            self.schedule_terminal(ts);
        }
        match sink_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Transport hook: releases the sink handle when a stream half-closes.
    pub async fn close_field(&self, ts: &str, field: &str) -> Result<()> {
        if let Err(e) = self.inner.sink.close(ts, field).await {
            tracing::error!(
                event = "sink.close_failed",
                ts = %ts,
                field = %field,
                error = %e,
                "sink.close_failed"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Marks the coordinator as stopping. In-flight submissions still run to
    /// their terminal action; `done` fires once the table is empty.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        tracing::info!(event = "daemon.stopping", "daemon.stopping");
        let _gate = self.inner.gate.lock().await;
        if self
            .inner
            .table
            .read()
            .expect("manifest table lock poisoned")
            .is_empty()
        {
            self.inner.fire_done();
        }
    }

    fn schedule_terminal(&self, ts: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_terminal(&ts).await;
        });
    }

    async fn write_chunk(&self, msg: &Message) -> Result<()> {
        if let Err(e) = self
            .inner
            .sink
            .write(msg.ts(), msg.field(), msg.bytes())
            .await
        {
            tracing::error!(
                event = "sink.write_failed",
                ts = %msg.ts(),
                field = %msg.field(),
                index = msg.index(),
                error = %e,
                "sink.write_failed"
            );
            return Err(e);
        }
        Ok(())
    }

    #[cfg(test)]
    fn table_contains(&self, ts: &str) -> bool {
        self.inner.table.read().unwrap().contains_ts(ts)
    }

    #[cfg(test)]
    fn buffer_contains(&self, ts: &str) -> bool {
        self.inner.buffer.lock().unwrap().contains_ts(ts)
    }
}

impl Shared {
    /// Persists the manifest and forgets the ts. Runs after a short grace so
    /// the transport's trailing stream close can land first. A repeat for an
    /// already-forgotten ts does nothing.
    async fn run_terminal(&self, ts: &str) {
        tokio::time::sleep(self.close_grace).await;
        let _gate = self.gate.lock().await;

        let snapshot = {
            let table = self.table.read().expect("manifest table lock poisoned");
            if !table.contains_ts(ts) {
                tracing::debug!(event = "manifest.already_saved", ts = %ts, "manifest.already_saved");
                return;
            }
            table.snapshot(ts)
        };

        match self.sink.save_manifest(ts, &snapshot).await {
            Ok(()) => {
                tracing::info!(
                    event = "manifest.saved",
                    ts = %ts,
                    fields = snapshot.len(),
                    "manifest.saved"
                );
            }
            Err(e) => {
                tracing::error!(event = "manifest.save_failed", ts = %ts, error = %e, "manifest.save_failed");
            }
        }

        self.table
            .write()
            .expect("manifest table lock poisoned")
            .forget(ts);
        self.buffer
            .lock()
            .expect("reorder buffer lock poisoned")
            .forget(ts);

        if self.stopping.load(Ordering::SeqCst)
            && self
                .table
                .read()
                .expect("manifest table lock poisoned")
                .is_empty()
        {
            self.fire_done();
        }
    }

    // At-most-once: taking the sender out makes a second completion a no-op.
    fn fire_done(&self) {
        if let Some(done) = self
            .done
            .lock()
            .expect("done signal lock poisoned")
            .take()
        {
            let _ = done.send(());
            tracing::info!(event = "daemon.idle", "daemon.idle");
        }
    }
}
