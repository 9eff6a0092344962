use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use form_saver_core::{Coordinator, Error, SubmitFrame, SubmitResponse};

// A data frame carries one chunk; base64 of the largest sane chunk fits well
// below this.
const MAX_FRAME_LINE_BYTES: usize = 4 * 1024 * 1024;

pub struct SubmitIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SubmitIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for SubmitIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn_submit_ipc_server(
    socket_path: PathBuf,
    coordinator: Coordinator,
) -> std::io::Result<SubmitIpcServerHandle> {
    if let Some(parent) = socket_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    let handle_socket_path = socket_path.clone();

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "submit.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "submit.ipc_accept_failed"
                            );
                            continue;
                        }
                    };

                    let coordinator = coordinator.clone();
                    let conn_id = Uuid::new_v4().to_string();
                    let mut shutdown = shutdown_broadcast.subscribe();
                    tokio::spawn(async move {
                        let _ = handle_submit_client(stream, coordinator, conn_id, &mut shutdown).await;
                    });
                }
            }
        }
    });

    Ok(SubmitIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

/// One connection is one ingress call: a single `submit.unary`, or a
/// `submit.open` followed by `submit.data` frames until the client
/// half-closes. The response is written once the call is fully processed.
async fn handle_submit_client(
    stream: UnixStream,
    coordinator: Coordinator,
    conn_id: String,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    let mut w = BufWriter::new(w);

    let first_line = tokio::select! {
        line = lines.next_line() => line?,
        _ = shutdown.recv() => return Ok(()),
    };
    let Some(first_line) = first_line else {
        return Ok(());
    };
    if first_line.len() > MAX_FRAME_LINE_BYTES {
        write_json_line(&mut w, &SubmitResponse::err("frame.invalid", "frame too large")).await?;
        return Ok(());
    }

    let frame = match SubmitFrame::parse(&first_line) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                event = "submit.invalid_frame",
                conn_id = %conn_id,
                error = %e,
                "submit.invalid_frame"
            );
            write_json_line(&mut w, &SubmitResponse::err(e.code(), e.to_string())).await?;
            return Ok(());
        }
    };

    match frame {
        SubmitFrame::Unary { .. } => {
            let msg = frame.into_message();
            let (ts, field) = (msg.ts().to_string(), msg.field().to_string());
            let received = msg.bytes().len() as u64;
            tracing::debug!(
                event = "submit.unary",
                conn_id = %conn_id,
                ts = %ts,
                field = %field,
                "submit.unary"
            );
            let response = match coordinator.handle_unary(msg).await {
                Ok(()) => SubmitResponse::ok(received, 0),
                Err(e) => SubmitResponse::err(e.code(), e.to_string()),
            };
            write_json_line(&mut w, &response).await
        }
        SubmitFrame::Open { .. } => {
            let msg = frame.into_message();
            let (ts, field) = (msg.ts().to_string(), msg.field().to_string());
            tracing::debug!(
                event = "submit.open",
                conn_id = %conn_id,
                ts = %ts,
                field = %field,
                "submit.open"
            );
            if let Err(e) = coordinator.handle_stream_info(msg).await {
                write_json_line(&mut w, &SubmitResponse::err(e.code(), e.to_string())).await?;
                return Ok(());
            }

            let mut received: u64 = 0;
            let mut parked: u32 = 0;
            let mut failure: Option<Error> = None;

            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line?,
                    _ = shutdown.recv() => return Ok(()),
                };
                let Some(line) = line else {
                    break; // client half-closed
                };
                if line.len() > MAX_FRAME_LINE_BYTES {
                    failure.get_or_insert(Error::InvalidFrame {
                        message: "frame too large".to_string(),
                    });
                    break;
                }
                match SubmitFrame::parse(&line) {
                    Ok(data @ SubmitFrame::Data { .. }) => {
                        let msg = data.into_message();
                        let n = msg.bytes().len() as u64;
                        match coordinator.handle_stream_data(msg).await {
                            Ok(()) => received += n,
                            Err(e) if e.is_informational() => {
                                parked += 1;
                                received += n;
                            }
                            Err(e) => {
                                failure.get_or_insert(e);
                            }
                        }
                    }
                    Ok(_) => {
                        failure.get_or_insert(Error::InvalidFrame {
                            message: "expected submit.data after submit.open".to_string(),
                        });
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            event = "submit.invalid_frame",
                            conn_id = %conn_id,
                            ts = %ts,
                            field = %field,
                            error = %e,
                            "submit.invalid_frame"
                        );
                        failure.get_or_insert(e);
                        break;
                    }
                }
            }

            // The stream is over either way; release the sink handle before
            // acknowledging so the terminal action sees it closed.
            if let Err(e) = coordinator.close_field(&ts, &field).await {
                failure.get_or_insert(e);
            }

            tracing::debug!(
                event = "submit.stream_done",
                conn_id = %conn_id,
                ts = %ts,
                field = %field,
                received,
                parked,
                "submit.stream_done"
            );
            let response = match failure {
                None => SubmitResponse::ok(received, parked),
                Some(e) => SubmitResponse::err(e.code(), e.to_string()),
            };
            write_json_line(&mut w, &response).await
        }
        SubmitFrame::Data { .. } => {
            write_json_line(
                &mut w,
                &SubmitResponse::err("frame.invalid", "submit.data before submit.open"),
            )
            .await
        }
    }
}

async fn write_json_line<W: AsyncWrite + Unpin>(
    w: &mut W,
    value: &impl serde::Serialize,
) -> std::io::Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}
