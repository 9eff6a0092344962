use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use form_saver_core::{Coordinator, FsSink, Settings, init_logging};

mod submit_ipc;

#[derive(Parser)]
#[command(name = "formsaverd")]
#[command(about = "Multipart submission ingest daemon", long_about = None)]
struct Args {
    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the submissions are saved under.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Unix socket the submit protocol listens on.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(root) = args.root {
        settings.root_dir = root;
    }
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }
    settings.validate()?;

    let sink = Arc::new(FsSink::new(&settings.root_dir)?);
    let (coordinator, done) = Coordinator::with_close_grace(sink, settings.close_grace());

    let server =
        submit_ipc::spawn_submit_ipc_server(settings.socket_path.clone(), coordinator.clone())?;
    tracing::info!(
        event = "daemon.listening",
        socket = %settings.socket_path.display(),
        root = %settings.root_dir.display(),
        "daemon.listening"
    );

    tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.stop().await;
            }
        }
    });

    let _ = done.await;
    server.shutdown().await;
    tracing::info!(event = "daemon.stopped", "daemon.stopped");
    Ok(())
}
