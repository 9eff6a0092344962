use std::path::PathBuf;

use clap::{Parser, Subcommand};
use form_saver_core::{SubmitFrame, SubmitResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "formsaver")]
#[command(about = "Submit multipart form fields to a formsaver daemon", long_about = None)]
struct Cli {
    /// Unix socket the daemon listens on.
    #[arg(long, default_value = "formsaver.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deliver one submission: every field on its own connection, the last
    /// message of the last field marked last.
    Submit {
        /// Submission token; generated from the current time when omitted.
        #[arg(long)]
        ts: Option<String>,

        /// Text field, FIELD=VALUE. Repeatable.
        #[arg(long = "text", value_name = "FIELD=VALUE")]
        text: Vec<String>,

        /// File field, FIELD=PATH. Repeatable.
        #[arg(long = "file", value_name = "FIELD=PATH")]
        file: Vec<String>,

        /// Files larger than this stream in chunks of this size.
        #[arg(long, default_value_t = 64 * 1024)]
        chunk_bytes: usize,
    },
}

enum FieldPayload {
    Text(Vec<u8>),
    File { filename: String, bytes: Vec<u8> },
}

struct Field {
    name: String,
    payload: FieldPayload,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Submit {
            ts,
            text,
            file,
            chunk_bytes,
        } => {
            if chunk_bytes == 0 {
                return Err("--chunk-bytes must be positive".into());
            }
            let ts = ts.unwrap_or_else(generate_ts);

            let mut fields = Vec::new();
            for pair in &text {
                let (name, value) = split_pair(pair, "--text")?;
                fields.push(Field {
                    name,
                    payload: FieldPayload::Text(value.into_bytes()),
                });
            }
            for pair in &file {
                let (name, path) = split_pair(pair, "--file")?;
                let path = PathBuf::from(path);
                let filename = path
                    .file_name()
                    .ok_or_else(|| format!("--file path has no file name: {}", path.display()))?
                    .to_string_lossy()
                    .into_owned();
                let bytes = tokio::fs::read(&path).await?;
                fields.push(Field {
                    name,
                    payload: FieldPayload::File { filename, bytes },
                });
            }
            if fields.is_empty() {
                return Err("nothing to submit: pass --text and/or --file".into());
            }

            let connections = plan_frames(&ts, &fields, chunk_bytes);
            for (field, frames) in fields.iter().zip(connections) {
                let response = deliver(&cli.socket, &frames).await?;
                print_summary(&field.name, &response);
            }
            println!("submitted ts {ts}");
            Ok(())
        }
    }
}

/// Frames for each field, one connection per field. Text fields and files
/// that fit a single chunk go unary; larger files stream.
fn plan_frames(ts: &str, fields: &[Field], chunk_bytes: usize) -> Vec<Vec<SubmitFrame>> {
    let mut connections = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == fields.len() - 1;

        let frames = match &field.payload {
            FieldPayload::Text(bytes) => vec![SubmitFrame::Unary {
                ts: ts.to_string(),
                field: field.name.clone(),
                filename: None,
                bytes: bytes.clone(),
                is_first,
                is_last,
            }],
            FieldPayload::File { filename, bytes } if bytes.len() <= chunk_bytes => {
                vec![SubmitFrame::Unary {
                    ts: ts.to_string(),
                    field: field.name.clone(),
                    filename: Some(filename.clone()),
                    bytes: bytes.clone(),
                    is_first,
                    is_last,
                }]
            }
            FieldPayload::File { filename, bytes } => {
                let mut frames = vec![SubmitFrame::Open {
                    ts: ts.to_string(),
                    field: field.name.clone(),
                    filename: filename.clone(),
                    is_first,
                }];
                let chunks = bytes.chunks(chunk_bytes);
                let last_index = chunks.len() - 1;
                for (index, chunk) in chunks.enumerate() {
                    frames.push(SubmitFrame::Data {
                        ts: ts.to_string(),
                        field: field.name.clone(),
                        index: index as u32,
                        bytes: chunk.to_vec(),
                        is_last: is_last && index == last_index,
                    });
                }
                frames
            }
        };
        connections.push(frames);
    }
    connections
}

async fn deliver(
    socket: &PathBuf,
    frames: &[SubmitFrame],
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let stream = UnixStream::connect(socket).await?;
    let (r, mut w) = stream.into_split();

    for frame in frames {
        let line = frame.to_line()?;
        w.write_all(line.as_bytes()).await?;
        w.write_all(b"\n").await?;
    }
    w.shutdown().await?;

    let mut lines = BufReader::new(r).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or("daemon closed the connection without a response")?;
    Ok(serde_json::from_str(&line)?)
}

fn print_summary(field: &str, response: &SubmitResponse) {
    if response.ok {
        let received = response.bytes_received.unwrap_or(0);
        match response.parked {
            Some(parked) => println!("field {field}: ok ({received} bytes, {parked} parked)"),
            None => println!("field {field}: ok ({received} bytes)"),
        }
    } else {
        let (code, message) = response
            .error
            .as_ref()
            .map(|e| (e.code.as_str(), e.message.as_str()))
            .unwrap_or(("unknown", ""));
        println!("field {field}: failed ({code}: {message})");
    }
}

fn generate_ts() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

fn split_pair(pair: &str, flag: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    match pair.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("{flag} expects FIELD=VALUE, got {pair:?}").into()),
    }
}
