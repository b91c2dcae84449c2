//! Jitsu worker driver - runs one supervised worker and feeds it payloads.
//!
//! Every stdin line is sent as one exchange; every result is printed as one
//! JSON line on stdout:
//! - `{"ok":true,"body":"..."}`
//! - `{"ok":false,"error":{"code":"...","message":"..."}}`

use clap::Parser;
use jitsu_ipc::ipc::{DispatchTable, PipeTransport};
use jitsu_ipc::types::ProcessDescriptor;
use jitsu_ipc::{CallContext, Config, Governor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "jitsu-worker", about = "Drive a line-framed worker process")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "JITSU_CONFIG")]
    config: Option<PathBuf>,

    /// Fail on worker death instead of respawning.
    #[arg(long)]
    standalone: bool,

    /// Per-exchange deadline in milliseconds.
    #[arg(long, env = "JITSU_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Worker command and arguments; overrides the configured worker.
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some((command, rest)) = args.command.split_first() {
        config.governor.worker = ProcessDescriptor::new(command).args(rest.iter().cloned());
    }
    if args.standalone {
        config.governor.standalone = true;
    }
    config.validate()?;

    // Initialize observability
    jitsu_ipc::observability::init_tracing_with(&config.observability);

    let transport = PipeTransport::new(config.governor.worker.clone(), Arc::new(DispatchTable::new()))
        .with_config(config.governor.transport.clone());
    let governor = Arc::new(Governor::from_config(&transport, &config.governor).await?);

    let shutdown = CancellationToken::new();
    let signal_task = {
        let governor = governor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, closing worker");
                shutdown.cancel();
                governor.close().await;
            }
        })
    };

    let mut stdout = tokio::io::stdout();
    let timeout = args.timeout_ms.map(Duration::from_millis);
    serve(
        &governor,
        BufReader::new(tokio::io::stdin()),
        &mut stdout,
        &shutdown,
        timeout,
    )
    .await?;

    governor.close().await;
    signal_task.abort();
    if shutdown.is_cancelled() {
        // The blocking stdin reader would keep the runtime alive on return.
        stdout.flush().await?;
        std::process::exit(130);
    }
    Ok(())
}

/// Feed every input line to the governor until EOF, governor close or
/// `shutdown`, writing one JSON reply line per exchange.
async fn serve<R, W>(
    governor: &Governor,
    input: R,
    output: &mut W,
    shutdown: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let ctx = CallContext::from_token(shutdown.child_token());
        let ctx = match timeout {
            Some(timeout) => ctx.deadline_at(tokio::time::Instant::now() + timeout),
            None => ctx,
        };
        let reply = match governor.exchange(&ctx, line.as_bytes(), None).await {
            Ok(body) => serde_json::json!({
                "ok": true,
                "body": String::from_utf8_lossy(&body),
            }),
            Err(e) => serde_json::json!({
                "ok": false,
                "error": {
                    "code": e.to_ipc_error_code(),
                    "message": e.to_string(),
                }
            }),
        };
        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;

        if governor.is_closed() {
            break;
        }
    }
    Ok(())
}
