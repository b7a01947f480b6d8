//! SSR engine host process
//!
//! Usage:
//!   ssr-engine --compiler <program> [--production] [-- <compiler args>...]
//!
//! Protocol (JSON lines, stdin/stdout):
//!   Command (stdin):
//!     {"id":1,"command":"transpile","payload":{"identifier":"sess1",...}}
//!
//!   Response (stdout):
//!     {"id":1,"ok":true,"result":{...}}
//!     {"id":1,"ok":false,"error":"Cannot find module 'left-pad'"}
//!
//!   RPC call while a command runs (stdout), and its reply (stdin):
//!     {"rpc":7,"request":{"helper":"site.Menu","variables":{}}}
//!     {"rpcReply":7,"response":{"data":[...]}}
//!
//! Commands run one at a time. Logs go to stderr (`RUST_LOG` filters them).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ssr_engine::{
    Command, Error, ProcessEngine, RpcInvoker, RpcRequest, RpcResponse, SandboxConfig, Service,
    ServiceConfig, PREPARATION_TTL,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ssr-engine", about = "SSR build and render service", version)]
struct Args {
    /// Never cache compiler state or render units; minify browser bundles
    #[arg(long)]
    production: bool,

    /// Compiler program speaking the build protocol
    #[arg(long)]
    compiler: PathBuf,

    /// Dependency directory of the service itself
    #[arg(long, default_value = "node_modules")]
    service_modules: PathBuf,

    /// Sandbox heap limit in MiB (0 = unlimited)
    #[arg(long, default_value_t = 64)]
    max_heap_mb: usize,

    /// Arguments passed to the compiler program
    #[arg(last = true)]
    compiler_args: Vec<String>,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            production: self.production,
            service_modules: self.service_modules.clone(),
            preparation_ttl: PREPARATION_TTL,
            sandbox: SandboxConfig {
                max_heap_size: (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    #[serde(rename_all = "camelCase")]
    RpcReply { rpc_reply: u64, response: RpcResponse },
    Command {
        id: u64,
        command: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound<'a> {
    Rpc {
        rpc: u64,
        request: &'a RpcRequest,
    },
    Success {
        id: u64,
        ok: bool,
        result: Value,
    },
    Failure {
        id: u64,
        ok: bool,
        error: String,
    },
}

/// Line-oriented stdout shared by responses and RPC calls.
struct Output {
    stdout: Mutex<Stdout>,
}

impl Output {
    async fn send(&self, message: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

type PendingReplies = Rc<RefCell<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// RPC channel to the host over stdout, answered through stdin.
struct StdioRpc {
    output: Rc<Output>,
    pending: PendingReplies,
    next_id: Cell<u64>,
}

#[async_trait(?Send)]
impl RpcInvoker for StdioRpc {
    async fn call(&self, request: RpcRequest) -> ssr_engine::Result<RpcResponse> {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let (reply, response) = oneshot::channel();
        self.pending.borrow_mut().insert(id, reply);
        if let Err(e) = self
            .output
            .send(&Outbound::Rpc {
                rpc: id,
                request: &request,
            })
            .await
        {
            self.pending.borrow_mut().remove(&id);
            return Err(Error::Rpc(e.to_string()));
        }

        response
            .await
            .map_err(|_| Error::Rpc(format!("host closed before answering {}", request.helper)))
    }
}

/// Reads stdin, answering RPC replies directly and queueing commands.
async fn read_input(pending: PendingReplies, commands: mpsc::UnboundedSender<(u64, String, Value)>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Inbound>(&line) {
            Ok(Inbound::RpcReply {
                rpc_reply,
                response,
            }) => match pending.borrow_mut().remove(&rpc_reply) {
                Some(reply) => {
                    let _ = reply.send(response);
                }
                None => tracing::warn!(rpc = rpc_reply, "Reply to unknown RPC call"),
            },
            Ok(Inbound::Command {
                id,
                command,
                payload,
            }) => {
                if commands.send((id, command, payload)).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed input line"),
        }
    }

    // Fail every call still waiting for the host.
    pending.borrow_mut().clear();
}

async fn serve(args: Args) -> Result<()> {
    let config = args.service_config();
    let engine = Rc::new(ProcessEngine::new(&args.compiler, args.compiler_args.clone()));
    let service = Service::new(config, engine);

    let output = Rc::new(Output {
        stdout: Mutex::new(tokio::io::stdout()),
    });
    let pending: PendingReplies = Rc::default();
    let rpc = Rc::new(StdioRpc {
        output: Rc::clone(&output),
        pending: Rc::clone(&pending),
        next_id: Cell::new(0),
    });

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    tokio::task::spawn_local(read_input(pending, command_tx));

    tracing::info!(
        mode = service.config().mode_name(),
        compiler = %args.compiler.display(),
        "Rendering engine online"
    );

    while let Some((id, name, payload)) = command_rx.recv().await {
        let result = match Command::parse(&name, payload) {
            Ok(command) => service.execute(command, Rc::clone(&rpc) as Rc<dyn RpcInvoker>).await,
            Err(e) => Err(e),
        };

        let message = match result {
            Ok(result) => Outbound::Success {
                id,
                ok: true,
                result,
            },
            Err(e) => {
                tracing::error!(id, command = %name, error = %e, "Command failed");
                Outbound::Failure {
                    id,
                    ok: false,
                    error: e.to_string(),
                }
            }
        };
        output.send(&message).await.context("Failed to write response")?;
    }

    tracing::info!("Rendering engine shutting down");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // JsRuntime is !Send: everything runs on one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, serve(args))
}
