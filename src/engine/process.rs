//! Out-of-process compiler adapter.
//!
//! Protocol (JSON lines):
//!   Engine -> compiler:
//!     {"type":"build","id":1,"config":{...}}
//!     {"type":"resolved","id":1,"seq":4,"writes":[...],"redirect":{"module":"/x"}}
//!   Compiler -> engine:
//!     {"type":"resolve","id":1,"seq":4,"request":{"specifier":"a","path":"/src"}}
//!     {"type":"result","id":1,"output":{...}}
//!     {"type":"failed","id":1,"message":"..."}
//!
//! One compiler process serves every build; builds are multiplexed by id.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, OnceCell};

use super::{BuildConfig, BuildEngine, BuildHooks, CompilerOutput, ModuleRequest, Redirect, VirtualWrite};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outbound<'a> {
    Build {
        id: u64,
        config: &'a BuildConfig,
    },
    Resolved {
        id: u64,
        seq: u64,
        writes: Vec<VirtualWrite>,
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect: Option<Redirect>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    Resolve {
        id: u64,
        seq: u64,
        request: ModuleRequest,
    },
    Result {
        id: u64,
        output: CompilerOutput,
    },
    Failed {
        id: u64,
        message: String,
    },
}

impl Inbound {
    fn build_id(&self) -> u64 {
        match self {
            Inbound::Resolve { id, .. } | Inbound::Result { id, .. } | Inbound::Failed { id, .. } => *id,
        }
    }
}

type Routes = Rc<RefCell<HashMap<u64, mpsc::UnboundedSender<Inbound>>>>;

struct Connection {
    stdin: Mutex<ChildStdin>,
    routes: Routes,
    // Keeps the process alive for as long as the engine lives.
    _child: Child,
}

impl Connection {
    async fn send(&self, message: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::Engine(format!("Failed to write to compiler: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Engine(format!("Failed to flush compiler input: {}", e)))
    }
}

/// Drives an external compiler process. Must be used inside a
/// `tokio::task::LocalSet`, the reader task is spawned locally.
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    connection: OnceCell<Connection>,
    next_id: Cell<u64>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            connection: OnceCell::new(),
            next_id: Cell::new(0),
        }
    }

    async fn connection(&self) -> Result<&Connection> {
        self.connection.get_or_try_init(|| self.spawn()).await
    }

    async fn spawn(&self) -> Result<Connection> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Engine(format!(
                    "Failed to start compiler '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Engine("Compiler stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("Compiler stdout unavailable".into()))?;

        let routes: Routes = Rc::default();
        let reader_routes = Rc::clone(&routes);
        tokio::task::spawn_local(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<Inbound>(&line) {
                        Ok(message) => {
                            let id = message.build_id();
                            if let Some(route) = reader_routes.borrow().get(&id) {
                                let _ = route.send(message);
                            } else {
                                tracing::warn!(build = id, "Compiler message for unknown build");
                            }
                        }
                        Err(e) => tracing::warn!("Unparseable compiler message: {}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Compiler output failed: {}", e);
                        break;
                    }
                }
            }
            // Dropping the senders fails every build still waiting.
            reader_routes.borrow_mut().clear();
            tracing::warn!("Compiler process closed its output");
        });

        Ok(Connection {
            stdin: Mutex::new(stdin),
            routes,
            _child: child,
        })
    }
}

struct RouteGuard<'a> {
    routes: &'a Routes,
    id: u64,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.routes.borrow_mut().remove(&self.id);
    }
}

#[async_trait(?Send)]
impl BuildEngine for ProcessEngine {
    async fn run(&self, config: BuildConfig, hooks: &mut dyn BuildHooks) -> Result<CompilerOutput> {
        let connection = self.connection().await?;
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let (sender, mut receiver) = mpsc::unbounded_channel();
        connection.routes.borrow_mut().insert(id, sender);
        let _route = RouteGuard {
            routes: &connection.routes,
            id,
        };

        connection.send(&Outbound::Build { id, config: &config }).await?;

        let mut failure = None;
        while let Some(message) = receiver.recv().await {
            match message {
                Inbound::Resolve { seq, request, .. } => {
                    let mut writes = Vec::new();
                    let reply = match hooks.resolve(&request, &mut writes).await {
                        Ok(redirect) => Outbound::Resolved {
                            id,
                            seq,
                            writes,
                            redirect,
                            error: None,
                        },
                        Err(e) => {
                            let reply = Outbound::Resolved {
                                id,
                                seq,
                                writes: Vec::new(),
                                redirect: None,
                                error: Some(e.to_string()),
                            };
                            if failure.is_none() {
                                failure = Some(e);
                            }
                            reply
                        }
                    };
                    connection.send(&reply).await?;
                }
                Inbound::Result { output, .. } => {
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    hooks.done().await?;
                    return Ok(output);
                }
                Inbound::Failed { message, .. } => {
                    return Err(failure.unwrap_or(Error::Engine(message)));
                }
            }
        }

        Err(Error::Engine(format!("Compiler exited during build {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_compiler_messages() {
        let resolve: Inbound = serde_json::from_value(json!({
            "type": "resolve",
            "id": 3,
            "seq": 9,
            "request": {"specifier": "site", "path": "/app/src"}
        }))
        .unwrap();
        assert_eq!(resolve.build_id(), 3);
        assert!(matches!(
            resolve,
            Inbound::Resolve { seq: 9, ref request, .. } if request.specifier == "site"
        ));

        let result: Inbound = serde_json::from_value(json!({
            "type": "result",
            "id": 3,
            "output": {"chunks": [], "assets": {}, "errors": ["boom"]}
        }))
        .unwrap();
        assert!(matches!(result, Inbound::Result { ref output, .. } if output.errors == ["boom"]));
    }

    #[test]
    fn test_encodes_resolution_reply() {
        let reply = Outbound::Resolved {
            id: 1,
            seq: 2,
            writes: vec![VirtualWrite {
                filename: "/fixture.js".into(),
                content: "export default 1;".into(),
            }],
            redirect: Some(Redirect::External("react".into())),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "type": "resolved",
                "id": 1,
                "seq": 2,
                "writes": [{"filename": "/fixture.js", "content": "export default 1;"}],
                "redirect": {"external": "react"}
            })
        );
    }

    #[tokio::test]
    async fn test_missing_compiler_is_an_engine_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = ProcessEngine::new("/nonexistent/ssr-compiler", vec![]);
                let err = engine.connection().await.err().unwrap();
                assert!(matches!(err, Error::Engine(_)));
            })
            .await;
    }
}
