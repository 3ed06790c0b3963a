//! Shared fixtures for drover tests.
//!
//! - [`write_target_script`]: a shell-script target speaking the JSON-lines
//!   protocol on stdin/stdout.
//! - [`HttpTarget`]: an in-process axum server speaking the same protocol
//!   over HTTP on an ephemeral port.
//! - [`CapturedLogs`]: a tracing subscriber that writes into memory.
//!
//! Both targets share one vocabulary so tests read the same either way:
//!
//! | action      | reply                                      |
//! |-------------|--------------------------------------------|
//! | `get_state` | `{"status":"ok","count":N}` (no change)    |
//! | `garbage`   | `this is not json`                         |
//! | `reject`    | `{"error":"rejected by target"}`           |
//! | `crash`     | pipe: exits 3 after writing to stderr      |
//! | `hang`      | pipe: never answers                        |
//! | `slow`      | http: answers after 5 s                    |
//! | `fail`      | http: 500 with a text body                 |
//! | anything else | `{"ok":true,"count":N+1}`                |

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

// ---------------------------------------------------------------------------
// Pipe targets
// ---------------------------------------------------------------------------

/// Canned pipe-target behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScript {
    /// Deterministic counter speaking the shared vocabulary.
    Counter,
    /// Reads commands and never answers.
    Silent,
    /// Answers `{}` to everything, ignores SIGTERM, lingers after stdin closes.
    IgnoresTerm,
    /// Exits immediately without reading anything.
    ExitsImmediately,
}

impl TargetScript {
    fn file_name(self) -> &'static str {
        match self {
            Self::Counter => "counter_target.sh",
            Self::Silent => "silent_target.sh",
            Self::IgnoresTerm => "stubborn_target.sh",
            Self::ExitsImmediately => "short_lived_target.sh",
        }
    }

    fn body(self) -> &'static str {
        match self {
            Self::Counter => COUNTER_SCRIPT,
            Self::Silent => "#!/bin/sh\nwhile IFS= read -r line; do :; done\n",
            Self::IgnoresTerm => {
                "#!/bin/sh\ntrap '' TERM\nwhile IFS= read -r line; do echo '{}'; done\nsleep 30\n"
            }
            Self::ExitsImmediately => "#!/bin/sh\necho 'target refused to start' >&2\nexit 2\n",
        }
    }
}

const COUNTER_SCRIPT: &str = r#"#!/bin/sh
count=0
while IFS= read -r line; do
  case "$line" in
    *'"action":"get_state"'*) echo "{\"status\":\"ok\",\"count\":$count}" ;;
    *'"action":"crash"'*) echo "fatal: crash requested" >&2; exit 3 ;;
    *'"action":"garbage"'*) echo "this is not json" ;;
    *'"action":"hang"'*) sleep 30 ;;
    *'"action":"reject"'*) echo '{"error":"rejected by target"}' ;;
    *) count=$((count + 1)); echo "{\"ok\":true,\"count\":$count}" ;;
  esac
done
"#;

/// Write `script` into `dir` as an executable file and return its path.
pub fn write_target_script(dir: &Path, script: TargetScript) -> PathBuf {
    write_script(dir, script.file_name(), script.body())
}

/// Write an arbitrary executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write target script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to mark target script executable");
    }

    path
}

// ---------------------------------------------------------------------------
// HTTP target
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TargetState {
    count: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<Value>>>,
}

/// An axum server on `127.0.0.1:<ephemeral>` answering `POST /api`.
///
/// The server task is aborted when the value is dropped.
pub struct HttpTarget {
    addr: SocketAddr,
    state: TargetState,
    server: JoinHandle<()>,
}

impl HttpTarget {
    pub async fn spawn() -> Self {
        let state = TargetState::default();
        let app = Router::new()
            .route("/api", post(handle_command))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind HTTP target");
        let addr = listener.local_addr().expect("listener has no address");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("HTTP target crashed");
        });

        Self {
            addr,
            state,
            server,
        }
    }

    /// URL to configure the agent with.
    pub fn endpoint(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Every command body received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().expect("received lock poisoned").clone()
    }
}

impl Drop for HttpTarget {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle_command(State(state): State<TargetState>, body: String) -> Response {
    let command: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, "command is not JSON").into_response(),
    };
    state
        .received
        .lock()
        .expect("received lock poisoned")
        .push(command.clone());

    let action = command.get("action").and_then(Value::as_str).unwrap_or_default();
    match action {
        "get_state" => {
            let count = state.count.load(Ordering::SeqCst);
            axum::Json(json!({"status": "ok", "count": count})).into_response()
        }
        "garbage" => "this is not json".into_response(),
        "reject" => axum::Json(json!({"error": "rejected by target"})).into_response(),
        "fail" => (StatusCode::INTERNAL_SERVER_ERROR, "target exploded").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            axum::Json(json!({"late": true})).into_response()
        }
        _ => {
            let count = state.count.fetch_add(1, Ordering::SeqCst) + 1;
            axum::Json(json!({"ok": true, "count": count})).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// In-memory sink for formatted tracing output.
///
/// ```ignore
/// let logs = CapturedLogs::default();
/// let _guard = tracing::subscriber::set_default(logs.subscriber());
/// // ... run code ...
/// assert!(logs.contents().contains("ERROR"));
/// ```
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// A debug-level subscriber writing plain text into this sink.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().expect("log buffer poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

pub struct CapturedWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}
