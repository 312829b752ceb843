//! Capability pump – the hub side of one worker's stdio.
//!
//! A worker writes one JSON object per line on stdout:
//!
//! | `type` | Fields | Effect |
//! |---|---|---|
//! | `command` | `verb`, `value` | [`Envelope`] on the command bus |
//! | `lifecycle` | `state` | lifecycle table update |
//! | `install_failed` | `detail` | remembered for crash classification |
//! | `read` | `label` | `{"label":..,"value":..}` written back on stdin |
//!
//! Lines that are not JSON objects are incidental output (a stray `print`)
//! and are forwarded as [`Verb::SendMessage`].  A verb outside the closed
//! set travels as [`Envelope::UnknownVerb`] so the dispatcher can stop the
//! session; a known verb with a malformed value is logged and dropped.

use robohub_middleware::{CommandSender, Envelope, ValueStore};
use robohub_types::{Command, Identifier, ModuleLifecycleState, SensorLabel, Verb};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::lifecycle::LifecycleTable;

/// Hub → worker request for cooperative shutdown.
pub const CANCEL_LINE: &str = r#"{"type":"cancel"}"#;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Command {
        verb: String,
        #[serde(default)]
        value: Value,
    },
    Lifecycle {
        state: ModuleLifecycleState,
    },
    InstallFailed {
        detail: String,
    },
    Read {
        label: String,
    },
}

/// Everything a pump needs to act on behalf of one plugin.
#[derive(Clone, Debug)]
pub struct PumpContext {
    pub origin: Identifier,
    pub store: ValueStore,
    pub bus: CommandSender,
    pub lifecycle: LifecycleTable,
}

/// What the pump learned by the time the worker closed stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpSummary {
    pub install_failure: Option<String>,
    pub lines: usize,
}

/// Read `stdout` until EOF, acting on every line.
///
/// Replies to `read` requests are queued on `replies`; a closed reply
/// channel only means the worker's stdin is gone and is not an error.
pub async fn run_pump<R>(
    stdout: R,
    ctx: PumpContext,
    replies: mpsc::UnboundedSender<String>,
) -> PumpSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = PumpSummary::default();
    let mut reader = BufReader::new(stdout);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(module = %ctx.origin.module_id, error = %e, "worker stdout read failed");
                break;
            }
        }
        // Non-UTF-8 output is still incidental text.
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);
        summary.lines += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerMessage>(line) {
            Ok(msg) => handle_message(msg, &ctx, &replies, &mut summary),
            Err(_) if looks_like_protocol(line) => {
                warn!(module = %ctx.origin.module_id, line, "malformed worker message; dropping");
            }
            Err(_) => ctx.bus.put(Command::new(
                ctx.origin.clone(),
                Verb::SendMessage(line.trim_end().to_string()),
            )),
        }
    }
    summary
}

fn looks_like_protocol(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .map(|v| v.get("type").is_some())
        .unwrap_or(false)
}

fn handle_message(
    msg: WorkerMessage,
    ctx: &PumpContext,
    replies: &mpsc::UnboundedSender<String>,
    summary: &mut PumpSummary,
) {
    let module = &ctx.origin.module_id;
    match msg {
        WorkerMessage::Command { verb, value } => {
            if let Some(envelope) = parse_command(&ctx.origin, &verb, value) {
                ctx.bus.put(envelope);
            }
        }
        WorkerMessage::Lifecycle { state } => {
            if let Err(e) = ctx.lifecycle.advance(module, state) {
                warn!(module = %module, error = %e, "ignoring lifecycle update");
            }
        }
        WorkerMessage::InstallFailed { detail } => {
            warn!(module = %module, detail, "dependency installation failed");
            summary.install_failure = Some(detail);
        }
        WorkerMessage::Read { label } => {
            let value = label_from_wire(&label)
                .map(|l| ctx.store.get(l))
                .unwrap_or_default();
            let reply = json!({ "label": label, "value": value }).to_string();
            if replies.send(reply).is_err() {
                debug!(module = %module, "worker stdin closed; dropping read reply");
            }
        }
    }
}

/// Turn a wire `command` into a bus item.  `None` means the value did not
/// match the verb's shape.
pub fn parse_command(origin: &Identifier, verb: &str, value: Value) -> Option<Envelope> {
    if !Verb::is_known(verb) {
        return Some(Envelope::UnknownVerb {
            origin: origin.clone(),
            verb: verb.to_string(),
        });
    }
    match serde_json::from_value::<Verb>(json!({ "verb": verb, "value": value })) {
        Ok(verb) => Some(Envelope::Command(Command::new(origin.clone(), verb))),
        Err(e) => {
            warn!(
                module = %origin.module_id,
                verb,
                error = %e,
                "malformed command value; dropping"
            );
            None
        }
    }
}

fn label_from_wire(label: &str) -> Option<SensorLabel> {
    serde_json::from_value(Value::String(label.to_string())).ok()
}

/// Forward queued lines to a worker's stdin until the queue closes or the
/// pipe breaks.
pub async fn run_stdin_writer<W>(mut stdin: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            debug!("worker stdin closed");
            break;
        }
    }
}
