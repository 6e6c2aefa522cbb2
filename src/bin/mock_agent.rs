//! Scriptable protocol-speaking agent used by the integration tests
//!
//! Reads newline-delimited JSON envelopes on stdin, emits heartbeats on
//! stdout, and answers `task` messages according to the selected mode. The
//! `shutdown` command always causes a clean exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout, stdin, stdout};
use tokio::sync::Mutex;

use synapse::protocol::{
    InboundLine, MessageKind, TaskRequest, TaskResult, WireMessage, parse_line,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Answer every task with a successful result echoing the description
    Echo,

    /// Answer every task with a failed result
    Fail,

    /// Never answer tasks
    Silent,

    /// Answer after `--delay-ms`
    Slow,

    /// Emit a malformed line before each valid result
    Garbage,

    /// Exit with `--exit-code` after `--delay-ms`
    Exit,
}

#[derive(Debug, Parser)]
#[command(name = "mock-agent", about = "Scriptable agent child for tests")]
struct Args {
    /// Behaviour on receiving tasks
    #[arg(long, value_enum, default_value = "echo")]
    mode: Mode,

    /// Heartbeat cadence; 0 disables heartbeats
    #[arg(long, default_value_t = 1_000)]
    heartbeat_ms: u64,

    /// Reply delay for `slow` mode, or the time-to-exit for `exit` mode
    #[arg(long, default_value_t = 200)]
    delay_ms: u64,

    /// Exit code for `exit` mode and `--crash-marker` crashes
    #[arg(long, default_value_t = 137)]
    exit_code: i32,

    /// Crash once: exit with `--exit-code` unless this file already exists
    #[arg(long)]
    crash_marker: Option<PathBuf>,
}

async fn write_line(out: &Arc<Mutex<Stdout>>, line: &str) {
    let mut guard = out.lock().await;
    let _ = guard.write_all(line.as_bytes()).await;
    let _ = guard.flush().await;
}

async fn write_message(out: &Arc<Mutex<Stdout>>, message: &WireMessage) {
    if let Ok(line) = message.to_line() {
        write_line(out, &line).await;
    }
}

fn result_for(request: &TaskRequest, mode: Mode) -> TaskResult {
    TaskResult {
        task_id: request.id.clone(),
        success: mode != Mode::Fail,
        result: Some(json!({ "echo": request.description })),
        error: (mode == Mode::Fail).then(|| "synthetic failure".to_string()),
        files: None,
        duration: 5,
        tokens_used: None,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(marker) = &args.crash_marker {
        if !marker.exists() {
            let _ = std::fs::write(marker, b"crashed");
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
            std::process::exit(args.exit_code);
        }
    }

    if args.mode == Mode::Exit {
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        std::process::exit(args.exit_code);
    }

    let out = Arc::new(Mutex::new(stdout()));

    if args.heartbeat_ms > 0 {
        let out = Arc::clone(&out);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(args.heartbeat_ms));
            loop {
                ticker.tick().await;
                write_message(&out, &WireMessage::new(MessageKind::Heartbeat, json!({}))).await;
            }
        });
    }

    let mut lines = BufReader::new(stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = match parse_line(&line) {
            InboundLine::Message(message) => *message,
            InboundLine::Log(_) => continue,
        };

        match message.kind {
            MessageKind::Task => {
                let request: TaskRequest = match serde_json::from_value(message.data.clone()) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                if args.mode == Mode::Silent {
                    continue;
                }

                let out = Arc::clone(&out);
                let mode = args.mode;
                let delay = args.delay_ms;
                tokio::spawn(async move {
                    if mode == Mode::Slow {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    if mode == Mode::Garbage {
                        write_line(&out, "!! this is not json !!\n").await;
                    }
                    let result = result_for(&request, mode);
                    if let Ok(message) = WireMessage::result(&result) {
                        write_message(&out, &message).await;
                    }
                });
            }
            MessageKind::Command => {
                match message.data.get("command").and_then(|v| v.as_str()) {
                    Some("shutdown") => {
                        std::process::exit(0);
                    }
                    Some("status") => {
                        let report = json!({ "cpu": 0.1, "memory": 1024, "disk": 4096 });
                        write_message(&out, &WireMessage::new(MessageKind::Status, report)).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
