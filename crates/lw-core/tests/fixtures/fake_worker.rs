//! Scripted worker for integration testing.
//!
//! Speaks the loopwatch line protocol on stdout and reads control messages
//! from stdin. The first argument selects the mode; `--watch` and a trailing
//! integer (as appended by the supervisor) are accepted in `loop` mode.
//!
//! # Modes
//!
//! - `loop`: prints `started`, a raw text line, then one `tick` event every
//!   50 ms. Stops after N ticks when a trailing integer is given. Handles
//!   `{"type":"stop_after_current"}` (finish the current tick, then exit 0),
//!   `{"type":"cancel_stop_after_current"}`, and echoes any other stdin line
//!   back as a `received` event.
//! - `stubborn`: ignores SIGTERM, prints `ready`, then sleeps forever.
//! - `exit <code>`: prints one event and exits with `<code>`.
//! - chat: selected when `--output-format` is present, as in a chat
//!   invocation: streams the trailing prompt back as two deltas, then a
//!   `result` event. Prompts ending in `FAIL` exit 1 without output.

use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn emit(value: &Value) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}

fn event(kind: &str, extra: Value) -> Value {
    let mut obj = json!({ "type": kind, "timestamp": now_ms() });
    if let (Some(map), Value::Object(extra)) = (obj.as_object_mut(), extra) {
        map.extend(extra);
    }
    obj
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--output-format") {
        run_chat(&args);
        return;
    }
    match args.first().map(String::as_str) {
        Some("loop") => run_loop(&args[1..]),
        Some("stubborn") => run_stubborn(),
        Some("exit") => {
            let code = args.get(1).and_then(|c| c.parse().ok()).unwrap_or(0);
            emit(&event("exiting", json!({ "code": code })));
            std::process::exit(code);
        }
        other => {
            eprintln!("fake-worker: unknown mode {other:?}");
            std::process::exit(2);
        }
    }
}

fn run_loop(rest: &[String]) {
    let watch = rest.iter().any(|a| a == "--watch");
    let limit: Option<u64> = rest.last().and_then(|a| a.parse().ok());

    let stop_requested = Arc::new(AtomicBool::new(false));
    let (line_tx, line_rx) = mpsc::channel::<String>();
    {
        let stop_requested = Arc::clone(&stop_requested);
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                    .as_deref()
                {
                    Some("stop_after_current") => stop_requested.store(true, Ordering::SeqCst),
                    Some("cancel_stop_after_current") => {
                        stop_requested.store(false, Ordering::SeqCst)
                    }
                    _ => {}
                }
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    emit(&event("started", json!({ "watch": watch, "limit": limit })));
    println!("fake worker warming up");
    let _ = std::io::stdout().flush();

    let mut n = 0u64;
    loop {
        while let Ok(line) = line_rx.try_recv() {
            emit(&event("received", json!({ "line": line })));
        }
        if stop_requested.load(Ordering::SeqCst) {
            emit(&event("stopped_after_current", json!({ "ticks": n })));
            std::process::exit(0);
        }
        if limit.is_some_and(|l| n >= l) {
            emit(&event("done", json!({ "ticks": n })));
            std::process::exit(0);
        }
        n += 1;
        emit(&event("tick", json!({ "n": n })));
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn run_stubborn() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
    emit(&event("ready", json!({})));
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn run_chat(rest: &[String]) {
    let prompt = rest.last().cloned().unwrap_or_default();
    if prompt.trim_end().ends_with("FAIL") {
        eprintln!("simulated failure");
        std::process::exit(1);
    }

    emit(&json!({ "type": "system", "subtype": "init" }));
    let reply = format!("echo: {prompt}");
    let (head, tail) = reply.split_at(reply.len().min(6));
    for part in [head, tail] {
        emit(&json!({
            "type": "stream_event",
            "event": { "type": "content_block_delta", "delta": { "type": "text_delta", "text": part } }
        }));
    }
    emit(&json!({ "type": "result", "subtype": "success", "result": reply }));
}
