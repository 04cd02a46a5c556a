//! Fake plugin fixtures.
//!
//! Integration tests exercise the real process path by generating small
//! python3 executables that speak the pipeflow plugin protocol: print the
//! handshake line, serve `describe` / `execute_step` / `shutdown` over a
//! TCP socket with length-prefixed JSON frames, and misbehave on demand
//! (slow handshake, bad handshake, noisy stderr, dying or hanging steps).
//! They can also record what they observed (launch count, environment).

use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const PLUGIN_TEMPLATE: &str = r#"#!/usr/bin/env python3
import json, os, socket, struct, sys, time

CFG = json.loads(r'''@CONFIG@''')

marker = CFG.get("launch_marker")
if marker:
    with open(marker, "a") as fh:
        fh.write("launch\n")

env_dump = CFG.get("env_dump")
if env_dump:
    with open(env_dump, "w") as fh:
        fh.write("\n".join(sorted(os.environ.keys())))

if CFG.get("stderr_flood"):
    for _ in range(CFG["stderr_flood"]):
        sys.stderr.write("x" * 1024 + "\n")
    sys.stderr.flush()

if CFG.get("sleep_before_handshake"):
    time.sleep(CFG["sleep_before_handshake"])

if CFG.get("bad_handshake") is not None:
    print(CFG["bad_handshake"], flush=True)
    time.sleep(30)
    sys.exit(1)

srv = socket.socket(socket.AF_INET, socket.SOCK_STREAM)
srv.bind(("127.0.0.1", 0))
srv.listen(1)
print("2|1|tcp|127.0.0.1:%d" % srv.getsockname()[1], flush=True)
conn, _ = srv.accept()

def recv_exact(n):
    buf = b""
    while len(buf) < n:
        chunk = conn.recv(n - len(buf))
        if not chunk:
            sys.exit(0)
        buf += chunk
    return buf

def read_frame():
    (length,) = struct.unpack(">I", recv_exact(4))
    return json.loads(recv_exact(length).decode())

def send_frame(frame):
    data = json.dumps(frame).encode()
    conn.sendall(struct.pack(">I", len(data)) + data)

def send_result(call_id, body=None, error=None):
    send_frame({"type": "methodResult", "payload": {"id": call_id, "body": body, "error": error}})

steps = CFG.get("steps", [])

while True:
    frame = read_frame()
    payload = frame["payload"]
    call_id = payload["id"]
    method = payload.get("method")
    if method == "describe":
        send_result(call_id, [{"name": s["name"], "index": s["index"]} for s in steps])
    elif method == "execute_step":
        index = payload["body"]["step_index"]
        step = steps[index]
        if step.get("die"):
            os._exit(3)
        if step.get("hang"):
            time.sleep(3600)
        for line in step.get("lines", []):
            send_frame({"type": "streamChunk", "payload": {"id": call_id, "data": {"line": line, "stream": "stdout"}}})
        send_frame({"type": "streamEnd", "payload": {"id": call_id}})
        body = {"step_index": index, "exit_status": step.get("exit_status", 0), "duration_ms": 1}
        if step.get("error_message") is not None:
            body["error_message"] = step["error_message"]
        send_result(call_id, body)
    elif method == "cancel":
        send_result(call_id)
    elif method == "shutdown":
        send_result(call_id)
        if not CFG.get("ignore_shutdown"):
            conn.close()
            sys.exit(0)
"#;

/// Write an executable fake plugin into `dir` and return its path.
///
/// `config` is embedded into the script verbatim; see [`plugin_config`]
/// and the step helpers for its shape.
pub fn write_fake_plugin(dir: &Path, name: &str, config: &Value) -> PathBuf {
    let script = PLUGIN_TEMPLATE.replace("@CONFIG@", &config.to_string());
    let path = dir.join(name);
    std::fs::write(&path, script).expect("write fake plugin");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake plugin");
    }

    path
}

/// Minimal plugin config with the given steps.
pub fn plugin_config(steps: Vec<Value>) -> Value {
    json!({ "steps": steps })
}

/// A step that streams `lines` and exits 0.
pub fn ok_step(name: &str, index: usize, lines: &[&str]) -> Value {
    json!({ "name": name, "index": index, "lines": lines })
}

/// A step that exits non-zero with an error message.
pub fn failing_step(name: &str, index: usize, exit_status: i32, error_message: &str) -> Value {
    json!({
        "name": name,
        "index": index,
        "exit_status": exit_status,
        "error_message": error_message,
    })
}

/// A step whose process dies mid-call without answering.
pub fn dying_step(name: &str, index: usize) -> Value {
    json!({ "name": name, "index": index, "die": true })
}

/// A step that accepts the call and never answers.
pub fn hanging_step(name: &str, index: usize) -> Value {
    json!({ "name": name, "index": index, "hang": true })
}
