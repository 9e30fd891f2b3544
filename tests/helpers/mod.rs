use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// A daemon instance running the built binary against a throwaway
/// directory, with the RPC surface on a loopback port.
pub struct Daemon {
    pub port: u16,
    pub dir: tempfile::TempDir,
    pub child: Child,
    pub auth: Option<(String, String)>,
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn config_body(dir: &std::path::Path, http_port: &str, extra: &str, programs: &str) -> String {
    format!(
        "[supervisord]\n\
         http_port = {http_port}\n\
         logfile = {dir}/daemon.log\n\
         pidfile = {dir}/daemon.pid\n\
         childlogdir = {dir}/childlogs\n\
         nodaemon = true\n\
         {extra}\n\
         \n\
         {programs}\n",
        dir = dir.display()
    )
}

impl Daemon {
    /// Write a config and launch the daemon, waiting for the RPC port to
    /// accept connections.
    pub fn launch(extra: &str, programs: &str) -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let body = config_body(dir.path(), &format!("127.0.0.1:{port}"), extra, programs);
        let config = dir.path().join("procwarden.conf");
        std::fs::write(&config, body).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_procwarden"))
            .arg("-c")
            .arg(&config)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let daemon = Daemon {
            port,
            dir,
            child,
            auth: None,
        };
        daemon.wait_for(|| TcpStream::connect(("127.0.0.1", daemon.port)).is_ok());
        daemon
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("procwarden.conf")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.path().join("daemon.pid")
    }

    /// Rewrite the config (same port) and signal a reload.
    pub fn rewrite_config(&self, extra: &str, programs: &str) {
        let body = config_body(
            self.dir.path(),
            &format!("127.0.0.1:{}", self.port),
            extra,
            programs,
        );
        std::fs::write(self.config_path(), body).unwrap();
    }

    pub fn send_signal(&self, sig: nix::sys::signal::Signal) {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(self.child.id() as i32),
            sig,
        )
        .unwrap();
    }

    /// One RPC call; panics on a fault envelope.
    pub fn rpc(&self, method: &str, params: Value) -> Value {
        let resp = self.rpc_envelope(method, params);
        if let Some(fault) = resp.get("fault") {
            panic!("{method} returned fault: {fault}");
        }
        resp.get("result").cloned().unwrap_or(Value::Null)
    }

    /// One RPC call returning the whole response envelope.
    pub fn rpc_envelope(&self, method: &str, params: Value) -> Value {
        let body = json!({ "method": method, "params": params, "id": 1 }).to_string();
        let (status, text) = self.http_post("/rpc", &body);
        assert_eq!(status, 200, "unexpected HTTP status for {method}: {text}");
        serde_json::from_str(&text).unwrap()
    }

    pub fn http_post(&self, path: &str, body: &str) -> (u16, String) {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        http_roundtrip(stream, path, body, self.auth.as_ref())
    }

    pub fn process_info(&self, name: &str) -> Value {
        self.rpc("supervisor.getProcessInfo", json!([name]))
    }

    /// Current state, or "" when the process is not (yet) known.
    pub fn state_of(&self, name: &str) -> String {
        let resp = self.rpc_envelope("supervisor.getProcessInfo", json!([name]));
        resp.get("result")
            .and_then(|r| r.get("state"))
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn wait_state(&self, name: &str, state: &str) {
        self.wait_for(|| self.state_of(name) == state);
    }

    pub fn wait_for(&self, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + POLL_TIMEOUT;
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("condition not reached within {POLL_TIMEOUT:?}");
    }

    /// Ask the daemon to shut down and wait for the process to exit.
    pub fn shutdown_and_wait(&mut self) -> i32 {
        let _ = self.rpc("supervisor.shutdown", json!([]));
        self.wait_exit()
    }

    pub fn wait_exit(&mut self) -> i32 {
        let deadline = Instant::now() + POLL_TIMEOUT;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code().unwrap_or(-1);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("daemon did not exit within {POLL_TIMEOUT:?}");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Minimal HTTP/1.0 client: one request, read to EOF.
pub fn http_roundtrip(
    mut stream: impl Read + Write,
    path: &str,
    body: &str,
    auth: Option<&(String, String)>,
) -> (u16, String) {
    let mut req = format!(
        "POST {path} HTTP/1.0\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        body.len()
    );
    if let Some((user, pass)) = auth {
        let token = BASE64.encode(format!("{user}:{pass}"));
        req.push_str(&format!("Authorization: Basic {token}\r\n"));
    }
    req.push_str("\r\n");
    req.push_str(body);
    stream.write_all(req.as_bytes()).unwrap();
    stream.flush().unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let status: u16 = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let payload = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, payload)
}
