use crate::pw::supervisor::Command;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

pub const API_VERSION: &str = "1.0";

/// Numeric fault codes carried in RPC error envelopes.
pub mod faults {
    pub const UNKNOWN_METHOD: i32 = 1;
    pub const INCORRECT_PARAMETERS: i32 = 2;
    pub const BAD_ARGUMENTS: i32 = 3;
    pub const BAD_NAME: i32 = 10;
    pub const NO_FILE: i32 = 20;
    pub const FAILED: i32 = 30;
    pub const ABNORMAL_TERMINATION: i32 = 40;
    pub const SPAWN_ERROR: i32 = 50;
    pub const ALREADY_STARTED: i32 = 60;
    pub const NOT_RUNNING: i32 = 70;
    pub const SHUTDOWN_STATE: i32 = 90;
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
}

/// A structured RPC failure: numeric code plus message. Faults travel in
/// the response envelope and never crash the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(faults::UNKNOWN_METHOD, format!("unknown method {method:?}"))
    }

    pub fn incorrect_parameters(detail: impl Into<String>) -> Self {
        Self::new(faults::INCORRECT_PARAMETERS, detail)
    }

    pub fn bad_name(name: &str) -> Self {
        Self::new(faults::BAD_NAME, format!("no such process {name:?}"))
    }

    pub fn no_file(name: &str) -> Self {
        Self::new(faults::NO_FILE, format!("no log file for process {name:?}"))
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(faults::FAILED, detail)
    }

    pub fn abnormal_termination(name: &str) -> Self {
        Self::new(
            faults::ABNORMAL_TERMINATION,
            format!("{name}: terminated before reaching RUNNING"),
        )
    }

    pub fn spawn_error(name: &str, detail: &str) -> Self {
        Self::new(faults::SPAWN_ERROR, format!("{name}: {detail}"))
    }

    pub fn already_started(name: &str) -> Self {
        Self::new(faults::ALREADY_STARTED, format!("{name}: already started"))
    }

    pub fn shutting_down() -> Self {
        Self::new(faults::SHUTDOWN_STATE, "supervisor is shutting down")
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(faults::PARSE_ERROR, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(faults::INVALID_REQUEST, detail)
    }
}

/// One call envelope: a namespaced method name and ordered arguments.
/// A request body is either a single envelope or an array of them; the
/// batched form returns a matching array of responses in order.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            fault: None,
        }
    }

    pub fn fault(id: Value, fault: Fault) -> Self {
        Self {
            id,
            result: None,
            fault: Some(fault),
        }
    }
}

/// Registry entry for one exposed method. The table below is the single
/// source of truth: dispatch rejects anything not listed, and the
/// `system.*` introspection methods iterate it.
pub struct MethodSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub help: &'static str,
}

pub const METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "supervisor.getAPIVersion",
        signature: "string getAPIVersion()",
        help: "Version of the RPC API the daemon speaks.",
    },
    MethodSpec {
        name: "supervisor.getSupervisorVersion",
        signature: "string getSupervisorVersion()",
        help: "Version of the daemon serving this interface.",
    },
    MethodSpec {
        name: "supervisor.getIdentification",
        signature: "string getIdentification()",
        help: "Identifier of this daemon instance.",
    },
    MethodSpec {
        name: "supervisor.getState",
        signature: "struct getState()",
        help: "Current daemon state as {statecode, statename}.",
    },
    MethodSpec {
        name: "supervisor.getPID",
        signature: "int getPID()",
        help: "PID of the daemon process.",
    },
    MethodSpec {
        name: "supervisor.getProcessInfo",
        signature: "struct getProcessInfo(string name)",
        help: "Info about a process: name, state, description, pid, start, stop, exitstatus, spawnerr, logfile.",
    },
    MethodSpec {
        name: "supervisor.getAllProcessInfo",
        signature: "array getAllProcessInfo()",
        help: "Info about every process, in priority order.",
    },
    MethodSpec {
        name: "supervisor.startProcess",
        signature: "bool startProcess(string name, bool wait=true)",
        help: "Start a process; with wait=true the call returns when the process reaches RUNNING or fails.",
    },
    MethodSpec {
        name: "supervisor.stopProcess",
        signature: "bool stopProcess(string name, bool wait=true)",
        help: "Stop a process; a no-op success when it is not running.",
    },
    MethodSpec {
        name: "supervisor.startAllProcesses",
        signature: "bool startAllProcesses(bool wait=true)",
        help: "Start every process in priority order.",
    },
    MethodSpec {
        name: "supervisor.stopAllProcesses",
        signature: "bool stopAllProcesses(bool wait=true)",
        help: "Stop every process in reverse priority order.",
    },
    MethodSpec {
        name: "supervisor.restart",
        signature: "bool restart()",
        help: "Stop all processes, then start them again; returns once the fleet rests.",
    },
    MethodSpec {
        name: "supervisor.shutdown",
        signature: "bool shutdown()",
        help: "Shut the daemon down.",
    },
    MethodSpec {
        name: "supervisor.readProcessLog",
        signature: "string readProcessLog(string name, int offset, int length)",
        help: "Bytes [offset, offset+length) of a process log; negative offset counts from the end.",
    },
    MethodSpec {
        name: "supervisor.tailProcessLog",
        signature: "array tailProcessLog(string name, int offset, int length)",
        help: "Endpoint-relative log read: returns [bytes, offset, overflow].",
    },
    MethodSpec {
        name: "supervisor.clearProcessLog",
        signature: "bool clearProcessLog(string name)",
        help: "Remove a process log and its backups.",
    },
    MethodSpec {
        name: "supervisor.clearAllProcessLogs",
        signature: "bool clearAllProcessLogs()",
        help: "Remove every process log.",
    },
    MethodSpec {
        name: "supervisor.readLog",
        signature: "string readLog(int offset, int length)",
        help: "Read from the daemon's own activity log.",
    },
    MethodSpec {
        name: "supervisor.clearLog",
        signature: "bool clearLog()",
        help: "Clear the daemon's own activity log.",
    },
    MethodSpec {
        name: "system.listMethods",
        signature: "array listMethods()",
        help: "Names of every available method.",
    },
    MethodSpec {
        name: "system.methodHelp",
        signature: "string methodHelp(string name)",
        help: "Help text for a method.",
    },
    MethodSpec {
        name: "system.methodSignature",
        signature: "string methodSignature(string name)",
        help: "Signature of a method.",
    },
];

pub fn method_spec(name: &str) -> Option<&'static MethodSpec> {
    METHODS.iter().find(|m| m.name == name)
}

// -------- ordered-parameter helpers --------

fn param_str(params: &[Value], idx: usize, what: &str) -> Result<String, Fault> {
    match params.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Fault::incorrect_parameters(format!(
            "{what}: expected a string, got {other}"
        ))),
        None => Err(Fault::incorrect_parameters(format!("{what}: missing"))),
    }
}

fn param_i64(params: &[Value], idx: usize, default: i64, what: &str) -> Result<i64, Fault> {
    match params.get(idx) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| Fault::incorrect_parameters(format!("{what}: not an integer"))),
        Some(Value::Null) | None => Ok(default),
        Some(other) => Err(Fault::incorrect_parameters(format!(
            "{what}: expected an integer, got {other}"
        ))),
    }
}

fn param_bool(params: &[Value], idx: usize, default: bool, what: &str) -> Result<bool, Fault> {
    match params.get(idx) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Null) | None => Ok(default),
        Some(other) => Err(Fault::incorrect_parameters(format!(
            "{what}: expected a bool, got {other}"
        ))),
    }
}

/// The RPC server's door into the event loop: commands go in over the
/// channel, replies come back over per-call oneshots. A reply that never
/// arrives means the loop is gone.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    pub fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    fn send(&self, cmd: Command) -> Result<(), Fault> {
        self.tx.send(cmd).map_err(|_| Fault::shutting_down())
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, Fault> {
        rx.await.map_err(|_| Fault::shutting_down())
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Fault> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        self.recv(rx).await
    }

    pub async fn meta(&self) -> Result<crate::pw::supervisor::DaemonMeta, Fault> {
        self.roundtrip(|resp| Command::GetMeta { resp }).await
    }

    pub async fn all_process_info(&self) -> Result<Vec<crate::pw::process::ProcessInfo>, Fault> {
        self.roundtrip(|resp| Command::GetAllProcessInfo { resp })
            .await
    }

    pub async fn start_process(&self, name: String, wait: bool) -> Result<bool, Fault> {
        self.roundtrip(|resp| Command::StartProcess { name, wait, resp })
            .await?
    }

    pub async fn stop_process(&self, name: String, wait: bool) -> Result<bool, Fault> {
        self.roundtrip(|resp| Command::StopProcess { name, wait, resp })
            .await?
    }

    /// Dispatch one decoded call envelope.
    pub async fn dispatch(&self, req: RpcRequest) -> RpcResponse {
        let id = req.id.clone();
        match self.dispatch_inner(&req).await {
            Ok(result) => RpcResponse::result(id, result),
            Err(fault) => RpcResponse::fault(id, fault),
        }
    }

    async fn dispatch_inner(&self, req: &RpcRequest) -> Result<Value, Fault> {
        if method_spec(&req.method).is_none() {
            return Err(Fault::unknown_method(&req.method));
        }
        let p = &req.params;
        match req.method.as_str() {
            "supervisor.getAPIVersion" => Ok(json!(API_VERSION)),
            "supervisor.getSupervisorVersion" => {
                let meta = self.meta().await?;
                Ok(json!(meta.version))
            }
            "supervisor.getIdentification" => {
                let meta = self.meta().await?;
                Ok(json!(meta.identifier))
            }
            "supervisor.getState" => {
                let meta = self.meta().await?;
                Ok(json!({ "statecode": meta.statecode, "statename": meta.statename }))
            }
            "supervisor.getPID" => {
                let meta = self.meta().await?;
                Ok(json!(meta.pid))
            }
            "supervisor.getProcessInfo" => {
                let name = param_str(p, 0, "name")?;
                let info = self
                    .roundtrip(|resp| Command::GetProcessInfo { name, resp })
                    .await??;
                Ok(serde_json::to_value(info).expect("info serializes"))
            }
            "supervisor.getAllProcessInfo" => {
                let infos = self.all_process_info().await?;
                Ok(serde_json::to_value(infos).expect("info serializes"))
            }
            "supervisor.startProcess" => {
                let name = param_str(p, 0, "name")?;
                let wait = param_bool(p, 1, true, "wait")?;
                Ok(json!(self.start_process(name, wait).await?))
            }
            "supervisor.stopProcess" => {
                let name = param_str(p, 0, "name")?;
                let wait = param_bool(p, 1, true, "wait")?;
                Ok(json!(self.stop_process(name, wait).await?))
            }
            "supervisor.startAllProcesses" => {
                let wait = param_bool(p, 0, true, "wait")?;
                let r = self
                    .roundtrip(|resp| Command::StartAll { wait, resp })
                    .await??;
                Ok(json!(r))
            }
            "supervisor.stopAllProcesses" => {
                let wait = param_bool(p, 0, true, "wait")?;
                let r = self
                    .roundtrip(|resp| Command::StopAll { wait, resp })
                    .await??;
                Ok(json!(r))
            }
            "supervisor.restart" => {
                let r = self.roundtrip(|resp| Command::Restart { resp }).await??;
                Ok(json!(r))
            }
            "supervisor.shutdown" => {
                let r = self.roundtrip(|resp| Command::Shutdown { resp }).await?;
                Ok(json!(r))
            }
            "supervisor.readProcessLog" => {
                let name = param_str(p, 0, "name")?;
                let offset = param_i64(p, 1, 0, "offset")?;
                let length = param_i64(p, 2, 0, "length")?;
                let text = self
                    .roundtrip(|resp| Command::ReadProcessLog {
                        name,
                        offset,
                        length,
                        resp,
                    })
                    .await??;
                Ok(json!(text))
            }
            "supervisor.tailProcessLog" => {
                let name = param_str(p, 0, "name")?;
                let offset = param_i64(p, 1, 0, "offset")?;
                let length = param_i64(p, 2, 0, "length")?;
                let (text, next, overflow) = self
                    .roundtrip(|resp| Command::TailProcessLog {
                        name,
                        offset,
                        length,
                        resp,
                    })
                    .await??;
                Ok(json!([text, next, overflow]))
            }
            "supervisor.clearProcessLog" => {
                let name = param_str(p, 0, "name")?;
                let r = self
                    .roundtrip(|resp| Command::ClearProcessLog { name, resp })
                    .await??;
                Ok(json!(r))
            }
            "supervisor.clearAllProcessLogs" => {
                let r = self
                    .roundtrip(|resp| Command::ClearAllProcessLogs { resp })
                    .await??;
                Ok(json!(r))
            }
            "supervisor.readLog" => {
                let offset = param_i64(p, 0, 0, "offset")?;
                let length = param_i64(p, 1, 0, "length")?;
                let text = self
                    .roundtrip(|resp| Command::ReadLog {
                        offset,
                        length,
                        resp,
                    })
                    .await??;
                Ok(json!(text))
            }
            "supervisor.clearLog" => {
                let r = self.roundtrip(|resp| Command::ClearLog { resp }).await??;
                Ok(json!(r))
            }
            "system.listMethods" => {
                let names: Vec<&str> = METHODS.iter().map(|m| m.name).collect();
                Ok(json!(names))
            }
            "system.methodHelp" => {
                let name = param_str(p, 0, "name")?;
                let spec =
                    method_spec(&name).ok_or_else(|| Fault::unknown_method(&name))?;
                Ok(json!(spec.help))
            }
            "system.methodSignature" => {
                let name = param_str(p, 0, "name")?;
                let spec =
                    method_spec(&name).ok_or_else(|| Fault::unknown_method(&name))?;
                Ok(json!(spec.signature))
            }
            // method_spec() gated every name above.
            other => Err(Fault::unknown_method(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_decodes_with_defaults() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"method": "supervisor.getState"}"#).unwrap();
        assert_eq!(req.method, "supervisor.getState");
        assert!(req.params.is_empty());
        assert_eq!(req.id, Value::Null);

        let req: RpcRequest = serde_json::from_str(
            r#"{"method": "supervisor.startProcess", "params": ["web", false], "id": 7}"#,
        )
        .unwrap();
        assert_eq!(req.params, vec![json!("web"), json!(false)]);
        assert_eq!(req.id, json!(7));
    }

    #[test]
    fn response_envelope_is_result_xor_fault() {
        let ok = RpcResponse::result(json!(1), json!(true));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"fault\""));

        let bad = RpcResponse::fault(json!(1), Fault::bad_name("ghost"));
        let text = serde_json::to_string(&bad).unwrap();
        assert!(!text.contains("\"result\""));
        assert!(text.contains("\"code\":10"));
    }

    #[test]
    fn registry_contains_every_namespace() {
        assert!(METHODS.iter().any(|m| m.name.starts_with("supervisor.")));
        assert!(METHODS.iter().any(|m| m.name.starts_with("system.")));
        assert!(method_spec("supervisor.startProcess").is_some());
        assert!(method_spec("supervisor.noSuchThing").is_none());
    }

    #[test]
    fn registry_names_are_unique() {
        for (i, m) in METHODS.iter().enumerate() {
            assert!(
                METHODS.iter().skip(i + 1).all(|n| n.name != m.name),
                "duplicate registry entry {}",
                m.name
            );
        }
    }

    #[test]
    fn param_helpers_enforce_shape() {
        let params = vec![json!("web"), json!(true), json!(42)];
        assert_eq!(param_str(&params, 0, "name").unwrap(), "web");
        assert!(param_str(&params, 1, "name").is_err());
        assert!(param_str(&params, 9, "name").is_err());
        assert!(param_bool(&params, 1, false, "wait").unwrap());
        assert!(!param_bool(&params, 9, false, "wait").unwrap());
        assert_eq!(param_i64(&params, 2, 0, "len").unwrap(), 42);
        assert_eq!(param_i64(&params, 9, -1, "len").unwrap(), -1);
        assert!(param_i64(&params, 0, 0, "len").is_err());
    }

    #[tokio::test]
    async fn unknown_method_faults_without_touching_the_loop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(tx);
        let resp = handle
            .dispatch(RpcRequest {
                method: "supervisor.bogus".to_string(),
                params: vec![],
                id: json!(3),
            })
            .await;
        assert_eq!(resp.id, json!(3));
        let fault = resp.fault.unwrap();
        assert_eq!(fault.code, faults::UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn missing_required_parameter_faults() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(tx);
        let resp = handle
            .dispatch(RpcRequest {
                method: "supervisor.startProcess".to_string(),
                params: vec![],
                id: Value::Null,
            })
            .await;
        assert_eq!(resp.fault.unwrap().code, faults::INCORRECT_PARAMETERS);
    }
}
