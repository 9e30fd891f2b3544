use crate::pw::logger::RotatingFile;
use crate::pw::options::{LogPolicy, ProcessConfig};
use crate::pw::timers::TimerToken;
use chrono::{Local, TimeZone};
use nix::unistd::Pid;
use serde::Serialize;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::time::Instant;
use tokio::io::AsyncReadExt as _;
use tokio::net::unix::pipe;
use tokio::sync::mpsc::UnboundedSender;

/// Bound on a single pipe read, so one chatty child cannot starve the
/// rest of the loop's handlers in a turn.
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }

    /// States in which a live, unreaped child pid exists.
    pub fn has_live_child(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }

    /// States from which `start` is a legal transition.
    pub fn startable(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Exited | ProcessState::Fatal | ProcessState::Backoff
        )
    }

    /// Neither starting up, backing off, nor shutting down.
    pub fn resting(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Running | ProcessState::Exited | ProcessState::Fatal
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Captured child output, forwarded from a pump into the event loop.
/// `data == None` marks EOF on that stream; the pump deregisters itself
/// by returning.
#[derive(Debug)]
pub struct OutputEvent {
    pub name: String,
    pub stream: StreamKind,
    pub data: Option<Vec<u8>>,
}

/// What to do with a Process once it reaches a resting state after a
/// config reload made its entry obsolete.
#[derive(Debug, Clone)]
pub enum RestAction {
    Remove,
    Replace(ProcessConfig),
}

/// Snapshot served over RPC and rendered on the HTML page.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: &'static str,
    pub statecode: i32,
    pub description: String,
    pub pid: i64,
    pub start: i64,
    pub stop: i64,
    pub exitstatus: Option<i32>,
    pub spawnerr: String,
    pub logfile: String,
}

/// One controlled child: immutable spec plus supervised runtime state.
/// All mutation happens on the event-loop task.
#[derive(Debug)]
pub struct Process {
    pub config: ProcessConfig,
    pub state: ProcessState,
    pub pid: Option<Pid>,
    /// Wall-clock spawn/exit instants (epoch seconds; 0 = never).
    pub laststart: i64,
    pub laststop: i64,
    /// Monotonic spawn instant, for startsecs accounting.
    pub started_at: Option<Instant>,
    pub exitstatus: Option<i32>,
    /// Name of the signal that terminated the child, when it did not exit.
    pub killed_by: Option<&'static str>,
    /// Consecutive failed starts in the current streak.
    pub backoff: u32,
    /// Fork/exec failure message; runtime exits never land here.
    pub spawnerr: Option<String>,
    /// Why the last start attempt failed (early death, bad exit code).
    pub failure_reason: Option<String>,
    pub log: Option<RotatingFile>,
    /// Consecutive sink write failures, for rate-limited error reporting.
    pub log_io_errors: u32,
    pub backoff_timer: Option<TimerToken>,
    pub kill_timer: Option<TimerToken>,
    pub start_timer: Option<TimerToken>,
    /// Pending teardown/replacement once the process rests (reload diff).
    pub after_rest: Option<RestAction>,
}

impl Process {
    pub fn new(config: ProcessConfig, childlogdir: &Path, identifier: &str) -> Self {
        let log = match &config.logfile {
            LogPolicy::None => None,
            LogPolicy::Auto => Some(RotatingFile::new(
                auto_log_path(childlogdir, &config.name, identifier),
                config.logfile_maxbytes,
                config.logfile_backups,
            )),
            LogPolicy::Path(p) => Some(RotatingFile::new(
                p.clone(),
                config.logfile_maxbytes,
                config.logfile_backups,
            )),
        };
        Self {
            config,
            state: ProcessState::Stopped,
            pid: None,
            laststart: 0,
            laststop: 0,
            started_at: None,
            exitstatus: None,
            killed_by: None,
            backoff: 0,
            spawnerr: None,
            failure_reason: None,
            log,
            log_io_errors: 0,
            backoff_timer: None,
            kill_timer: None,
            start_timer: None,
            after_rest: None,
        }
    }

    /// Fork/exec the child. The child side detaches its controlling tty,
    /// reads stdin from /dev/null, writes stdout/stderr into our pipes,
    /// drops to the configured user when the daemon runs as root, applies
    /// the umask and execs with `SUPERVISOR_ENABLED=1` added to the
    /// environment. Exec and pre-exec failures surface here through the
    /// standard library's close-on-exec error pipe.
    pub fn spawn_child(
        &self,
        umask: u32,
        running_as_root: bool,
    ) -> anyhow::Result<(Pid, ChildStdout, ChildStderr)> {
        let argv = shell_words::split(&self.config.command)
            .map_err(|e| anyhow::anyhow!("unparseable command {:?}: {e}", self.config.command))?;
        let program = argv
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?;
        let filename = find_program(program)
            .ok_or_else(|| anyhow::anyhow!("can't find command {program:?}"))?;
        check_executable(&filename)?;

        let ids = match (&self.config.user, running_as_root) {
            (Some(user), true) => {
                let u = users::get_user_by_name(user)
                    .ok_or_else(|| anyhow::anyhow!("can't find user {user:?}"))?;
                Some((u.uid(), u.primary_group_id()))
            }
            // Without root we could never drop; leave the child as ourselves.
            _ => None,
        };

        let mut cmd = Command::new(&filename);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env("SUPERVISOR_ENABLED", "1");

        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some((uid, gid)) = ids {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                libc::umask(umask as libc::mode_t);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("couldn't exec {}: {e}", filename.display()))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let pid = Pid::from_raw(child.id() as i32);
        // The handle is dropped without waiting: reaping happens via
        // SIGCHLD + waitpid in the supervisor, never here.
        drop(child);
        Ok((pid, stdout, stderr))
    }

    /// Whether `code` is in the configured expected-exit set.
    pub fn expected_exit(&self, code: i32) -> bool {
        self.config.exitcodes.contains(&code)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            name: self.config.name.clone(),
            state: self.state.as_str(),
            statecode: statecode(self.state),
            description: self.description(),
            pid: self.pid.map(|p| p.as_raw() as i64).unwrap_or(0),
            start: self.laststart,
            stop: self.laststop,
            exitstatus: self.exitstatus,
            spawnerr: self.spawnerr.clone().unwrap_or_default(),
            logfile: self
                .log
                .as_ref()
                .map(|l| l.path().display().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn description(&self) -> String {
        match self.state {
            ProcessState::Stopped => {
                if self.laststop > 0 {
                    format!("stopped at {}", fmt_epoch(self.laststop))
                } else {
                    "Not started".to_string()
                }
            }
            ProcessState::Starting => "starting".to_string(),
            ProcessState::Running => {
                let uptime = self
                    .started_at
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0);
                format!(
                    "pid {}, uptime {}",
                    self.pid.map(|p| p.as_raw()).unwrap_or(0),
                    fmt_uptime(uptime)
                )
            }
            ProcessState::Backoff => self
                .failure_reason
                .clone()
                .or_else(|| self.spawnerr.clone())
                .unwrap_or_else(|| "retrying".to_string()),
            ProcessState::Stopping => "stopping".to_string(),
            ProcessState::Exited => match (self.exitstatus, self.killed_by) {
                (Some(code), _) => format!("exit status {}; {}", code, fmt_epoch(self.laststop)),
                (None, Some(sig)) => format!("terminated by {}; {}", sig, fmt_epoch(self.laststop)),
                (None, None) => format!("exited at {}", fmt_epoch(self.laststop)),
            },
            ProcessState::Fatal => self
                .failure_reason
                .clone()
                .or_else(|| self.spawnerr.clone())
                .unwrap_or_else(|| "gave up".to_string()),
            ProcessState::Unknown => "unknown".to_string(),
        }
    }
}

fn statecode(state: ProcessState) -> i32 {
    match state {
        ProcessState::Stopped => 0,
        ProcessState::Starting => 10,
        ProcessState::Running => 20,
        ProcessState::Backoff => 30,
        ProcessState::Stopping => 40,
        ProcessState::Exited => 100,
        ProcessState::Fatal => 200,
        ProcessState::Unknown => 1000,
    }
}

fn fmt_epoch(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}

fn fmt_uptime(mut s: u64) -> String {
    let hours = s / 3600;
    s %= 3600;
    let mins = s / 60;
    let secs = s % 60;
    format!("{hours}:{mins:02}:{secs:02}")
}

/// Path of a supervisor-chosen ("AUTO") log.
pub fn auto_log_path(childlogdir: &Path, name: &str, identifier: &str) -> PathBuf {
    childlogdir.join(format!("{name}---{identifier}.log"))
}

/// Does `file_name` belong to some program's AUTO log series for this
/// daemon instance (the base file or a numbered backup)?
pub fn matches_auto_log(file_name: &str, identifier: &str) -> bool {
    let marker = format!("---{identifier}.log");
    match file_name.find(&marker) {
        Some(idx) => {
            let rest = &file_name[idx + marker.len()..];
            rest.is_empty()
                || (rest.starts_with('.')
                    && rest.len() > 1
                    && rest[1..].chars().all(|c| c.is_ascii_digit()))
        }
        None => false,
    }
}

/// `$PATH` resolution for an unqualified argv[0].
fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn check_executable(path: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("can't find command {}: {e}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("command at {} is not a file", path.display());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        anyhow::bail!("command at {} is not executable", path.display());
    }
    Ok(())
}

/// One dispatcher per child stream: hands the pipe's read end to the
/// runtime's readiness machinery, forwards bounded chunks into the loop,
/// and deregisters on EOF by sending a final empty event and returning.
/// The Process does not consider the child gone until reap.
pub fn spawn_output_pump(
    name: String,
    stream: StreamKind,
    pipe_fd: impl IntoRawFd,
    tx: UnboundedSender<OutputEvent>,
) {
    let raw = pipe_fd.into_raw_fd();
    tokio::spawn(async move {
        // SAFETY: into_raw_fd transferred ownership of the descriptor.
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut reader = match pipe_reader(owned) {
            Ok(r) => r,
            Err(_) => {
                let _ = tx.send(OutputEvent { name, stream, data: None });
                return;
            }
        };
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = tx.send(OutputEvent { name, stream, data: None });
                    return;
                }
                Ok(n) => {
                    let chunk = OutputEvent {
                        name: name.clone(),
                        stream,
                        data: Some(buf[..n].to_vec()),
                    };
                    if tx.send(chunk).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// The pipe must be nonblocking before the runtime will poll it. F_SETFL
/// with just O_NONBLOCK is fine here: pipes carry no other status flags
/// we care to preserve.
fn pipe_reader(fd: OwnedFd) -> std::io::Result<pipe::Receiver> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(std::io::Error::from)?;
    pipe::Receiver::from_owned_fd(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pw::options::LogPolicy;
    use nix::sys::signal::Signal;

    fn config(name: &str, command: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            command: command.to_string(),
            priority: 999,
            autostart: true,
            autorestart: true,
            exitcodes: vec![0, 2],
            stopsignal: Signal::SIGTERM,
            user: None,
            log_stderr: false,
            logfile: LogPolicy::None,
            logfile_maxbytes: 0,
            logfile_backups: 0,
            startsecs: 1,
            stopwaitsecs: 10,
        }
    }

    #[test]
    fn state_predicates() {
        assert!(ProcessState::Running.has_live_child());
        assert!(ProcessState::Stopping.has_live_child());
        assert!(!ProcessState::Backoff.has_live_child());

        assert!(ProcessState::Fatal.startable());
        assert!(ProcessState::Backoff.startable());
        assert!(!ProcessState::Running.startable());

        assert!(ProcessState::Exited.resting());
        assert!(!ProcessState::Starting.resting());
        assert!(!ProcessState::Backoff.resting());
    }

    #[test]
    fn expected_exit_uses_configured_codes() {
        let p = Process::new(config("a", "/bin/true"), Path::new("/tmp"), "pw");
        assert!(p.expected_exit(0));
        assert!(p.expected_exit(2));
        assert!(!p.expected_exit(1));
    }

    #[test]
    fn auto_log_naming_roundtrip() {
        let p = auto_log_path(Path::new("/tmp/logs"), "web", "pw1");
        assert_eq!(p, PathBuf::from("/tmp/logs/web---pw1.log"));
        assert!(matches_auto_log("web---pw1.log", "pw1"));
        assert!(matches_auto_log("web---pw1.log.3", "pw1"));
        assert!(!matches_auto_log("web---pw1.log.bak", "pw1"));
        assert!(!matches_auto_log("web---other.log", "pw1"));
        assert!(!matches_auto_log("unrelated.txt", "pw1"));
    }

    #[test]
    fn none_policy_has_no_sink() {
        let p = Process::new(config("a", "/bin/true"), Path::new("/tmp"), "pw");
        assert!(p.log.is_none());
        assert_eq!(p.info().logfile, "");
    }

    #[test]
    fn auto_policy_points_into_childlogdir() {
        let mut cfg = config("a", "/bin/true");
        cfg.logfile = LogPolicy::Auto;
        let p = Process::new(cfg, Path::new("/var/childlogs"), "pw");
        assert_eq!(
            p.log.as_ref().unwrap().path(),
            Path::new("/var/childlogs/a---pw.log")
        );
    }

    #[test]
    fn spawn_reports_missing_command() {
        let p = Process::new(
            config("ghost", "/nonexistent/binary --flag"),
            Path::new("/tmp"),
            "pw",
        );
        let err = p.spawn_child(0o022, false).unwrap_err().to_string();
        assert!(err.contains("couldn't exec") || err.contains("can't find command"), "{err}");
    }

    #[test]
    fn spawn_resolves_via_path_and_reaps_cleanly() {
        let p = Process::new(config("sleeper", "sleep 30"), Path::new("/tmp"), "pw");
        let (pid, _out, _err) = p.spawn_child(0o022, false).unwrap();
        assert!(pid.as_raw() > 0);
        nix::sys::signal::kill(pid, Signal::SIGKILL).unwrap();
        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert!(matches!(status, nix::sys::wait::WaitStatus::Signaled(..)));
    }

    #[test]
    fn spawn_passes_quoted_arguments() {
        // sh -c 'exit 7' must arrive as a single argv element.
        let p = Process::new(config("q", "sh -c 'exit 7'"), Path::new("/tmp"), "pw");
        let (pid, _out, _err) = p.spawn_child(0o022, false).unwrap();
        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert!(matches!(
            status,
            nix::sys::wait::WaitStatus::Exited(_, 7)
        ));
    }

    #[test]
    fn info_snapshot_reflects_state() {
        let mut p = Process::new(config("a", "/bin/true"), Path::new("/tmp"), "pw");
        p.state = ProcessState::Fatal;
        p.spawnerr = Some("can't find command".to_string());
        let info = p.info();
        assert_eq!(info.state, "FATAL");
        assert_eq!(info.statecode, 200);
        assert_eq!(info.description, "can't find command");
        assert_eq!(info.pid, 0);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(fmt_uptime(0), "0:00:00");
        assert_eq!(fmt_uptime(61), "0:01:01");
        assert_eq!(fmt_uptime(3_723), "1:02:03");
    }
}
