use crate::pw::build_info;
use crate::pw::cli::Args;
use crate::pw::logger::Logger;
use crate::pw::options::{self, LogPolicy, ResourceError, ServerConfig, ServerUrl};
use crate::pw::process::{
    matches_auto_log, OutputEvent, Process, ProcessInfo, ProcessState, RestAction, StreamKind,
    spawn_output_pump,
};
use crate::pw::rpc::{Fault, SupervisorHandle};
use crate::pw::signals::{self, SignalEvent};
use crate::pw::timers::TimerHeap;
use crate::pw::web;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, fork, geteuid, setsid, ForkResult, Gid, Pid, Uid};
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};

/// Consecutive child-log write failures reported before going quiet.
const SINK_ERROR_REPORT_LIMIT: u32 = 5;

/// Backoff grows linearly with the failure streak, capped modestly.
const BACKOFF_CAP_SECS: u64 = 30;

/// A control request from the RPC surface, serviced on the event-loop
/// task. Replies travel back over the oneshot; a dropped receiver means
/// the client disconnected and the reply is discarded.
#[derive(Debug)]
pub enum Command {
    GetMeta {
        resp: oneshot::Sender<DaemonMeta>,
    },
    GetProcessInfo {
        name: String,
        resp: oneshot::Sender<Result<ProcessInfo, Fault>>,
    },
    GetAllProcessInfo {
        resp: oneshot::Sender<Vec<ProcessInfo>>,
    },
    StartProcess {
        name: String,
        wait: bool,
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    StopProcess {
        name: String,
        wait: bool,
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    StartAll {
        wait: bool,
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    StopAll {
        wait: bool,
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    Restart {
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    Shutdown {
        resp: oneshot::Sender<bool>,
    },
    ReadProcessLog {
        name: String,
        offset: i64,
        length: i64,
        resp: oneshot::Sender<Result<String, Fault>>,
    },
    TailProcessLog {
        name: String,
        offset: i64,
        length: i64,
        resp: oneshot::Sender<Result<(String, i64, bool), Fault>>,
    },
    ClearProcessLog {
        name: String,
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    ClearAllProcessLogs {
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
    ReadLog {
        offset: i64,
        length: i64,
        resp: oneshot::Sender<Result<String, Fault>>,
    },
    ClearLog {
        resp: oneshot::Sender<Result<bool, Fault>>,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonMeta {
    pub identifier: String,
    pub version: String,
    pub api_version: String,
    pub pid: i32,
    pub statecode: i32,
    pub statename: String,
}

#[derive(Debug)]
enum TimerAction {
    BackoffExpired(String),
    KillEscalate(String),
    StartsecsElapsed(String),
}

#[derive(Debug)]
enum WaitKind {
    Started(String),
    Stopped(String),
    AllResting,
    /// restart(): once everything is down, kick off start-all and keep
    /// the caller parked until the fleet rests again.
    RestartStopped,
}

struct Waiter {
    kind: WaitKind,
    resp: oneshot::Sender<Result<bool, Fault>>,
}

enum Turn {
    Signal(Option<SignalEvent>),
    Output(Option<OutputEvent>),
    Cmd(Option<Command>),
    TimerDue,
}

enum Bound {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Daemonize: double fork with an intervening setsid, chdir, umask, and
/// std streams redirected to /dev/null. Must run before the async
/// runtime exists.
pub fn daemonize(cfg: &ServerConfig) -> anyhow::Result<()> {
    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    if let Some(dir) = &cfg.directory {
        std::env::set_current_dir(dir)
            .with_context(|| format!("chdir to {}", dir.display()))?;
    }
    unsafe {
        libc::umask(cfg.umask as libc::mode_t);
    }
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    use std::os::fd::AsRawFd;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).context("redirect std stream")?;
    }
    Ok(())
}

/// Bootstrap and run the daemon until shutdown. Ordering matters: the
/// socket is bound, the pidfile written and the log directories ensured
/// while still privileged; the configured user is dropped to just before
/// the loop starts.
pub async fn run_daemon(cfg: ServerConfig, args: Args) -> anyhow::Result<()> {
    options::enforce_rlimits(&cfg)?;

    let mut unix_socket_path = None;
    let bound = match &cfg.http_port {
        Some(ServerUrl::Tcp(addr)) => Some(Bound::Tcp(
            TcpListener::bind(addr)
                .await
                .map_err(|e| ResourceError(format!("could not bind {addr}: {e}")))?,
        )),
        Some(ServerUrl::Unix(path)) => {
            if path.exists() {
                std::fs::remove_file(path)
                    .map_err(|e| ResourceError(format!("stale socket {}: {e}", path.display())))?;
            }
            let l = UnixListener::bind(path)
                .map_err(|e| ResourceError(format!("could not bind {}: {e}", path.display())))?;
            apply_socket_settings(path, &cfg)?;
            unix_socket_path = Some(path.clone());
            Some(Bound::Unix(l))
        }
        None => None,
    };

    let mut logger = Logger::new(
        cfg.logfile.clone(),
        cfg.logfile_maxbytes,
        cfg.logfile_backups,
        cfg.loglevel,
        cfg.nodaemon,
    );
    logger.info(build_info::banner());

    std::fs::create_dir_all(&cfg.childlogdir)
        .map_err(|e| ResourceError(format!("childlogdir {}: {e}", cfg.childlogdir.display())))?;
    if !cfg.nocleanup {
        clear_auto_child_logs(&cfg, &mut logger);
    }

    write_pidfile(&cfg.pidfile)?;
    logger.info(format!(
        "daemonizing over; pid {} written to {}",
        std::process::id(),
        cfg.pidfile.display()
    ));

    if let Some(user) = &cfg.user {
        if geteuid().is_root() {
            drop_privileges(user)?;
            logger.info(format!("dropped privileges to user {user}"));
        } else {
            logger.warn(format!(
                "user {user} configured but not running as root; cannot drop privileges"
            ));
        }
    }

    let signal_rx = signals::spawn_listener()?;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    if let Some(bound) = bound {
        let state = web::WebState::new(
            SupervisorHandle::new(cmd_tx.clone()),
            cfg.http_username.clone(),
            cfg.http_password.clone(),
            cfg.identifier.clone(),
        );
        match &cfg.http_port {
            Some(ServerUrl::Tcp(addr)) => logger.info(format!("RPC server listening on {addr}")),
            Some(ServerUrl::Unix(p)) => {
                logger.info(format!("RPC server listening on {}", p.display()))
            }
            None => {}
        }
        match bound {
            Bound::Tcp(l) => web::spawn_tcp_server(l, state),
            Bound::Unix(l) => web::spawn_unix_server(l, state),
        }
    }

    let processes = cfg
        .programs
        .iter()
        .cloned()
        .map(|p| Process::new(p, &cfg.childlogdir, &cfg.identifier))
        .collect();

    let supervisor = Supervisor {
        cfg,
        args,
        logger,
        processes,
        timers: TimerHeap::new(),
        waiters: Vec::new(),
        shutting_down: false,
        live_pumps: 0,
        _cmd_tx: cmd_tx,
        output_tx,
        output_rx,
        cmd_rx,
        signal_rx,
        unix_socket_path,
    };
    supervisor.run().await
}

pub struct Supervisor {
    cfg: ServerConfig,
    args: Args,
    logger: Logger,
    processes: Vec<Process>,
    timers: TimerHeap<TimerAction>,
    waiters: Vec<Waiter>,
    shutting_down: bool,
    /// Output dispatchers that have not yet reported EOF. Two per live
    /// child; a nonzero count at exit means pipes were still draining.
    live_pumps: usize,
    // Held so cmd_rx never observes a closed channel if the RPC server dies.
    _cmd_tx: mpsc::UnboundedSender<Command>,
    output_tx: mpsc::UnboundedSender<OutputEvent>,
    output_rx: mpsc::UnboundedReceiver<OutputEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    unix_socket_path: Option<PathBuf>,
}

impl Supervisor {
    async fn run(mut self) -> anyhow::Result<()> {
        self.logger
            .info(format!("supervisor started with pid {}", std::process::id()));
        self.start_all(true);

        loop {
            let deadline = self.timers.next_deadline();
            let turn = tokio::select! {
                ev = self.signal_rx.recv() => Turn::Signal(ev),
                ev = self.output_rx.recv() => Turn::Output(ev),
                cmd = self.cmd_rx.recv() => Turn::Cmd(cmd),
                _ = sleep_until_opt(deadline) => Turn::TimerDue,
            };
            match turn {
                Turn::Signal(Some(ev)) => self.handle_signal(ev),
                Turn::Output(Some(ev)) => self.handle_output(ev),
                Turn::Cmd(Some(cmd)) => self.handle_command(cmd),
                Turn::TimerDue => self.fire_due_timers(),
                // Both channels keep a live sender for the daemon's
                // lifetime; a closed channel here is unreachable.
                Turn::Signal(None) | Turn::Output(None) | Turn::Cmd(None) => {}
            }
            self.apply_rest_actions();
            self.service_waiters();
            if self.shutting_down && self.all_children_down() {
                break;
            }
        }

        // Give in-flight RPC responses (shutdown acks in particular) a
        // moment to reach their sockets before the listener dies with us.
        tokio::time::sleep(Duration::from_millis(100)).await;

        if self.live_pumps > 0 {
            self.logger.debug(format!(
                "exiting with {} output pump(s) still draining",
                self.live_pumps
            ));
        }
        self.logger.info("shut down cleanly");
        let _ = std::fs::remove_file(&self.cfg.pidfile);
        if let Some(p) = &self.unix_socket_path {
            let _ = std::fs::remove_file(p);
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.processes.iter().position(|p| p.config.name == name)
    }

    fn priority_order(&self, ascending: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.processes.len()).collect();
        order.sort_by(|&a, &b| {
            let pa = (&self.processes[a].config.priority, &self.processes[a].config.name);
            let pb = (&self.processes[b].config.priority, &self.processes[b].config.name);
            pa.cmp(&pb)
        });
        if !ascending {
            order.reverse();
        }
        order
    }

    fn all_children_down(&self) -> bool {
        self.processes
            .iter()
            .all(|p| !p.state.has_live_child() && p.state != ProcessState::Backoff)
    }

    // ---- signals ----

    fn handle_signal(&mut self, ev: SignalEvent) {
        match ev {
            SignalEvent::Shutdown(signame) => {
                self.logger
                    .critical(format!("received {signame} indicating exit request"));
                self.begin_shutdown();
            }
            SignalEvent::Reload => {
                if self.shutting_down {
                    return;
                }
                self.logger
                    .info("received SIGHUP indicating reload request");
                self.reload();
            }
            SignalEvent::Rotate => {
                self.logger
                    .info("received SIGUSR2 indicating log rotation request");
                self.rotate_all_logs();
            }
            SignalEvent::Child => self.reap(),
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.stop_all();
    }

    fn rotate_all_logs(&mut self) {
        if let Err(e) = self.logger.sink_mut().rotate() {
            self.logger
                .error(format!("failed to rotate activity log: {e}"));
        }
        for i in 0..self.processes.len() {
            let name = self.processes[i].config.name.clone();
            if let Some(log) = self.processes[i].log.as_mut() {
                if let Err(e) = log.rotate() {
                    self.logger
                        .error(format!("failed to rotate log for {name}: {e}"));
                }
            }
        }
    }

    // ---- reaping ----

    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.on_reaped(pid, Some(code), None),
                Ok(WaitStatus::Signaled(pid, sig, _)) => self.on_reaped(pid, None, Some(sig)),
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    self.logger.error(format!("waitpid failed: {e}"));
                    break;
                }
            }
        }
    }

    fn on_reaped(&mut self, pid: Pid, code: Option<i32>, sig: Option<Signal>) {
        let Some(idx) = self.processes.iter().position(|p| p.pid == Some(pid)) else {
            self.logger.critical(format!("reaped unknown pid {pid}"));
            return;
        };

        let p = &mut self.processes[idx];
        let name = p.config.name.clone();
        if let Some(t) = p.start_timer.take() {
            self.timers.cancel(t);
        }
        p.pid = None;
        p.started_at = None;
        p.laststop = now_epoch();
        p.exitstatus = code;
        p.killed_by = sig.map(Signal::as_str);
        let exit_desc = match (code, sig) {
            (Some(c), _) => format!("exit status {c}"),
            (None, Some(s)) => format!("terminated by {s}"),
            (None, None) => "unknown wait status".to_string(),
        };

        match p.state {
            ProcessState::Stopping => {
                if let Some(t) = p.kill_timer.take() {
                    self.timers.cancel(t);
                }
                p.state = ProcessState::Stopped;
                self.logger.info(format!("stopped: {name} ({exit_desc})"));
            }
            ProcessState::Starting => {
                // An expected exit code rests the process even when it died
                // inside the startsecs window; anything else is a failed
                // start.
                let expected = code.map(|c| p.expected_exit(c)).unwrap_or(false);
                if expected {
                    p.state = ProcessState::Exited;
                    p.backoff = 0;
                    self.logger
                        .info(format!("exited: {name} ({exit_desc}; expected)"));
                } else {
                    p.failure_reason =
                        Some("Exited too quickly (process log may have details)".to_string());
                    self.logger
                        .info(format!("exited: {name} ({exit_desc}; not expected)"));
                    self.backoff_or_fatal(idx);
                }
            }
            ProcessState::Running => {
                let expected = code.map(|c| p.expected_exit(c)).unwrap_or(false);
                if expected {
                    p.state = ProcessState::Exited;
                    p.backoff = 0;
                    let autorestart = p.config.autorestart;
                    let pending = p.after_rest.is_some();
                    self.logger
                        .info(format!("exited: {name} ({exit_desc}; expected)"));
                    if autorestart && !self.shutting_down && !pending {
                        self.start_process(idx);
                    }
                } else {
                    p.failure_reason = Some(match (code, sig) {
                        (Some(c), _) => format!("Bad exit code {c}"),
                        (None, Some(s)) => format!("Terminated by {s}"),
                        (None, None) => "Unknown wait status".to_string(),
                    });
                    self.logger
                        .info(format!("exited: {name} ({exit_desc}; not expected)"));
                    self.backoff_or_fatal(idx);
                }
            }
            state => {
                // A pid in any other state breaks the liveness invariant.
                p.state = ProcessState::Stopped;
                self.logger.critical(format!(
                    "pid {pid} of {name} reaped in unexpected state {state}; shutting down"
                ));
                self.begin_shutdown();
            }
        }
    }

    // ---- restart policy ----

    fn backoff_or_fatal(&mut self, idx: usize) {
        let forever = self.cfg.forever;
        let limit = self.cfg.backofflimit;
        let p = &mut self.processes[idx];
        let name = p.config.name.clone();
        p.backoff += 1;
        p.state = ProcessState::Backoff;
        if self.shutting_down {
            // No respawns during shutdown; rest where the original would
            // have given up.
            p.state = ProcessState::Fatal;
            return;
        }
        if !forever && p.backoff >= limit {
            p.state = ProcessState::Fatal;
            self.logger.info(format!(
                "gave up: {name} entered FATAL state, too many start retries too quickly"
            ));
            return;
        }
        let delay = Duration::from_secs((p.backoff as u64).min(BACKOFF_CAP_SECS));
        let token = self
            .timers
            .arm(Instant::now() + delay, TimerAction::BackoffExpired(name));
        p.backoff_timer = Some(token);
    }

    // ---- lifecycle operations ----

    fn start_process(&mut self, idx: usize) {
        let umask = self.cfg.umask;
        let as_root = geteuid().is_root();
        let startsecs = self.processes[idx].config.startsecs;
        let name = self.processes[idx].config.name.clone();

        if let Some(t) = self.processes[idx].backoff_timer.take() {
            self.timers.cancel(t);
        }
        {
            let p = &mut self.processes[idx];
            p.exitstatus = None;
            p.killed_by = None;
            p.spawnerr = None;
            p.failure_reason = None;
        }

        match self.processes[idx].spawn_child(umask, as_root) {
            Ok((pid, stdout, stderr)) => {
                let p = &mut self.processes[idx];
                p.pid = Some(pid);
                p.state = ProcessState::Starting;
                p.laststart = now_epoch();
                p.started_at = Some(Instant::now());
                spawn_output_pump(
                    name.clone(),
                    StreamKind::Stdout,
                    stdout,
                    self.output_tx.clone(),
                );
                spawn_output_pump(
                    name.clone(),
                    StreamKind::Stderr,
                    stderr,
                    self.output_tx.clone(),
                );
                self.live_pumps += 2;
                let token = self.timers.arm(
                    Instant::now() + Duration::from_secs(startsecs),
                    TimerAction::StartsecsElapsed(name.clone()),
                );
                self.processes[idx].start_timer = Some(token);
                self.logger
                    .info(format!("spawned: '{name}' with pid {pid}"));
            }
            Err(e) => {
                self.processes[idx].spawnerr = Some(e.to_string());
                self.processes[idx].laststart = now_epoch();
                self.logger.critical(format!("spawnerr: {name}: {e}"));
                self.backoff_or_fatal(idx);
            }
        }
    }

    fn stop_process(&mut self, idx: usize) {
        let stopwaitsecs = self.processes[idx].config.stopwaitsecs;
        let p = &mut self.processes[idx];
        let name = p.config.name.clone();
        match p.state {
            ProcessState::Running | ProcessState::Starting => {
                if let Some(t) = p.start_timer.take() {
                    self.timers.cancel(t);
                }
                p.state = ProcessState::Stopping;
                let sig = p.config.stopsignal;
                let pid = p.pid.expect("live state implies pid");
                self.logger
                    .info(format!("killing {name} (pid {pid}) with signal {sig}"));
                if let Err(e) = kill(pid, sig) {
                    // Likely already dead; the pending SIGCHLD will finish
                    // the transition.
                    self.logger
                        .debug(format!("stop signal to {name} failed: {e}"));
                }
                let token = self.timers.arm(
                    Instant::now() + Duration::from_secs(stopwaitsecs),
                    TimerAction::KillEscalate(name),
                );
                self.processes[idx].kill_timer = Some(token);
            }
            ProcessState::Backoff => {
                if let Some(t) = p.backoff_timer.take() {
                    self.timers.cancel(t);
                }
                p.state = ProcessState::Stopped;
                p.laststop = now_epoch();
                self.logger
                    .info(format!("stopped: {name} (cancelled pending restart)"));
            }
            // Idempotent for STOPPING; no-op success for resting states.
            _ => {}
        }
    }

    fn start_all(&mut self, autostart_only: bool) {
        for idx in self.priority_order(true) {
            let p = &self.processes[idx];
            if autostart_only && !p.config.autostart {
                continue;
            }
            if p.state.startable() && p.after_rest.is_none() {
                self.start_process(idx);
            }
        }
    }

    fn stop_all(&mut self) {
        for idx in self.priority_order(false) {
            self.stop_process(idx);
        }
    }

    // ---- timers ----

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(action) = self.timers.pop_due(now) {
            match action {
                TimerAction::BackoffExpired(name) => {
                    if let Some(idx) = self.find(&name) {
                        self.processes[idx].backoff_timer = None;
                        if self.processes[idx].state == ProcessState::Backoff {
                            self.start_process(idx);
                        }
                    }
                }
                TimerAction::KillEscalate(name) => {
                    if let Some(idx) = self.find(&name) {
                        self.processes[idx].kill_timer = None;
                        let p = &self.processes[idx];
                        if p.state == ProcessState::Stopping {
                            if let Some(pid) = p.pid {
                                self.logger
                                    .critical(format!("killing '{name}' ({pid}) with SIGKILL"));
                                if let Err(e) = kill(pid, Signal::SIGKILL) {
                                    self.logger
                                        .debug(format!("SIGKILL to {name} failed: {e}"));
                                }
                            }
                        }
                    }
                }
                TimerAction::StartsecsElapsed(name) => {
                    if let Some(idx) = self.find(&name) {
                        self.processes[idx].start_timer = None;
                        let p = &mut self.processes[idx];
                        if p.state == ProcessState::Starting && p.pid.is_some() {
                            p.state = ProcessState::Running;
                            p.backoff = 0;
                            let startsecs = p.config.startsecs;
                            self.logger.info(format!(
                                "success: {name} entered RUNNING state, process has stayed up \
                                 for > than {startsecs} seconds (startsecs)"
                            ));
                        }
                    }
                }
            }
        }
    }

    // ---- child output ----

    fn handle_output(&mut self, ev: OutputEvent) {
        let Some(data) = ev.data else {
            // EOF: the pump deregistered itself. Counted even when the
            // owning Process was already removed by a reload.
            self.live_pumps = self.live_pumps.saturating_sub(1);
            self.logger.trace(format!(
                "{} {} closed, {} pump(s) live",
                ev.name,
                ev.stream.as_str(),
                self.live_pumps
            ));
            return;
        };
        let Some(idx) = self.find(&ev.name) else {
            return;
        };
        if ev.stream == StreamKind::Stderr && !self.processes[idx].config.log_stderr {
            // Drained to keep the pipe from filling, but not logged.
            return;
        }
        let p = &mut self.processes[idx];
        let Some(log) = p.log.as_mut() else {
            return;
        };
        match log.write(&data) {
            Ok(()) => p.log_io_errors = 0,
            Err(e) => {
                p.log_io_errors = p.log_io_errors.saturating_add(1);
                if p.log_io_errors <= SINK_ERROR_REPORT_LIMIT {
                    let name = ev.name;
                    self.logger
                        .error(format!("failed writing log for {name}: {e}"));
                }
            }
        }
    }

    // ---- reload ----

    fn reload(&mut self) {
        let new = match options::load(&self.args) {
            Ok(c) => c,
            Err(e) => {
                self.logger.error(format!(
                    "reload failed, keeping the current configuration: {e}"
                ));
                return;
            }
        };

        let mut removed = 0usize;
        let mut changed = 0usize;
        let mut added = 0usize;

        for idx in 0..self.processes.len() {
            let name = self.processes[idx].config.name.clone();
            let action = match new.programs.iter().find(|n| n.name == name) {
                None => Some(RestAction::Remove),
                Some(ncfg) if *ncfg != self.processes[idx].config => {
                    Some(RestAction::Replace(ncfg.clone()))
                }
                Some(_) => None,
            };
            let Some(action) = action else { continue };
            match action {
                RestAction::Remove => removed += 1,
                RestAction::Replace(_) => changed += 1,
            }
            self.processes[idx].after_rest = Some(action);
            if self.processes[idx].state.has_live_child()
                || self.processes[idx].state == ProcessState::Backoff
            {
                self.stop_process(idx);
            }
        }

        for ncfg in &new.programs {
            if self.find(&ncfg.name).is_none() {
                added += 1;
                self.processes.push(Process::new(
                    ncfg.clone(),
                    &new.childlogdir,
                    &new.identifier,
                ));
            }
        }

        self.cfg = new;
        self.logger.info(format!(
            "configuration reloaded: {added} added, {changed} changed, {removed} removed"
        ));
        self.start_all(true);
    }

    /// Apply deferred reload actions to every process that has reached a
    /// resting state.
    fn apply_rest_actions(&mut self) {
        let mut i = 0;
        while i < self.processes.len() {
            let due = self.processes[i].after_rest.is_some() && self.processes[i].state.resting();
            if !due {
                i += 1;
                continue;
            }
            let action = self.processes[i].after_rest.take().expect("due implies action");
            match action {
                RestAction::Remove => {
                    self.teardown_auto_log(i);
                    let name = self.processes[i].config.name.clone();
                    self.processes.remove(i);
                    self.logger.info(format!("removed: {name}"));
                }
                RestAction::Replace(cfg) => {
                    self.teardown_auto_log(i);
                    let autostart = cfg.autostart;
                    let name = cfg.name.clone();
                    self.processes[i] =
                        Process::new(cfg, &self.cfg.childlogdir, &self.cfg.identifier);
                    self.logger.info(format!("updated: {name}"));
                    if autostart && !self.shutting_down {
                        self.start_process(i);
                    }
                    i += 1;
                }
            }
        }
    }

    /// AUTO logs die with their owner.
    fn teardown_auto_log(&mut self, idx: usize) {
        let p = &mut self.processes[idx];
        if matches!(p.config.logfile, LogPolicy::Auto) {
            if let Some(log) = p.log.as_mut() {
                if let Err(e) = log.clear() {
                    let name = p.config.name.clone();
                    self.logger
                        .error(format!("failed removing AUTO log for {name}: {e}"));
                }
            }
        }
    }

    // ---- RPC commands ----

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::GetMeta { resp } => {
                let _ = resp.send(self.meta());
            }
            Command::GetProcessInfo { name, resp } => {
                let r = match self.find(&name) {
                    Some(idx) => Ok(self.processes[idx].info()),
                    None => Err(Fault::bad_name(&name)),
                };
                let _ = resp.send(r);
            }
            Command::GetAllProcessInfo { resp } => {
                let infos = self
                    .priority_order(true)
                    .into_iter()
                    .map(|i| self.processes[i].info())
                    .collect();
                let _ = resp.send(infos);
            }
            Command::StartProcess { name, wait, resp } => match self.find(&name) {
                None => {
                    let _ = resp.send(Err(Fault::bad_name(&name)));
                }
                Some(idx) => {
                    if self.processes[idx].state.has_live_child() {
                        let _ = resp.send(Err(Fault::already_started(&name)));
                    } else if self.shutting_down {
                        let _ = resp.send(Err(Fault::shutting_down()));
                    } else {
                        // An operator start begins a fresh failure streak.
                        self.processes[idx].backoff = 0;
                        self.start_process(idx);
                        if wait {
                            self.waiters.push(Waiter {
                                kind: WaitKind::Started(name),
                                resp,
                            });
                        } else {
                            let _ = resp.send(Ok(true));
                        }
                    }
                }
            },
            Command::StopProcess { name, wait, resp } => match self.find(&name) {
                None => {
                    let _ = resp.send(Err(Fault::bad_name(&name)));
                }
                Some(idx) => {
                    let state = self.processes[idx].state;
                    if state.has_live_child() {
                        self.stop_process(idx);
                        if wait {
                            self.waiters.push(Waiter {
                                kind: WaitKind::Stopped(name),
                                resp,
                            });
                        } else {
                            let _ = resp.send(Ok(true));
                        }
                    } else {
                        // STOPPED, EXITED, FATAL and BACKOFF all report
                        // success; BACKOFF additionally cancels the
                        // pending respawn.
                        if state == ProcessState::Backoff {
                            self.stop_process(idx);
                        }
                        let _ = resp.send(Ok(true));
                    }
                }
            },
            Command::StartAll { wait, resp } => {
                if self.shutting_down {
                    let _ = resp.send(Err(Fault::shutting_down()));
                    return;
                }
                self.start_all(false);
                if wait {
                    self.waiters.push(Waiter {
                        kind: WaitKind::AllResting,
                        resp,
                    });
                } else {
                    let _ = resp.send(Ok(true));
                }
            }
            Command::StopAll { wait, resp } => {
                self.stop_all();
                if wait {
                    self.waiters.push(Waiter {
                        kind: WaitKind::AllResting,
                        resp,
                    });
                } else {
                    let _ = resp.send(Ok(true));
                }
            }
            Command::Restart { resp } => {
                if self.shutting_down {
                    let _ = resp.send(Err(Fault::shutting_down()));
                    return;
                }
                self.logger.info("restart requested: stopping all processes");
                self.stop_all();
                self.waiters.push(Waiter {
                    kind: WaitKind::RestartStopped,
                    resp,
                });
            }
            Command::Shutdown { resp } => {
                let _ = resp.send(true);
                self.logger.critical("received shutdown request");
                self.begin_shutdown();
            }
            Command::ReadProcessLog {
                name,
                offset,
                length,
                resp,
            } => {
                let _ = resp.send(self.with_process_log(&name, |log| {
                    log.read_range(offset, length)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                }));
            }
            Command::TailProcessLog {
                name,
                offset,
                length,
                resp,
            } => {
                let _ = resp.send(self.with_process_log(&name, |log| {
                    log.tail(offset, length).map(|(bytes, next, overflow)| {
                        (String::from_utf8_lossy(&bytes).into_owned(), next, overflow)
                    })
                }));
            }
            Command::ClearProcessLog { name, resp } => {
                let _ = resp.send(self.with_process_log(&name, |log| log.clear().map(|_| true)));
            }
            Command::ClearAllProcessLogs { resp } => {
                let mut result = Ok(true);
                for p in self.processes.iter_mut() {
                    if let Some(log) = p.log.as_mut() {
                        if let Err(e) = log.clear() {
                            result = Err(Fault::failed(format!(
                                "clearing log for {}: {e}",
                                p.config.name
                            )));
                        }
                    }
                }
                let _ = resp.send(result);
            }
            Command::ReadLog {
                offset,
                length,
                resp,
            } => {
                let r = self
                    .logger
                    .sink()
                    .read_range(offset, length)
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .map_err(|e| Fault::failed(format!("reading activity log: {e}")));
                let _ = resp.send(r);
            }
            Command::ClearLog { resp } => {
                let r = self
                    .logger
                    .sink_mut()
                    .clear()
                    .map(|_| true)
                    .map_err(|e| Fault::failed(format!("clearing activity log: {e}")));
                let _ = resp.send(r);
            }
        }
    }

    fn with_process_log<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut crate::pw::logger::RotatingFile) -> std::io::Result<T>,
    ) -> Result<T, Fault> {
        let idx = self.find(name).ok_or_else(|| Fault::bad_name(name))?;
        let p = &mut self.processes[idx];
        let log = p.log.as_mut().ok_or_else(|| Fault::no_file(name))?;
        f(log).map_err(|e| Fault::failed(format!("log operation for {name}: {e}")))
    }

    fn meta(&self) -> DaemonMeta {
        let (statecode, statename) = if self.shutting_down {
            (1, "SHUTDOWN")
        } else {
            (0, "ACTIVE")
        };
        DaemonMeta {
            identifier: self.cfg.identifier.clone(),
            version: build_info::version().to_string(),
            api_version: crate::pw::rpc::API_VERSION.to_string(),
            pid: std::process::id() as i32,
            statecode,
            statename: statename.to_string(),
        }
    }

    // ---- waiters ----

    fn service_waiters(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        let mut restart_fired = false;
        for waiter in waiters {
            // A disconnected caller is dropped on the floor.
            if waiter.resp.is_closed() {
                continue;
            }
            let Waiter { kind, resp } = waiter;
            match kind {
                WaitKind::Started(name) => match self.find(&name) {
                    None => {
                        let _ = resp.send(Err(Fault::bad_name(&name)));
                    }
                    Some(idx) => match self.processes[idx].state {
                        ProcessState::Running => {
                            let _ = resp.send(Ok(true));
                        }
                        ProcessState::Fatal => {
                            let p = &self.processes[idx];
                            let msg = p
                                .failure_reason
                                .clone()
                                .or_else(|| p.spawnerr.clone())
                                .unwrap_or_else(|| "gave up".to_string());
                            let _ = resp.send(Err(Fault::spawn_error(&name, &msg)));
                        }
                        ProcessState::Exited | ProcessState::Stopped => {
                            let _ = resp.send(Err(Fault::abnormal_termination(&name)));
                        }
                        // Still STARTING or BACKOFF: keep waiting.
                        _ => self.waiters.push(Waiter {
                            kind: WaitKind::Started(name),
                            resp,
                        }),
                    },
                },
                WaitKind::Stopped(name) => match self.find(&name) {
                    None => {
                        let _ = resp.send(Ok(true));
                    }
                    Some(idx) => {
                        if self.processes[idx].state.has_live_child() {
                            self.waiters.push(Waiter {
                                kind: WaitKind::Stopped(name),
                                resp,
                            });
                        } else {
                            let _ = resp.send(Ok(true));
                        }
                    }
                },
                WaitKind::AllResting => {
                    if self.processes.iter().all(|p| p.state.resting()) {
                        let _ = resp.send(Ok(true));
                    } else {
                        self.waiters.push(Waiter {
                            kind: WaitKind::AllResting,
                            resp,
                        });
                    }
                }
                WaitKind::RestartStopped => {
                    let all_down = self
                        .processes
                        .iter()
                        .all(|p| !p.state.has_live_child() && p.state != ProcessState::Backoff);
                    if all_down {
                        restart_fired = true;
                        self.waiters.push(Waiter {
                            kind: WaitKind::AllResting,
                            resp,
                        });
                    } else {
                        self.waiters.push(Waiter {
                            kind: WaitKind::RestartStopped,
                            resp,
                        });
                    }
                }
            }
        }
        if restart_fired && !self.shutting_down {
            self.logger.info("restart: starting all processes");
            self.start_all(true);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

fn now_epoch() -> i64 {
    chrono::Local::now().timestamp()
}

fn write_pidfile(path: &Path) -> anyhow::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            ResourceError(format!(
                "could not create pidfile {} (already running?): {e}",
                path.display()
            ))
        })?;
    writeln!(f, "{}", std::process::id()).map_err(|e| {
        anyhow::Error::new(ResourceError(format!(
            "could not write pidfile {}: {e}",
            path.display()
        )))
    })?;
    Ok(())
}

fn clear_auto_child_logs(cfg: &ServerConfig, logger: &mut Logger) {
    let entries = match std::fs::read_dir(&cfg.childlogdir) {
        Ok(e) => e,
        Err(e) => {
            logger.info(format!(
                "could not clear childlogdir {}: {e}",
                cfg.childlogdir.display()
            ));
            return;
        }
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let fname = entry.file_name();
        let Some(fname) = fname.to_str() else { continue };
        if matches_auto_log(fname, &cfg.identifier) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => logger.info(format!("failed to clean up {fname}: {e}")),
            }
        }
    }
    if removed > 0 {
        logger.info(format!("removed {removed} orphaned child log file(s)"));
    }
}

fn apply_socket_settings(path: &Path, cfg: &ServerConfig) -> anyhow::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(cfg.sockchmod))
        .with_context(|| format!("chmod {}", path.display()))?;
    if let Some((user, group)) = &cfg.sockchown {
        let u = users::get_user_by_name(user)
            .ok_or_else(|| anyhow::anyhow!("sockchown: no such user {user:?}"))?;
        let gid = match group {
            Some(g) => users::get_group_by_name(g)
                .ok_or_else(|| anyhow::anyhow!("sockchown: no such group {g:?}"))?
                .gid(),
            None => u.primary_group_id(),
        };
        nix::unistd::chown(
            path,
            Some(Uid::from_raw(u.uid())),
            Some(Gid::from_raw(gid)),
        )
        .with_context(|| format!("chown {}", path.display()))?;
    }
    Ok(())
}

/// Drop to the configured user: primary group first, then the uid. Only
/// ever a drop, never an escalation.
fn drop_privileges(user: &str) -> anyhow::Result<()> {
    let u = users::get_user_by_name(user)
        .ok_or_else(|| anyhow::anyhow!("cannot drop privileges: no such user {user:?}"))?;
    nix::unistd::setgid(Gid::from_raw(u.primary_group_id())).context("setgid")?;
    nix::unistd::setuid(Uid::from_raw(u.uid())).context("setuid")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pw.pid");
        write_pidfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", std::process::id()));

        let err = write_pidfile(&path).unwrap_err();
        assert!(err.downcast_ref::<ResourceError>().is_some());
    }
}
