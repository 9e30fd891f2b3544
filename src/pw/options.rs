use crate::pw::cli::Args;
use crate::pw::logger::LogLevel;
use anyhow::Context as _;
use ini::Ini;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Invalid or missing configuration. Fatal at startup with exit code 2.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Unmet resource preconditions (rlimits, bind, pidfile). Exit code 3 at
/// startup when the cause is an rlimit; otherwise nonzero.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ResourceError(pub String);

fn cfg_err(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigError(msg.into()))
}

/// Where the RPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUrl {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ServerUrl {
    /// `host:port`, a bare port, or an absolute filesystem path.
    pub fn parse(s: &str) -> anyhow::Result<ServerUrl> {
        let t = s.trim();
        if t.starts_with('/') {
            return Ok(ServerUrl::Unix(PathBuf::from(t)));
        }
        if t.chars().all(|c| c.is_ascii_digit()) && !t.is_empty() {
            let addr: SocketAddr = format!("127.0.0.1:{t}")
                .parse()
                .map_err(|e| cfg_err(format!("invalid http_port {s:?}: {e}")))?;
            return Ok(ServerUrl::Tcp(addr));
        }
        let addr: SocketAddr = t
            .parse()
            .map_err(|e| cfg_err(format!("invalid http_port {s:?}: {e}")))?;
        Ok(ServerUrl::Tcp(addr))
    }
}

/// Where a program's captured output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPolicy {
    /// Supervisor-chosen path under childlogdir; cleaned up at boot and at
    /// the owning program's teardown.
    Auto,
    /// Discard output after draining the pipes.
    None,
    Path(PathBuf),
}

/// One `[program:NAME]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub name: String,
    /// Raw command line; shell-style quoted splitting happens at spawn.
    pub command: String,
    /// Lower starts earlier and stops later.
    pub priority: i32,
    pub autostart: bool,
    pub autorestart: bool,
    pub exitcodes: Vec<i32>,
    pub stopsignal: Signal,
    pub user: Option<String>,
    /// Merge the child's stderr into the log alongside stdout.
    pub log_stderr: bool,
    pub logfile: LogPolicy,
    pub logfile_maxbytes: u64,
    pub logfile_backups: u32,
    /// Seconds a child must stay up before a start counts as successful.
    pub startsecs: u64,
    /// Grace period after the stop signal before SIGKILL.
    pub stopwaitsecs: u64,
}

/// `[supervisorctl]` settings; parsed for the external CLI client, unused
/// in-core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CtlConfig {
    pub serverurl: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub prompt: String,
}

/// The immutable effective configuration snapshot. Rebuilt in whole on
/// SIGHUP, never mutated in place.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub config_path: PathBuf,
    pub http_port: Option<ServerUrl>,
    pub sockchmod: u32,
    pub sockchown: Option<(String, Option<String>)>,
    pub umask: u32,
    pub logfile: PathBuf,
    pub logfile_maxbytes: u64,
    pub logfile_backups: u32,
    pub loglevel: LogLevel,
    pub pidfile: PathBuf,
    pub identifier: String,
    pub nodaemon: bool,
    pub minfds: u64,
    pub minprocs: u64,
    pub backofflimit: u32,
    pub forever: bool,
    pub nocleanup: bool,
    pub http_username: Option<String>,
    pub http_password: Option<String>,
    pub childlogdir: PathBuf,
    pub user: Option<String>,
    pub directory: Option<PathBuf>,
    pub programs: Vec<ProcessConfig>,
    pub ctl: CtlConfig,
}

// -------- value datatypes --------

pub fn boolean(s: &str) -> anyhow::Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(cfg_err(format!("not a boolean: {other:?}"))),
    }
}

/// Integer with optional KB/MB/GB suffix, case-insensitive.
pub fn byte_size(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    let lower = t.to_ascii_lowercase();
    let (num, mult) = if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024u64)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    let v: u64 = num
        .trim()
        .parse()
        .map_err(|e| cfg_err(format!("invalid byte size {s:?}: {e}")))?;
    Ok(v * mult)
}

pub fn octal(s: &str) -> anyhow::Result<u32> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| cfg_err(format!("invalid octal value {s:?}: {e}")))
}

pub fn list_of_ints(s: &str) -> anyhow::Result<Vec<i32>> {
    s.split(',')
        .map(|p| {
            p.trim()
                .parse::<i32>()
                .map_err(|e| cfg_err(format!("invalid exit code list {s:?}: {e}")))
        })
        .collect()
}

/// Stop signals are restricted to the set a supervisor can meaningfully
/// deliver; anything else is a config error.
pub fn stop_signal(s: &str) -> anyhow::Result<Signal> {
    let t = s.trim().to_ascii_uppercase();
    let t = t.strip_prefix("SIG").unwrap_or(&t);
    match t {
        "TERM" => Ok(Signal::SIGTERM),
        "HUP" => Ok(Signal::SIGHUP),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        other => Err(cfg_err(format!(
            "unsupported stopsignal {other:?} (use TERM, HUP, INT, QUIT, KILL, USR1 or USR2)"
        ))),
    }
}

fn resolve_against(base: &Path, p: PathBuf) -> PathBuf {
    if p.is_relative() {
        base.join(p)
    } else {
        p
    }
}

// -------- loading --------

/// Merge CLI flags and the parsed INI file into an effective snapshot.
pub fn load(args: &Args) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| cfg_err(format!("could not read config file {}: {e}", args.config.display())))?;
    load_from_str(&raw, &args.config, args)
}

pub fn load_from_str(raw: &str, config_path: &Path, args: &Args) -> anyhow::Result<ServerConfig> {
    let ini = Ini::load_from_str(raw)
        .map_err(|e| cfg_err(format!("could not parse {}: {e}", config_path.display())))?;

    let sd = ini
        .section(Some("supervisord"))
        .ok_or_else(|| cfg_err(format!("{} does not include a [supervisord] section", config_path.display())))?;

    let get = |key: &str| sd.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let base = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let http_port = match args.http_port.clone().or_else(|| get("http_port")) {
        Some(s) => Some(ServerUrl::parse(&s)?),
        None => None,
    };

    let sockchmod = match get("sockchmod") {
        Some(s) => octal(&s)?,
        None => 0o700,
    };
    let sockchown = get("sockchown").map(|s| {
        let mut it = s.splitn(2, '.');
        let user = it.next().unwrap_or_default().to_string();
        let group = it.next().map(|g| g.to_string());
        (user, group)
    });

    let umask = match args.umask.clone().or_else(|| get("umask")) {
        Some(s) => octal(&s)?,
        None => 0o022,
    };

    let logfile = resolve_against(
        &base,
        args.logfile
            .clone()
            .or_else(|| get("logfile").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("procwarden.log")),
    );
    let logfile_maxbytes = match args.logfile_maxbytes.clone().or_else(|| get("logfile_maxbytes")) {
        Some(s) => byte_size(&s)?,
        None => 50 * 1024 * 1024,
    };
    let logfile_backups = match args.logfile_backups.or(get("logfile_backups").map(|s| s.parse()).transpose()
        .map_err(|e| cfg_err(format!("invalid logfile_backups: {e}")))?)
    {
        Some(n) => n,
        None => 10,
    };
    let loglevel = match args.loglevel.clone().or_else(|| get("loglevel")) {
        Some(s) => s
            .parse::<LogLevel>()
            .map_err(|e| cfg_err(format!("invalid loglevel {s:?}: {e}")))?,
        None => LogLevel::Info,
    };
    let pidfile = resolve_against(
        &base,
        args.pidfile
            .clone()
            .or_else(|| get("pidfile").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("procwarden.pid")),
    );
    let identifier = args
        .identifier
        .clone()
        .or_else(|| get("identifier"))
        .unwrap_or_else(|| "procwarden".to_string());
    let nodaemon = args.nodaemon
        || match get("nodaemon") {
            Some(s) => boolean(&s)?,
            None => false,
        };
    let minfds = match args.minfds.or(get("minfds").map(|s| s.parse()).transpose()
        .map_err(|e| cfg_err(format!("invalid minfds: {e}")))?)
    {
        Some(n) => n,
        None => 1024,
    };
    let minprocs = match args.minprocs.or(get("minprocs").map(|s| s.parse()).transpose()
        .map_err(|e| cfg_err(format!("invalid minprocs: {e}")))?)
    {
        Some(n) => n,
        None => 200,
    };
    let backofflimit = match args.backofflimit.or(get("backofflimit").map(|s| s.parse()).transpose()
        .map_err(|e| cfg_err(format!("invalid backofflimit: {e}")))?)
    {
        Some(n) => n,
        None => 3,
    };
    let forever = args.forever
        || match get("forever") {
            Some(s) => boolean(&s)?,
            None => false,
        };
    let nocleanup = args.nocleanup
        || match get("nocleanup") {
            Some(s) => boolean(&s)?,
            None => false,
        };

    let http_username = args.http_username.clone().or_else(|| get("http_username"));
    let http_password = args.http_password.clone().or_else(|| get("http_password"));
    if http_username.is_some() != http_password.is_some() {
        return Err(cfg_err(
            "http_username and http_password must be specified together",
        ));
    }

    let childlogdir = resolve_against(
        &base,
        args.childlogdir
            .clone()
            .or_else(|| get("childlogdir").map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir),
    );
    let user = args.user.clone().or_else(|| get("user"));
    let directory = args
        .directory
        .clone()
        .or_else(|| get("directory").map(PathBuf::from))
        .map(|p| resolve_against(&base, p));

    let programs = programs_from_ini(&ini, &base)?;

    let ctl = match ini.section(Some("supervisorctl")) {
        Some(sc) => CtlConfig {
            serverurl: sc.get("serverurl").map(str::to_string),
            username: sc.get("username").map(str::to_string),
            password: sc.get("password").map(str::to_string),
            prompt: sc.get("prompt").unwrap_or("procwarden").to_string(),
        },
        None => CtlConfig {
            prompt: "procwarden".to_string(),
            ..CtlConfig::default()
        },
    };

    Ok(ServerConfig {
        config_path: config_path.to_path_buf(),
        http_port,
        sockchmod,
        sockchown,
        umask,
        logfile,
        logfile_maxbytes,
        logfile_backups,
        loglevel,
        pidfile,
        identifier,
        nodaemon,
        minfds,
        minprocs,
        backofflimit,
        forever,
        nocleanup,
        http_username,
        http_password,
        childlogdir,
        user,
        directory,
        programs,
        ctl,
    })
}

fn programs_from_ini(ini: &Ini, base: &Path) -> anyhow::Result<Vec<ProcessConfig>> {
    let mut programs: Vec<ProcessConfig> = Vec::new();
    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        let Some(name) = section.strip_prefix("program:") else { continue };
        let name = name.trim();
        if name.is_empty() {
            return Err(cfg_err("program section with an empty name"));
        }
        if programs.iter().any(|p| p.name == name) {
            return Err(cfg_err(format!("duplicate program section: {name:?}")));
        }
        let get = |key: &str| props.get(key).map(str::trim).filter(|v| !v.is_empty());

        let command = get("command")
            .ok_or_else(|| cfg_err(format!("program section {name:?} does not specify a command")))?
            .to_string();
        // Fail at load time, not at first spawn.
        let argv = shell_words::split(&command)
            .map_err(|e| cfg_err(format!("program {name:?}: unparseable command {command:?}: {e}")))?;
        if argv.is_empty() {
            return Err(cfg_err(format!("program {name:?}: empty command")));
        }

        let priority = match get("priority") {
            Some(s) => s
                .parse()
                .map_err(|e| cfg_err(format!("program {name:?}: invalid priority: {e}")))?,
            None => 999,
        };
        let autostart = match get("autostart") {
            Some(s) => boolean(s)?,
            None => true,
        };
        let autorestart = match get("autorestart") {
            Some(s) => boolean(s)?,
            None => true,
        };
        let exitcodes = match get("exitcodes") {
            Some(s) => list_of_ints(s)?,
            None => vec![0, 2],
        };
        let stopsignal = match get("stopsignal") {
            Some(s) => stop_signal(s)?,
            None => Signal::SIGTERM,
        };
        let user = get("user").map(str::to_string);
        let log_stderr = match get("log_stderr") {
            Some(s) => boolean(s)?,
            None => false,
        };
        let logfile = match get("logfile") {
            Some("AUTO") | None => LogPolicy::Auto,
            Some("NONE") | Some("OFF") => LogPolicy::None,
            Some(p) => LogPolicy::Path(resolve_against(base, PathBuf::from(p))),
        };
        let logfile_maxbytes = match get("logfile_maxbytes") {
            Some(s) => byte_size(s)?,
            None => 5 * 1024 * 1024,
        };
        let logfile_backups = match get("logfile_backups") {
            Some(s) => s
                .parse()
                .map_err(|e| cfg_err(format!("program {name:?}: invalid logfile_backups: {e}")))?,
            None => 1,
        };
        let startsecs = match get("startsecs") {
            Some(s) => s
                .parse()
                .map_err(|e| cfg_err(format!("program {name:?}: invalid startsecs: {e}")))?,
            None => 1,
        };
        let stopwaitsecs = match get("stopwaitsecs") {
            Some(s) => s
                .parse()
                .map_err(|e| cfg_err(format!("program {name:?}: invalid stopwaitsecs: {e}")))?,
            None => 10,
        };

        programs.push(ProcessConfig {
            name: name.to_string(),
            command,
            priority,
            autostart,
            autorestart,
            exitcodes,
            stopsignal,
            user,
            log_stderr,
            logfile,
            logfile_maxbytes,
            logfile_backups,
            startsecs,
            stopwaitsecs,
        });
    }
    Ok(programs)
}

// -------- resource preconditions --------

/// Enforce minfds/minprocs. The soft limit is raised toward the hard limit
/// where possible; an unreachable minimum is fatal (exit code 3).
pub fn enforce_rlimits(cfg: &ServerConfig) -> anyhow::Result<()> {
    enforce_one(Resource::RLIMIT_NOFILE, cfg.minfds, "minfds", "file descriptors")?;
    enforce_one(Resource::RLIMIT_NPROC, cfg.minprocs, "minprocs", "processes")?;
    Ok(())
}

fn enforce_one(res: Resource, min: u64, option: &str, what: &str) -> anyhow::Result<()> {
    let (soft, hard) = getrlimit(res).context("getrlimit")?;
    if soft >= min {
        return Ok(());
    }
    if hard >= min {
        setrlimit(res, min, hard).context("setrlimit")?;
        return Ok(());
    }
    Err(anyhow::Error::new(ResourceError(format!(
        "the hard limit on {what} ({hard}) is below the configured {option} minimum ({min}); \
         raise the system limit or lower {option}"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pw::cli::Args;

    const MINIMAL: &str = "\
[supervisord]
logfile = daemon.log
pidfile = daemon.pid

[program:web]
command = /bin/sleep 60
priority = 10

[program:worker]
command = sh -c 'echo hi'
autostart = false
exitcodes = 0,1,2
stopsignal = INT
logfile = NONE
";

    fn load_minimal() -> ServerConfig {
        let args = Args::defaults_for("/etc/pw/procwarden.conf");
        load_from_str(MINIMAL, Path::new("/etc/pw/procwarden.conf"), &args).unwrap()
    }

    #[test]
    fn parses_supervisord_section_with_defaults() {
        let cfg = load_minimal();
        assert_eq!(cfg.logfile, PathBuf::from("/etc/pw/daemon.log"));
        assert_eq!(cfg.pidfile, PathBuf::from("/etc/pw/daemon.pid"));
        assert_eq!(cfg.logfile_maxbytes, 50 * 1024 * 1024);
        assert_eq!(cfg.logfile_backups, 10);
        assert_eq!(cfg.backofflimit, 3);
        assert!(!cfg.forever);
        assert_eq!(cfg.umask, 0o022);
        assert_eq!(cfg.identifier, "procwarden");
        assert!(cfg.http_port.is_none());
    }

    #[test]
    fn parses_program_sections() {
        let cfg = load_minimal();
        assert_eq!(cfg.programs.len(), 2);
        let web = cfg.programs.iter().find(|p| p.name == "web").unwrap();
        assert_eq!(web.priority, 10);
        assert!(web.autostart);
        assert_eq!(web.logfile, LogPolicy::Auto);
        assert_eq!(web.exitcodes, vec![0, 2]);
        assert_eq!(web.startsecs, 1);
        assert_eq!(web.stopwaitsecs, 10);

        let worker = cfg.programs.iter().find(|p| p.name == "worker").unwrap();
        assert!(!worker.autostart);
        assert_eq!(worker.exitcodes, vec![0, 1, 2]);
        assert_eq!(worker.stopsignal, Signal::SIGINT);
        assert_eq!(worker.logfile, LogPolicy::None);
    }

    #[test]
    fn cli_flags_override_config() {
        let mut args = Args::defaults_for("/etc/pw/procwarden.conf");
        args.logfile = Some(PathBuf::from("/var/log/other.log"));
        args.backofflimit = Some(9);
        args.forever = true;
        let cfg = load_from_str(MINIMAL, Path::new("/etc/pw/procwarden.conf"), &args).unwrap();
        assert_eq!(cfg.logfile, PathBuf::from("/var/log/other.log"));
        assert_eq!(cfg.backofflimit, 9);
        assert!(cfg.forever);
    }

    #[test]
    fn missing_supervisord_section_is_a_config_error() {
        let args = Args::defaults_for("x.conf");
        let err = load_from_str("[program:a]\ncommand=/bin/true\n", Path::new("x.conf"), &args)
            .unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn program_without_command_is_rejected() {
        let args = Args::defaults_for("x.conf");
        let err = load_from_str("[supervisord]\n[program:a]\npriority=1\n", Path::new("x.conf"), &args)
            .unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn duplicate_program_names_are_rejected() {
        let args = Args::defaults_for("x.conf");
        let raw = "[supervisord]\n[program:a]\ncommand=/bin/true\n[program: a]\ncommand=/bin/false\n";
        assert!(load_from_str(raw, Path::new("x.conf"), &args).is_err());
    }

    #[test]
    fn username_requires_password() {
        let args = Args::defaults_for("x.conf");
        let raw = "[supervisord]\nhttp_username=u\n";
        assert!(load_from_str(raw, Path::new("x.conf"), &args).is_err());
    }

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(byte_size("1024").unwrap(), 1024);
        assert_eq!(byte_size("1KB").unwrap(), 1024);
        assert_eq!(byte_size("5mb").unwrap(), 5 * 1024 * 1024);
        assert_eq!(byte_size("2Gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(byte_size("tenmb").is_err());
    }

    #[test]
    fn octal_umask() {
        assert_eq!(octal("022").unwrap(), 0o022);
        assert_eq!(octal("0o700").unwrap(), 0o700);
        assert!(octal("9z").is_err());
    }

    #[test]
    fn stop_signal_names() {
        assert_eq!(stop_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(stop_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
        assert_eq!(stop_signal("kill").unwrap(), Signal::SIGKILL);
        assert!(stop_signal("STOP").is_err());
    }

    #[test]
    fn server_url_forms() {
        assert_eq!(
            ServerUrl::parse("127.0.0.1:9001").unwrap(),
            ServerUrl::Tcp("127.0.0.1:9001".parse().unwrap())
        );
        assert_eq!(
            ServerUrl::parse("9001").unwrap(),
            ServerUrl::Tcp("127.0.0.1:9001".parse().unwrap())
        );
        assert_eq!(
            ServerUrl::parse("/run/pw.sock").unwrap(),
            ServerUrl::Unix(PathBuf::from("/run/pw.sock"))
        );
        assert!(ServerUrl::parse("not an address").is_err());
    }

    #[test]
    fn crlf_config_parses() {
        let args = Args::defaults_for("x.conf");
        let raw = "[supervisord]\r\nloglevel = debug\r\n\r\n[program:a]\r\ncommand = /bin/true\r\n";
        let cfg = load_from_str(raw, Path::new("x.conf"), &args).unwrap();
        assert_eq!(cfg.loglevel, LogLevel::Debug);
        assert_eq!(cfg.programs.len(), 1);
    }
}
