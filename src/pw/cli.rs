use clap::Parser;
use std::path::PathBuf;

/// Command-line surface of the daemon. Every flag overrides the matching
/// `[supervisord]` option; precedence is CLI > environment > config file >
/// built-in default.
#[derive(Debug, Clone, Parser)]
#[command(name = "procwarden", version, about = "procwarden -- run a set of applications as daemons")]
pub struct Args {
    /// Path to the INI configuration file
    #[arg(short = 'c', long = "configuration", env = "PROCWARDEN_CONF", default_value = "/etc/procwarden.conf")]
    pub config: PathBuf,

    /// Run in the foreground (same as 'nodaemon true' in the config file)
    #[arg(short = 'n', long = "nodaemon")]
    pub nodaemon: bool,

    /// Run the daemon as this UNIX user (requires starting as root)
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Octal umask applied to the daemon and its children
    #[arg(short = 'm', long = "umask")]
    pub umask: Option<String>,

    /// Directory to chdir to when daemonized
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<PathBuf>,

    /// Activity log path
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<PathBuf>,

    /// Activity log rotation threshold (bytes, optional KB/MB/GB suffix)
    #[arg(short = 'y', long = "logfile_maxbytes")]
    pub logfile_maxbytes: Option<String>,

    /// Number of rotated activity log backups to keep
    #[arg(short = 'z', long = "logfile_backups")]
    pub logfile_backups: Option<u32>,

    /// Activity log level (critical, error, warn, info, debug, trace)
    #[arg(short = 'e', long = "loglevel")]
    pub loglevel: Option<String>,

    /// Pidfile path
    #[arg(short = 'j', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Identifier for this daemon instance (brands AUTO child logs)
    #[arg(short = 'i', long = "identifier")]
    pub identifier: Option<String>,

    /// Directory for AUTO child process logs
    #[arg(short = 'q', long = "childlogdir")]
    pub childlogdir: Option<PathBuf>,

    /// Do not remove orphaned AUTO child logs at startup
    #[arg(short = 'k', long = "nocleanup")]
    pub nocleanup: bool,

    /// RPC listen address: host:port, or the absolute path of a UNIX socket
    #[arg(short = 'w', long = "http_port")]
    pub http_port: Option<String>,

    /// Username for HTTP basic auth on the RPC surface
    #[arg(short = 'g', long = "http_username")]
    pub http_username: Option<String>,

    /// Password for HTTP basic auth on the RPC surface
    #[arg(short = 'r', long = "http_password")]
    pub http_password: Option<String>,

    /// Minimum number of file descriptors required to start
    #[arg(short = 'a', long = "minfds")]
    pub minfds: Option<u64>,

    /// Minimum number of processes required to start
    #[arg(long = "minprocs")]
    pub minprocs: Option<u64>,

    /// Consecutive failed starts tolerated before a program goes FATAL
    #[arg(short = 'b', long = "backofflimit")]
    pub backofflimit: Option<u32>,

    /// Keep retrying failed starts forever (never FATAL from backoff)
    #[arg(short = 'f', long = "forever")]
    pub forever: bool,
}

impl Args {
    /// An argument set that touches nothing, for config-only construction.
    pub fn defaults_for(config: impl Into<PathBuf>) -> Self {
        let mut args = Self::parse_from(["procwarden"]);
        args.config = config.into();
        args
    }
}
