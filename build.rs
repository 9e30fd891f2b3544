use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

// Assemble one human-readable build stamp here, so the daemon only has to
// surface it (banner, getSupervisorVersion) without any parsing at runtime.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // Reproducible builds pin the timestamp via SOURCE_DATE_EPOCH.
    let when = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| format!("source epoch {secs}"))
        .or_else(|| {
            run_trimmed("date", &["-u", "+%Y-%m-%d %H:%M:%S UTC"])
        })
        .unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("epoch {secs}")
        });

    let host = run_trimmed("uname", &["-n"]).unwrap_or_else(|| "unknown-host".to_string());

    println!("cargo:rustc-env=PROCWARDEN_BUILD_STAMP=built {when} on {host}");
}

fn run_trimmed(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
