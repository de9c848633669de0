//! Wrapper around the platform traceroute binary.
//!
//! Builds the per-OS command line, streams stdout line by line, extracts
//! one hop per line, and gives up early after `giveup` consecutive
//! non-responding hops (terminating the child). Self-termination
//! (SIGKILL/SIGTERM) counts as success; any other non-zero exit raises a
//! [`TracerouteError`] carrying the command line and stderr.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use pathvis_common::models::Hop;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Child;

use crate::util::is_ipv6;

/// Probe protocols a traceroute implementation may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
    Gre,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Gre => "gre",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown traceroute protocol {0:?}")]
pub struct UnknownProtocol(String);

impl std::str::FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(Protocol::Icmp),
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "gre" => Ok(Protocol::Gre),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum TracerouteError {
    #[error("failed to start traceroute: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("unable to pipe traceroute stdout or stderr")]
    Pipe,
    #[error("error reading traceroute output: {0}")]
    Read(#[source] std::io::Error),
    #[error("command {cmdline:?} returned {status}, stderr: {stderr}")]
    Failed {
        cmdline: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// The traceroute flavor in use. Unknown systems get the BSD behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Bsd,
    Linux,
    Windows,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Bsd
        }
    }
}

/// Raw-socket privilege never changes while we run; probe it once.
static IS_PRIVILEGED: Lazy<bool> = Lazy::new(detect_privileges);

fn detect_privileges() -> bool {
    #[cfg(unix)]
    {
        let root = unsafe { libc::geteuid() } == 0;
        if root {
            tracing::debug!(target: "traceroute", "running as root, raw sockets available");
            return true;
        }
        if !cfg!(target_os = "linux") {
            return false;
        }
        traceroute_has_net_raw()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Linux capability probe: does the traceroute binary carry cap_net_raw?
#[cfg(unix)]
fn traceroute_has_net_raw() -> bool {
    let Some(binary) = find_in_path("traceroute") else {
        tracing::debug!(target: "traceroute", "could not locate traceroute binary");
        return false;
    };
    let binary = std::fs::canonicalize(&binary).unwrap_or(binary);
    match std::process::Command::new("/sbin/getcap")
        .arg("-r")
        .arg(&binary)
        .output()
    {
        Ok(output) => {
            let caps = String::from_utf8_lossy(&output.stdout);
            let privileged = caps.lines().any(|line| line.contains("cap_net_raw"));
            tracing::debug!(
                target: "traceroute",
                binary = %binary.display(),
                privileged,
                "getcap probe"
            );
            privileged
        }
        Err(e) => {
            tracing::debug!(
                target: "traceroute",
                binary = %binary.display(),
                error = %e,
                "getcap probe failed"
            );
            false
        }
    }
}

#[cfg(unix)]
fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// What each platform can probe with, per privilege and address family.
pub fn capabilities(platform: Platform, ipv6: bool, privileged: bool) -> BTreeSet<Protocol> {
    use Protocol::*;
    let base: &[Protocol] = match platform {
        Platform::Bsd => &[Icmp, Udp, Tcp, Gre],
        Platform::Linux if privileged => &[Icmp, Udp, Tcp],
        Platform::Linux => &[Udp],
        Platform::Windows => &[Icmp],
    };
    let mut set: BTreeSet<Protocol> = base.iter().copied().collect();
    if ipv6 {
        set.retain(|p| matches!(p, Icmp | Udp));
    }
    set
}

/// One traceroute invocation target. Holds the child-process slot so a
/// concurrent `kill()` can reach an in-flight probe.
pub struct Traceroute {
    platform: Platform,
    probe_timeout: u64,
    max_hops: usize,
    giveup: usize,
    child: Arc<Mutex<Option<Child>>>,
}

impl Traceroute {
    pub fn new(probe_timeout: u64, max_hops: usize, giveup: usize) -> Self {
        Self::for_platform(Platform::detect(), probe_timeout, max_hops, giveup)
    }

    pub fn for_platform(platform: Platform, probe_timeout: u64, max_hops: usize, giveup: usize) -> Self {
        Self {
            platform,
            probe_timeout,
            max_hops,
            giveup,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Protocols usable toward `host` given OS, privilege and family.
    pub fn capabilities_for_host(&self, host: &str) -> BTreeSet<Protocol> {
        capabilities(self.platform, is_ipv6(host), *IS_PRIVILEGED)
    }

    /// Terminate the in-flight probe, if any, unconditionally.
    pub fn kill(&self) {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = slot.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Run one trace and return the ordered hops.
    pub async fn trace(&self, host: &str, proto: Protocol) -> Result<Vec<Hop>, TracerouteError> {
        let argv = self.build_command(host, proto);
        let cmdline = argv.join(" ");
        tracing::debug!(target: "traceroute", cmd = %cmdline, "running traceroute");

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(TracerouteError::Spawn)?;
        let stdout = child.stdout.take().ok_or(TracerouteError::Pipe)?;
        let mut stderr = child.stderr.take().ok_or(TracerouteError::Pipe)?;
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);

        let mut scanner = OutputScanner::new(self.platform, self.giveup);
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if scanner.push(&line) == ScanStep::GiveUp {
                        tracing::warn!(
                            target: "traceroute",
                            giveup = self.giveup,
                            host,
                            "non-responding hops in a row, terminating trace"
                        );
                        self.kill();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.kill();
                    self.reap().await;
                    return Err(TracerouteError::Read(e));
                }
            }
        }

        let status = self.reap().await;
        let hops = scanner.into_hops();
        if let Some(status) = status {
            if !exit_ok(&status) {
                let mut message = String::new();
                let _ = stderr.read_to_string(&mut message).await;
                return Err(TracerouteError::Failed {
                    cmdline,
                    status,
                    stderr: message,
                });
            }
        }
        Ok(hops)
    }

    /// Wait for the stored child to exit and clear the slot.
    async fn reap(&self) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
                match slot.as_mut() {
                    None => return None,
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            slot.take();
                            return Some(status);
                        }
                        Ok(None) => {}
                        Err(_) => {
                            slot.take();
                            return None;
                        }
                    },
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Platform command line for one probe run.
    pub fn build_command(&self, host: &str, proto: Protocol) -> Vec<String> {
        let ipv6 = is_ipv6(host);
        match self.platform {
            Platform::Bsd => self.bsd_command(host, proto, ipv6),
            Platform::Linux => self.linux_command(host, proto, ipv6),
            Platform::Windows => self.windows_command(host, ipv6),
        }
    }

    fn bsd_command(&self, host: &str, proto: Protocol, ipv6: bool) -> Vec<String> {
        let mut cmd: Vec<String> = if ipv6 {
            let mut cmd = vec!["traceroute6".into(), "-n".into(), "-q1".into()];
            match proto {
                Protocol::Icmp => cmd.push("-I".into()),
                Protocol::Udp => {}
                other => tracing::warn!(
                    target: "traceroute",
                    proto = %other,
                    "protocol not supported for IPv6, defaulting to UDP"
                ),
            }
            cmd
        } else {
            vec![
                "traceroute".into(),
                "-n".into(),
                "-q1".into(),
                "-P".into(),
                proto.as_str().into(),
            ]
        };
        if self.probe_timeout > 0 {
            cmd.push("-w".into());
            cmd.push(self.probe_timeout.to_string());
        }
        if self.max_hops > 0 {
            cmd.push("-m".into());
            cmd.push(self.max_hops.to_string());
        }
        cmd.push(host.into());
        cmd
    }

    fn linux_command(&self, host: &str, proto: Protocol, ipv6: bool) -> Vec<String> {
        let family = if ipv6 { "-6" } else { "-4" };
        let mut cmd = vec!["traceroute".to_string(), family.to_string()];
        match proto {
            Protocol::Icmp => cmd.push("-I".into()),
            Protocol::Tcp => cmd.push("-T".into()),
            _ => {}
        }
        cmd.extend(["-n".into(), "-q1".into(), host.into()]);
        cmd
    }

    fn windows_command(&self, host: &str, ipv6: bool) -> Vec<String> {
        let family = if ipv6 { "/6" } else { "/4" };
        vec![
            "tracert".into(),
            family.into(),
            "/d".into(),
            "/h".into(),
            self.max_hops.to_string(),
            host.into(),
        ]
    }
}

/// True when the exit status means "completed or terminated by us".
fn exit_ok(status: &std::process::ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGKILL / SIGTERM: the early-stop heuristic or kill() fired.
        if matches!(status.signal(), Some(9) | Some(15)) {
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanStep {
    Continue,
    GiveUp,
}

/// Incremental stdout scanner: one hop per line, early stop after
/// `giveup` consecutive misses.
struct OutputScanner {
    platform: Platform,
    giveup: usize,
    header_pending: bool,
    starcount: usize,
    hops: Vec<Hop>,
}

impl OutputScanner {
    fn new(platform: Platform, giveup: usize) -> Self {
        Self {
            platform,
            giveup,
            // Linux prints a "traceroute to ..." header on stdout.
            header_pending: platform == Platform::Linux,
            starcount: 0,
            hops: Vec::new(),
        }
    }

    fn push(&mut self, line: &str) -> ScanStep {
        if self.header_pending {
            self.header_pending = false;
            return ScanStep::Continue;
        }
        let hop = match self.platform {
            Platform::Windows => parse_tracert_line(line),
            _ => parse_hop_line(line),
        };
        if hop.is_none() {
            self.starcount += 1;
        } else {
            self.starcount = 0;
        }
        self.hops.push(hop);
        if self.starcount == self.giveup {
            ScanStep::GiveUp
        } else {
            ScanStep::Continue
        }
    }

    fn into_hops(self) -> Vec<Hop> {
        self.hops
    }
}

/// Extract the hop address from output like:
/// ```text
///  1   *
///  2   192.0.2.1   0.312 ms
/// ```
fn parse_hop_line(line: &str) -> Hop {
    let ip = line.trim().split_whitespace().nth(1)?;
    if ip == "*" {
        return None;
    }
    Some(ip.to_string())
}

/// Extract the hop address from tracert output like:
/// ```text
/// 1<tab>1ms<tab>1ms<tab>1ms<tab>192.0.2.1
/// 2<tab>*<tab>*<tab>*<tab>Request timed out
/// ```
fn parse_tracert_line(line: &str) -> Hop {
    let ip = line.trim().split('\t').nth(4)?;
    if ip.starts_with("Request") {
        return None;
    }
    Some(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Protocol::*;

    #[test]
    fn capability_matrix() {
        assert_eq!(
            capabilities(Platform::Bsd, false, false),
            [Icmp, Udp, Tcp, Gre].into()
        );
        assert_eq!(
            capabilities(Platform::Bsd, false, true),
            [Icmp, Udp, Tcp, Gre].into()
        );
        assert_eq!(capabilities(Platform::Linux, false, false), [Udp].into());
        assert_eq!(
            capabilities(Platform::Linux, false, true),
            [Icmp, Udp, Tcp].into()
        );
        assert_eq!(capabilities(Platform::Windows, false, false), [Icmp].into());
        assert_eq!(capabilities(Platform::Windows, false, true), [Icmp].into());
    }

    #[test]
    fn capabilities_intersect_for_ipv6() {
        assert_eq!(capabilities(Platform::Bsd, true, false), [Icmp, Udp].into());
        assert_eq!(capabilities(Platform::Linux, true, true), [Icmp, Udp].into());
        assert_eq!(capabilities(Platform::Linux, true, false), [Udp].into());
        assert_eq!(capabilities(Platform::Windows, true, false), [Icmp].into());
    }

    #[test]
    fn bsd_command_lines() {
        let tr = Traceroute::for_platform(Platform::Bsd, 3, 64, 5);
        assert_eq!(
            tr.build_command("8.8.8.8", Icmp),
            ["traceroute", "-n", "-q1", "-P", "icmp", "-w", "3", "-m", "64", "8.8.8.8"]
        );
        assert_eq!(
            tr.build_command("2a04:b900::10", Icmp),
            ["traceroute6", "-n", "-q1", "-I", "-w", "3", "-m", "64", "2a04:b900::10"]
        );
        // Unsupported v6 protocol silently defaults to UDP flags.
        assert_eq!(
            tr.build_command("2a04:b900::10", Tcp),
            ["traceroute6", "-n", "-q1", "-w", "3", "-m", "64", "2a04:b900::10"]
        );
    }

    #[test]
    fn linux_command_lines() {
        let tr = Traceroute::for_platform(Platform::Linux, 3, 64, 5);
        assert_eq!(
            tr.build_command("8.8.8.8", Icmp),
            ["traceroute", "-4", "-I", "-n", "-q1", "8.8.8.8"]
        );
        assert_eq!(
            tr.build_command("8.8.8.8", Tcp),
            ["traceroute", "-4", "-T", "-n", "-q1", "8.8.8.8"]
        );
        assert_eq!(
            tr.build_command("8.8.8.8", Udp),
            ["traceroute", "-4", "-n", "-q1", "8.8.8.8"]
        );
        assert_eq!(
            tr.build_command("2a04:b900::10", Icmp),
            ["traceroute", "-6", "-I", "-n", "-q1", "2a04:b900::10"]
        );
    }

    #[test]
    fn windows_command_lines() {
        let tr = Traceroute::for_platform(Platform::Windows, 3, 64, 5);
        assert_eq!(
            tr.build_command("8.8.8.8", Icmp),
            ["tracert", "/4", "/d", "/h", "64", "8.8.8.8"]
        );
        assert_eq!(
            tr.build_command("2a04:b900::10", Icmp),
            ["tracert", "/6", "/d", "/h", "64", "2a04:b900::10"]
        );
    }

    #[test]
    fn hop_line_parsing() {
        assert_eq!(parse_hop_line(" 1   *"), None);
        assert_eq!(
            parse_hop_line(" 2   192.0.2.1   0.312 ms"),
            Some("192.0.2.1".to_string())
        );
        assert_eq!(parse_hop_line(""), None);
        assert_eq!(parse_hop_line(" 3"), None);
    }

    #[test]
    fn tracert_line_parsing() {
        assert_eq!(
            parse_tracert_line("1\t1ms\t1ms\t1ms\t192.0.2.1"),
            Some("192.0.2.1".to_string())
        );
        assert_eq!(parse_tracert_line("2\t*\t*\t*\tRequest timed out"), None);
        assert_eq!(parse_tracert_line("garbage"), None);
    }

    #[test]
    fn scanner_skips_linux_header() {
        let mut scanner = OutputScanner::new(Platform::Linux, 5);
        scanner.push("traceroute to 8.8.8.8 (8.8.8.8), 64 hops max, 60 byte packets");
        scanner.push(" 1  10.0.0.1  0.3 ms");
        assert_eq!(scanner.into_hops(), vec![Some("10.0.0.1".to_string())]);
    }

    #[test]
    fn scanner_gives_up_after_consecutive_misses() {
        let mut scanner = OutputScanner::new(Platform::Bsd, 3);
        assert_eq!(scanner.push(" 1  10.0.0.1  1 ms"), ScanStep::Continue);
        assert_eq!(scanner.push(" 2  *"), ScanStep::Continue);
        assert_eq!(scanner.push(" 3  *"), ScanStep::Continue);
        // A responding hop resets the run of misses.
        assert_eq!(scanner.push(" 4  10.0.0.2  1 ms"), ScanStep::Continue);
        assert_eq!(scanner.push(" 5  *"), ScanStep::Continue);
        assert_eq!(scanner.push(" 6  *"), ScanStep::Continue);
        assert_eq!(scanner.push(" 7  *"), ScanStep::GiveUp);
        let hops = scanner.into_hops();
        assert_eq!(hops.len(), 7);
        assert_eq!(hops[6], None);
    }
}
