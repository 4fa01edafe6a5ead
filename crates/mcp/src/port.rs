//! Listening-port recovery.
//!
//! Before the tool server (re)starts, [`PortManager::ensure_available`] makes
//! sure its port is free, terminating a stale process that still holds it.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Overall time to wait for a port to free up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Delay between bind probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Finding and stopping the process that owns a port.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Pid listening on `port`, if one can be found.
    async fn owner_of(&self, port: u16) -> Option<u32>;

    /// Forcefully terminate `pid`. Returns whether the signal was delivered.
    async fn terminate(&self, pid: u32) -> bool;
}

/// [`ProcessControl`] through the platform's own tools: `lsof` and `kill` on
/// Unix, `netstat` and `taskkill` on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[async_trait]
impl ProcessControl for SystemProcesses {
    async fn owner_of(&self, port: u16) -> Option<u32> {
        let output = if cfg!(windows) {
            Command::new("netstat").arg("-ano").output().await
        } else {
            Command::new("lsof")
                .arg("-ti")
                .arg(format!("tcp:{port}"))
                .arg("-sTCP:LISTEN")
                .output()
                .await
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(port, error = %e, "could not list port owners");
                return None;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if cfg!(windows) {
            parse_netstat(&stdout, port)
        } else {
            parse_lsof(&stdout)
        }
    }

    async fn terminate(&self, pid: u32) -> bool {
        let status = if cfg!(windows) {
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .status()
                .await
        } else {
            Command::new("kill")
                .args(["-9", &pid.to_string()])
                .status()
                .await
        };
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(pid, error = %e, "could not run kill command");
                false
            }
        }
    }
}

fn parse_lsof(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|line| line.trim().parse().ok())
}

fn parse_netstat(stdout: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_, local, _, state, pid] if local.ends_with(&suffix) && *state == "LISTENING" => {
                pid.parse().ok()
            }
            _ => None,
        }
    })
}

/// Frees listening ports held by stale processes.
#[derive(Debug, Clone)]
pub struct PortManager<P = SystemProcesses> {
    host: IpAddr,
    control: P,
    wait: Duration,
    poll_interval: Duration,
}

impl PortManager<SystemProcesses> {
    pub fn new() -> Self {
        Self::with_control(SystemProcesses)
    }
}

impl Default for PortManager<SystemProcesses> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProcessControl> PortManager<P> {
    pub fn with_control(control: P) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control,
            wait: DEFAULT_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Interface the probe binds to.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Make sure `port` can be bound, terminating its current owner if needed.
    ///
    /// Never fails: returns `false` when the port is still taken after the
    /// wait, so the caller decides whether to go ahead.
    pub async fn ensure_available(&self, port: u16) -> bool {
        match self.probe(port).await {
            Probe::Free => return true,
            Probe::Unusable => return false,
            Probe::InUse => {}
        }

        match self.control.owner_of(port).await {
            Some(pid) if pid == std::process::id() => {
                warn!(port, pid, "port is held by this process; not terminating");
                return false;
            }
            Some(pid) => {
                info!(port, pid, "terminating process holding port");
                if !self.control.terminate(pid).await {
                    warn!(port, pid, "failed to terminate port owner");
                }
            }
            None => warn!(port, "port in use but owner not found"),
        }

        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            if let Probe::Free = self.probe(port).await {
                info!(port, "port released");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(port, wait_ms = self.wait.as_millis() as u64, "port still in use");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn probe(&self, port: u16) -> Probe {
        match TcpListener::bind(SocketAddr::new(self.host, port)).await {
            Ok(_listener) => Probe::Free,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, "port in use");
                Probe::InUse
            }
            Err(e) => {
                warn!(port, error = %e, "port probe failed");
                Probe::Unusable
            }
        }
    }
}

enum Probe {
    Free,
    InUse,
    Unusable,
}
