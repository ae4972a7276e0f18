use std::net::SocketAddr;
use std::process::Command;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::error::Error;

/// Undoes what a firewall call installed. Called at most once.
pub type Revert = Box<dyn FnOnce() -> Result<()> + Send>;

pub trait Firewall: Send + Sync {
    /// Drop the RSTs the kernel would send from `src` to `dst` for a connection
    /// it knows nothing about. Packets carrying `exclude_mark` still go out.
    ///
    /// Must be safe to call concurrently for distinct pairs, and reverting one
    /// pair must leave the others in place.
    fn temp_drop_output_tcp_rst(&self, src: SocketAddr, dst: SocketAddr, exclude_mark: u32) -> Result<Revert>;
}

/// For hosts where something else already keeps the kernel quiet.
pub struct NoopFirewall;

impl Firewall for NoopFirewall {
    fn temp_drop_output_tcp_rst(&self, _src: SocketAddr, _dst: SocketAddr, _exclude_mark: u32) -> Result<Revert> {
        Ok(Box::new(|| Ok(())))
    }
}

/// Inserts one OUTPUT rule per pair with `iptables` / `ip6tables`.
pub struct Iptables;

fn rst_rule(src: SocketAddr, dst: SocketAddr, exclude_mark: u32) -> Vec<String> {
    vec![
        "OUTPUT".into(),
        "-p".into(), "tcp".into(),
        "--tcp-flags".into(), "RST".into(), "RST".into(),
        "-s".into(), src.ip().to_string(),
        "--sport".into(), src.port().to_string(),
        "-d".into(), dst.ip().to_string(),
        "--dport".into(), dst.port().to_string(),
        "-m".into(), "mark".into(), "!".into(), "--mark".into(), format!("{exclude_mark:#x}"),
        "-j".into(), "DROP".into(),
    ]
}

fn run(program: &str, action: &str, rule: &[String]) -> Result<()> {
    // -w: wait for the xtables lock, parallel probes race for it
    let output = Command::new(program)
        .arg("-w")
        .arg(action)
        .args(rule)
        .output()
        .with_context(|| format!("cannot run {program}"))?;
    if !output.status.success() {
        anyhow::bail!("{program} {action} failed: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

impl Firewall for Iptables {
    fn temp_drop_output_tcp_rst(&self, src: SocketAddr, dst: SocketAddr, exclude_mark: u32) -> Result<Revert> {
        let program = if src.is_ipv4() { "iptables" } else { "ip6tables" };
        let rule = rst_rule(src, dst, exclude_mark);
        run(program, "-I", &rule)?;
        debug!("Dropping outgoing RST {src} -> {dst}");
        Ok(Box::new(move || run(program, "-D", &rule)))
    }
}

/// Keeps the kernel's RSTs suppressed until dropped.
pub struct RstSuppression {
    revert: Option<Revert>,
    src: SocketAddr,
    dst: SocketAddr,
}

impl RstSuppression {
    pub fn install(firewall: &dyn Firewall, src: SocketAddr, dst: SocketAddr,
                   exclude_mark: u32) -> crate::error::Result<RstSuppression> {
        let revert = firewall.temp_drop_output_tcp_rst(src, dst, exclude_mark)
            .map_err(|e| Error::Firewall(e.into()))?;
        Ok(RstSuppression { revert: Some(revert), src, dst })
    }
}

impl Drop for RstSuppression {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            if let Err(e) = revert() {
                warn!("Failed to restore RSTs {} -> {}: {e:#}", self.src, self.dst);
            }
        }
    }
}
