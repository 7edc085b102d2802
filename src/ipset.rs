use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;

/// In-memory IPv4 prefix set, compiled to sorted disjoint intervals.
/// Used as the trusted-range filter for clean-path answers.
#[derive(Debug, Default)]
pub struct RamSet {
    // inclusive (start, end) ranges, sorted and merged
    ranges: Vec<(u32, u32)>,
}

impl RamSet {
    /// Load a CIDR-per-line file; `#` starts a comment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("read ip list {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse ip list {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut nets = Vec::new();
        for (no, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let net: Ipv4Net = line
                .parse()
                .with_context(|| format!("bad cidr on line {}: {line:?}", no + 1))?;
            nets.push(net);
        }
        Ok(Self::from_nets(nets))
    }

    pub fn from_nets(nets: impl IntoIterator<Item = Ipv4Net>) -> Self {
        let mut ranges: Vec<(u32, u32)> = nets
            .into_iter()
            .map(|net| (u32::from(net.network()), u32::from(net.broadcast())))
            .collect();
        ranges.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                    *last_end = (*last_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        let idx = self.ranges.partition_point(|&(start, _)| start <= ip);
        idx > 0 && ip <= self.ranges[idx - 1].1
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Kernel-side address set: answers are published here so the firewall
/// can route matching destinations. Insertion failures must never fail
/// the request that triggered them.
#[async_trait]
pub trait AddressSet: Send + Sync {
    /// Default entry timeout in seconds; 0 means no timeout.
    fn timeout(&self) -> u32;

    async fn add(&self, ip: Ipv4Addr, ttl: u32) -> Result<()>;
}

/// AddressSet backed by the `ipset` binary. The set itself must exist
/// (created with timeout support when a timeout is configured);
/// `-exist` keeps re-inserts quiet.
pub struct IpsetCmd {
    name: String,
    timeout: u32,
}

impl IpsetCmd {
    pub fn new(name: String, timeout: u32) -> Self {
        Self { name, timeout }
    }
}

#[async_trait]
impl AddressSet for IpsetCmd {
    fn timeout(&self) -> u32 {
        self.timeout
    }

    async fn add(&self, ip: Ipv4Addr, ttl: u32) -> Result<()> {
        let ip = ip.to_string();
        let ttl = ttl.to_string();
        let mut args: Vec<&str> = vec!["add", &self.name, &ip];
        if self.timeout > 0 {
            args.extend(["timeout", ttl.as_str()]);
        }
        args.push("-exist");

        let output = Command::new("ipset")
            .args(&args)
            .output()
            .await
            .context("spawn ipset")?;
        if !output.status.success() {
            bail!(
                "ipset add {} {ip}: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
