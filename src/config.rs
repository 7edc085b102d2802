use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::cache::DnsCache;
use crate::handler::{Group, HandlerState};
use crate::hosts::{FileReader, HostsReader, StaticReader};
use crate::ipset::{AddressSet, IpsetCmd, RamSet};
use crate::matcher::DomainMatcher;
use crate::upstream::{Caller, Dialer, DohCaller, DotCaller, PlainProto, TcpCaller, UdpCaller};

#[derive(Debug, Clone, Deserialize)]
pub struct Conf {
    /// 监听地址，缺省 0.0.0.0:5353，避免 1024 以下端口权限问题。
    #[serde(default = "default_listen")]
    pub listen: String,
    /// GFWList 格式的规则文件路径。
    #[serde(default = "default_gfwlist")]
    pub gfwlist: String,
    /// CN IP 段列表路径（每行一个 CIDR）。
    #[serde(default = "default_cnip")]
    pub cnip: String,
    /// 内联 hosts 映射：域名 → 地址。
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// 额外的 hosts 格式文件。
    #[serde(default)]
    pub hosts_files: Vec<String>,
    /// hosts 记录的 TTL（秒）。
    #[serde(default = "default_hosts_ttl")]
    pub hosts_ttl: u32,
    #[serde(default)]
    pub cache: CacheConf,
    /// 域名组定义；`clean` 与 `dirty` 两组必须存在。
    #[serde(default)]
    pub groups: HashMap<String, GroupConf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConf {
    #[serde(default = "default_cache_size")]
    pub size: u64,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u64,
    /// 负缓存 TTL（秒），0 表示不缓存空响应。
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            negative_ttl: default_negative_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConf {
    /// 普通 DNS 端点：`ip[:port][/udp|/tcp]`。
    #[serde(default)]
    pub dns: Vec<String>,
    /// DoT 端点：`ip[:port][@server_name]`。
    #[serde(default)]
    pub dot: Vec<String>,
    /// DoH URL。
    #[serde(default)]
    pub doh: Vec<String>,
    /// 组内所有请求经过的 SOCKS5 代理（host:port）。
    #[serde(default)]
    pub socks5: Option<String>,
    /// 解析结果写入的 ipset 名称。
    #[serde(default)]
    pub ipset: Option<String>,
    /// ipset 条目超时（秒），0 表示不带超时。
    #[serde(default)]
    pub ipset_timeout: u32,
    /// 规则列表文件，命中即由本组解析。
    #[serde(default)]
    pub rules: Option<String>,
    /// 组内并发请求所有上游，取最先返回的可用响应。
    #[serde(default)]
    pub concurrent: bool,
    /// 单次上游查询超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GroupConf {
    fn default() -> Self {
        Self {
            dns: Vec::new(),
            dot: Vec::new(),
            doh: Vec::new(),
            socks5: None,
            ipset: None,
            ipset_timeout: 0,
            rules: None,
            concurrent: false,
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_gfwlist() -> String {
    "gfwlist.txt".to_string()
}

fn default_cnip() -> String {
    "cnip.txt".to_string()
}

fn default_hosts_ttl() -> u32 {
    3600
}

fn default_cache_size() -> u64 {
    4096
}

fn default_min_ttl() -> u64 {
    60
}

fn default_max_ttl() -> u64 {
    86400
}

fn default_negative_ttl() -> u64 {
    60
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Conf> {
    let path = path.as_ref();
    let text =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Assemble the runtime state from a parsed configuration: load the
/// rule and ip lists, build hosts readers and group callers, and
/// validate the result. Any failure here is fatal to the (re)load, not
/// to an already-running server.
pub fn build_state(conf: &Conf) -> Result<HandlerState> {
    ensure!(
        conf.cache.min_ttl <= conf.cache.max_ttl,
        "cache.min_ttl must not exceed cache.max_ttl"
    );
    let cache = Arc::new(DnsCache::new(
        conf.cache.size,
        Duration::from_secs(conf.cache.min_ttl),
        Duration::from_secs(conf.cache.max_ttl),
        Duration::from_secs(conf.cache.negative_ttl),
    ));

    let gfwlist = Arc::new(
        DomainMatcher::from_file(&conf.gfwlist)
            .with_context(|| format!("load gfwlist {}", conf.gfwlist))?,
    );
    if gfwlist.is_empty() {
        warn!(path = %conf.gfwlist, "gfwlist holds no usable rules");
    }
    let cnip = Arc::new(
        RamSet::from_file(&conf.cnip).with_context(|| format!("load cnip {}", conf.cnip))?,
    );
    if cnip.is_empty() {
        warn!(path = %conf.cnip, "cnip list holds no ranges, clean answers with addresses will all be rejected");
    }

    let mut hosts: Vec<Arc<dyn HostsReader>> = Vec::new();
    if !conf.hosts.is_empty() {
        hosts.push(Arc::new(StaticReader::new(&conf.hosts, conf.hosts_ttl)));
    }
    for path in &conf.hosts_files {
        match FileReader::from_file(path, conf.hosts_ttl) {
            Ok(reader) => hosts.push(Arc::new(reader)),
            Err(err) => warn!(file = %path, error = %err, "skipping hosts file"),
        }
    }

    let mut groups = BTreeMap::new();
    for (name, group_conf) in &conf.groups {
        let callers = build_callers(name, group_conf);
        let matcher = match &group_conf.rules {
            Some(path) => Arc::new(
                DomainMatcher::from_file(path)
                    .with_context(|| format!("load rules for group `{name}`"))?,
            ),
            None => Arc::new(DomainMatcher::empty()),
        };
        let ipset = group_conf
            .ipset
            .as_ref()
            .map(|set| Arc::new(IpsetCmd::new(set.clone(), group_conf.ipset_timeout)) as Arc<dyn AddressSet>);
        groups.insert(
            name.clone(),
            Arc::new(Group::new(
                name.clone(),
                callers,
                matcher,
                ipset,
                group_conf.concurrent,
            )),
        );
    }

    HandlerState::new(cache, gfwlist, cnip, hosts, groups)
}

/// Build the caller list for one group. Endpoints that fail to parse
/// are skipped with a warning; a group left without any caller is
/// rejected later by state validation.
fn build_callers(name: &str, conf: &GroupConf) -> Vec<Arc<dyn Caller>> {
    let timeout = Duration::from_millis(conf.timeout_ms);
    let dialer = match &conf.socks5 {
        Some(proxy) => Dialer::Socks5(proxy.clone()),
        None => Dialer::Direct,
    };

    let mut callers: Vec<Arc<dyn Caller>> = Vec::new();
    for endpoint in &conf.dns {
        match crate::upstream::parse_plain_endpoint(endpoint) {
            Ok((addr, PlainProto::Udp)) if dialer.is_direct() => {
                callers.push(Arc::new(UdpCaller::new(addr, timeout)));
            }
            Ok((addr, _)) => {
                // socks5 carries no udp associate here; proxied udp
                // endpoints degrade to tcp through the proxy
                callers.push(Arc::new(TcpCaller::new(addr, dialer.clone(), timeout)));
            }
            Err(err) => {
                warn!(group = %name, endpoint = %endpoint, error = %err, "skipping dns endpoint");
            }
        }
    }
    for endpoint in &conf.dot {
        match DotCaller::new(endpoint, dialer.clone(), timeout) {
            Ok(caller) => callers.push(Arc::new(caller)),
            Err(err) => {
                warn!(group = %name, endpoint = %endpoint, error = %err, "skipping dot endpoint");
            }
        }
    }
    for url in &conf.doh {
        match DohCaller::new(url, conf.socks5.as_deref(), timeout) {
            Ok(caller) => callers.push(Arc::new(caller)),
            Err(err) => warn!(group = %name, url = %url, error = %err, "skipping doh endpoint"),
        }
    }
    callers
}
