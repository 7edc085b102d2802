use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{ensure, Result};
use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::DnsCache;
use crate::hosts::HostsReader;
use crate::ipset::{AddressSet, RamSet};
use crate::matcher::DomainMatcher;
use crate::proto_utils;
use crate::upstream::Caller;

pub const CLEAN_GROUP: &str = "clean";
pub const DIRTY_GROUP: &str = "dirty";

/// A named upstream set: ordered callers, the domain rules that route
/// to it, an optional kernel address set for its answers, and the
/// fan-out mode. Immutable once constructed; replaced wholesale on
/// reload.
pub struct Group {
    name: String,
    callers: Vec<Arc<dyn Caller>>,
    matcher: Arc<DomainMatcher>,
    ipset: Option<Arc<dyn AddressSet>>,
    concurrent: bool,
}

impl Group {
    pub fn new(
        name: String,
        callers: Vec<Arc<dyn Caller>>,
        matcher: Arc<DomainMatcher>,
        ipset: Option<Arc<dyn AddressSet>>,
        concurrent: bool,
    ) -> Self {
        Self {
            name,
            callers,
            matcher,
            ipset,
            concurrent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, qname: &str) -> bool {
        self.matcher.matches(qname) == Some(true)
    }

    /// Ask the group's upstreams for an answer, returning the first
    /// acceptable response. With `ip_filter` set, a response is
    /// acceptable only if every A-record address lies inside the set; a
    /// response without A records passes vacuously, so an empty NOERROR
    /// answer from a filtered group is taken as final.
    ///
    /// Sequential groups try callers in configured order; concurrent
    /// groups race them all and take the first acceptable completion,
    /// aborting the rest. Transport errors are logged and count as "no
    /// answer" from that caller only.
    pub async fn call_dns(&self, request: &Message, ip_filter: Option<&RamSet>) -> Option<Message> {
        if self.callers.is_empty() {
            return None;
        }

        if !self.concurrent {
            for caller in &self.callers {
                match caller.call(request).await {
                    Ok(response) => {
                        if acceptable(&response, ip_filter) {
                            return Some(response);
                        }
                        debug!(
                            group = %self.name,
                            upstream = caller.endpoint(),
                            "answer rejected by ip filter"
                        );
                    }
                    Err(err) => error!(
                        group = %self.name,
                        upstream = caller.endpoint(),
                        error = %err,
                        "upstream query failed"
                    ),
                }
            }
            return None;
        }

        let mut tasks = JoinSet::new();
        for caller in &self.callers {
            let caller = Arc::clone(caller);
            let request = request.clone();
            tasks.spawn(async move {
                let outcome = caller.call(&request).await;
                (caller, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((caller, outcome)) = joined else {
                continue;
            };
            match outcome {
                // first acceptable completion wins; dropping the set
                // aborts the still-running callers
                Ok(response) if acceptable(&response, ip_filter) => return Some(response),
                Ok(_) => debug!(
                    group = %self.name,
                    upstream = caller.endpoint(),
                    "answer rejected by ip filter"
                ),
                Err(err) => error!(
                    group = %self.name,
                    upstream = caller.endpoint(),
                    error = %err,
                    "upstream query failed"
                ),
            }
        }
        None
    }

    /// Publish every A-record address of `response` into the group's
    /// address set, if one is configured. Failures are logged and do
    /// not affect the reply.
    pub async fn add_ipset(&self, response: Option<&Message>) {
        let (Some(set), Some(response)) = (self.ipset.as_deref(), response) else {
            return;
        };
        for ip in proto_utils::answer_ipv4s(response) {
            if let Err(err) = set.add(ip, set.timeout()).await {
                error!(group = %self.name, ip = %ip, error = %err, "address set insert failed");
            }
        }
    }
}

fn acceptable(response: &Message, ip_filter: Option<&RamSet>) -> bool {
    ip_filter.map_or(true, |set| proto_utils::all_in_range(response, set))
}

/// One immutable configuration snapshot. Every request resolves against
/// the snapshot that was current when it arrived; reloads install a new
/// snapshot without touching in-flight requests.
pub struct HandlerState {
    pub cache: Arc<DnsCache>,
    pub gfwlist: Arc<DomainMatcher>,
    pub cnip: Arc<RamSet>,
    pub hosts: Vec<Arc<dyn HostsReader>>,
    pub groups: BTreeMap<String, Arc<Group>>,
}

impl HandlerState {
    pub fn new(
        cache: Arc<DnsCache>,
        gfwlist: Arc<DomainMatcher>,
        cnip: Arc<RamSet>,
        hosts: Vec<Arc<dyn HostsReader>>,
        groups: BTreeMap<String, Arc<Group>>,
    ) -> Result<Self> {
        for reserved in [CLEAN_GROUP, DIRTY_GROUP] {
            ensure!(
                groups.contains_key(reserved),
                "group table must define `{reserved}`"
            );
        }
        for (name, group) in &groups {
            ensure!(!group.callers.is_empty(), "group `{name}` has no upstreams");
        }
        Ok(Self {
            cache,
            gfwlist,
            cnip,
            hosts,
            groups,
        })
    }
}

/// Partial reload bundle: fields left as `None` keep their current
/// value.
#[derive(Default)]
pub struct StateUpdate {
    pub cache: Option<Arc<DnsCache>>,
    pub gfwlist: Option<Arc<DomainMatcher>>,
    pub cnip: Option<Arc<RamSet>>,
    pub hosts: Option<Vec<Arc<dyn HostsReader>>>,
    pub groups: Option<BTreeMap<String, Arc<Group>>>,
}

impl From<HandlerState> for StateUpdate {
    fn from(state: HandlerState) -> Self {
        Self {
            cache: Some(state.cache),
            gfwlist: Some(state.gfwlist),
            cnip: Some(state.cnip),
            hosts: Some(state.hosts),
            groups: Some(state.groups),
        }
    }
}

/// The request handler. Holds the current state behind an atomic swap;
/// `serve` pins a snapshot for the lifetime of one request.
pub struct Handler {
    state: ArcSwap<HandlerState>,
}

impl Handler {
    pub fn new(state: HandlerState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
        }
    }

    pub fn current(&self) -> Arc<HandlerState> {
        self.state.load_full()
    }

    /// Merge `update` over the current state, validate the result, and
    /// swap it in. On error the previous state keeps serving.
    pub fn apply_update(&self, update: StateUpdate) -> Result<()> {
        let current = self.state.load_full();
        let next = HandlerState::new(
            update.cache.unwrap_or_else(|| current.cache.clone()),
            update.gfwlist.unwrap_or_else(|| current.gfwlist.clone()),
            update.cnip.unwrap_or_else(|| current.cnip.clone()),
            update.hosts.unwrap_or_else(|| current.hosts.clone()),
            update.groups.unwrap_or_else(|| current.groups.clone()),
        )?;
        self.state.store(Arc::new(next));
        Ok(())
    }

    /// Resolve one request. Returns the reply to write, or `None` when
    /// the query is dropped (malformed, or no path produced an
    /// acceptable answer) — the client is left to time out.
    pub async fn serve(&self, request: &Message, client: IpAddr) -> Option<Message> {
        // Pin the snapshot for the whole request, upstream I/O included.
        let state = self.state.load_full();

        if request.queries().len() != 1 {
            warn!(
                client = %client,
                questions = request.queries().len(),
                "dropping request without exactly one question"
            );
            return None;
        }
        let qname = request.queries()[0].name().to_string().to_ascii_lowercase();

        if let Some(mut reply) = hit_hosts(&state, request) {
            info!(qname = %qname, client = %client, "hit hosts");
            proto_utils::set_reply(&mut reply, request);
            return Some(reply);
        }

        if let Some(mut reply) = state.cache.get(request) {
            info!(qname = %qname, client = %client, "hit cache");
            proto_utils::set_reply(&mut reply, request);
            return Some(reply);
        }

        let (group, reply) = resolve(&state, request, &qname, client).await;
        state.cache.set(request, reply.as_ref());
        if let Some(group) = &group {
            group.add_ipset(reply.as_ref()).await;
        }

        let mut reply = reply?;
        proto_utils::set_reply(&mut reply, request);
        Some(reply)
    }
}

/// The upstream decision chain: rule-matched groups first, then the
/// clean group filtered by the trusted ranges, then — only for
/// blocklisted names — the dirty group unfiltered.
async fn resolve(
    state: &HandlerState,
    request: &Message,
    qname: &str,
    client: IpAddr,
) -> (Option<Arc<Group>>, Option<Message>) {
    for (name, group) in &state.groups {
        if name == CLEAN_GROUP || name == DIRTY_GROUP {
            continue;
        }
        if group.matches(qname) {
            info!(qname = %qname, client = %client, group = %group.name(), "match by rules");
            let reply = group.call_dns(request, None).await;
            return (Some(group.clone()), reply);
        }
    }

    let clean = state.groups[CLEAN_GROUP].clone();
    let reply = clean.call_dns(request, Some(&state.cnip)).await;
    if reply.is_some() {
        info!(qname = %qname, client = %client, group = CLEAN_GROUP, "cn or empty answer");
        return (Some(clean), reply);
    }

    if state.gfwlist.matches(qname) != Some(true) {
        info!(qname = %qname, client = %client, "no trusted answer, not on the blocklist");
        return (Some(clean), None);
    }

    let dirty = state.groups[DIRTY_GROUP].clone();
    info!(qname = %qname, client = %client, group = DIRTY_GROUP, "match blocklist");
    let reply = dirty.call_dns(request, None).await;
    (Some(dirty), reply)
}

/// Answer from the hosts readers, if any covers the name. Only A/AAAA
/// questions are looked up; the name is tried as queried (with the
/// root dot) and once more without it.
fn hit_hosts(state: &HandlerState, request: &Message) -> Option<Message> {
    let question = request.queries().first()?;
    let qtype = question.query_type();
    if qtype != RecordType::A && qtype != RecordType::AAAA {
        return None;
    }
    let want_ipv6 = qtype == RecordType::AAAA;
    let name = question.name().to_string();

    for reader in &state.hosts {
        let line = reader
            .record(&name, want_ipv6)
            .or_else(|| reader.record(name.trim_end_matches('.'), want_ipv6));
        let Some(line) = line else { continue };
        match proto_utils::parse_rr_line(&line) {
            Ok(record) => {
                let mut reply = Message::new();
                reply.add_answer(record);
                return Some(reply);
            }
            Err(err) => error!(name = %name, error = %err, "bad hosts record"),
        }
    }
    None
}
