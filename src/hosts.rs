use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// Static record source consulted before any upstream. Returns a
/// textual record line (`name ttl IN A addr`) or nothing; the caller
/// parses the line and decides what to do on parse failure.
pub trait HostsReader: Send + Sync {
    fn record(&self, name: &str, want_ipv6: bool) -> Option<String>;
}

/// Name → address tables shared by both reader kinds. Exact entries are
/// keyed by lowercased name as written; `*.suffix` entries match any
/// name below the suffix.
#[derive(Debug, Default)]
struct HostsTable {
    v4: HashMap<String, Ipv4Addr>,
    v6: HashMap<String, Ipv6Addr>,
    wild_v4: Vec<(String, Ipv4Addr)>,
    wild_v6: Vec<(String, Ipv6Addr)>,
}

impl HostsTable {
    fn insert(&mut self, name: &str, ip: IpAddr) {
        let name = name.to_ascii_lowercase();
        if let Some(suffix) = name.strip_prefix("*.") {
            let suffix = format!(".{suffix}");
            match ip {
                IpAddr::V4(v4) => self.wild_v4.push((suffix, v4)),
                IpAddr::V6(v6) => self.wild_v6.push((suffix, v6)),
            }
        } else {
            match ip {
                IpAddr::V4(v4) => {
                    self.v4.insert(name, v4);
                }
                IpAddr::V6(v6) => {
                    self.v6.insert(name, v6);
                }
            }
        }
    }

    fn lookup(&self, name: &str, want_ipv6: bool) -> Option<IpAddr> {
        let lookup = name.to_ascii_lowercase();
        if want_ipv6 {
            self.v6
                .get(&lookup)
                .copied()
                .or_else(|| {
                    self.wild_v6
                        .iter()
                        .find(|(suffix, _)| lookup.ends_with(suffix.as_str()))
                        .map(|(_, ip)| *ip)
                })
                .map(IpAddr::V6)
        } else {
            self.v4
                .get(&lookup)
                .copied()
                .or_else(|| {
                    self.wild_v4
                        .iter()
                        .find(|(suffix, _)| lookup.ends_with(suffix.as_str()))
                        .map(|(_, ip)| *ip)
                })
                .map(IpAddr::V4)
        }
    }

    fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty() && self.wild_v4.is_empty() && self.wild_v6.is_empty()
    }
}

fn format_record(name: &str, ttl: u32, ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{name} {ttl} IN A {v4}"),
        IpAddr::V6(v6) => format!("{name} {ttl} IN AAAA {v6}"),
    }
}

/// Reader over the inline `[hosts]` table of the configuration.
pub struct StaticReader {
    table: HostsTable,
    ttl: u32,
}

impl StaticReader {
    /// Entries with unparseable addresses are skipped with a warning so
    /// one typo does not take the whole table down.
    pub fn new(entries: &HashMap<String, String>, ttl: u32) -> Self {
        let mut table = HostsTable::default();
        for (name, addr) in entries {
            match addr.parse::<IpAddr>() {
                Ok(ip) => table.insert(name, ip),
                Err(_) => warn!(name = %name, addr = %addr, "skipping hosts entry with bad address"),
            }
        }
        Self { table, ttl }
    }
}

impl HostsReader for StaticReader {
    fn record(&self, name: &str, want_ipv6: bool) -> Option<String> {
        self.table
            .lookup(name, want_ipv6)
            .map(|ip| format_record(name, self.ttl, ip))
    }
}

/// Reader over a hosts(5)-format file: `address name [name…]` per line,
/// `#` starts a comment.
pub struct FileReader {
    table: HostsTable,
    ttl: u32,
}

impl FileReader {
    pub fn from_file(path: impl AsRef<Path>, ttl: u32) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read hosts file {}", path.display()))?;

        let mut table = HostsTable::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else { continue };
            let ip = match addr.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!(file = %path.display(), line = %line, "skipping hosts line with bad address");
                    continue;
                }
            };
            for name in fields {
                table.insert(name, ip);
            }
        }
        if table.is_empty() {
            warn!(file = %path.display(), "hosts file holds no usable entries");
        }
        Ok(Self { table, ttl })
    }
}

impl HostsReader for FileReader {
    fn record(&self, name: &str, want_ipv6: bool) -> Option<String> {
        self.table
            .lookup(name, want_ipv6)
            .map(|ip| format_record(name, self.ttl, ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn static_reader(entries: &[(&str, &str)]) -> StaticReader {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StaticReader::new(&map, 60)
    }

    #[test]
    fn exact_lookup_formats_a_record() {
        let reader = static_reader(&[("foo.test", "10.0.0.1")]);
        assert_eq!(
            reader.record("foo.test", false),
            Some("foo.test 60 IN A 10.0.0.1".to_string())
        );
        assert_eq!(reader.record("other.test", false), None);
    }

    #[test]
    fn family_mismatch_yields_nothing() {
        let reader = static_reader(&[("foo.test", "10.0.0.1"), ("six.test", "::1")]);
        assert_eq!(reader.record("foo.test", true), None);
        assert_eq!(
            reader.record("six.test", true),
            Some("six.test 60 IN AAAA ::1".to_string())
        );
        assert_eq!(reader.record("six.test", false), None);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let reader = static_reader(&[("Foo.Test", "10.0.0.1")]);
        assert!(reader.record("FOO.TEST", false).is_some());
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let reader = static_reader(&[("*.internal.test", "192.168.0.1")]);
        assert_eq!(
            reader.record("db.internal.test", false),
            Some("db.internal.test 60 IN A 192.168.0.1".to_string())
        );
        assert_eq!(reader.record("internal.test", false), None);
    }

    #[test]
    fn bad_inline_addresses_are_skipped() {
        let reader = static_reader(&[("ok.test", "10.0.0.1"), ("broken.test", "nonsense")]);
        assert!(reader.record("ok.test", false).is_some());
        assert_eq!(reader.record("broken.test", false), None);
    }

    #[test]
    fn file_reader_parses_hosts_format() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "10.0.0.1 foo.test bar.test # trailing").unwrap();
        writeln!(file, "::1 six.test").unwrap();
        writeln!(file, "not-an-ip broken.test").unwrap();

        let reader = FileReader::from_file(file.path(), 120).unwrap();
        assert_eq!(
            reader.record("bar.test", false),
            Some("bar.test 120 IN A 10.0.0.1".to_string())
        );
        assert_eq!(
            reader.record("six.test", true),
            Some("six.test 120 IN AAAA ::1".to_string())
        );
        assert_eq!(reader.record("broken.test", false), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(FileReader::from_file("/nonexistent/hosts", 60).is_err());
    }
}
