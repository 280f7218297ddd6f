//! The routing engine: rule storage and lookup, the AUTO learning cache,
//! and rule-file hot reload.

mod cache;
mod domain;
mod ip;
mod parse;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::IpNet;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use cache::ProxyCache;
use domain::DomainNode;
use ip::IpTree;

use crate::error::Result;

/// The action a lookup resolves to. `None` means no rule matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rule {
    #[default]
    None,
    Proxy,
    Direct,
    Auto,
}

/// An immutable snapshot of the parsed rules.
#[derive(Debug)]
pub(crate) struct RuleSet {
    domains: DomainNode,
    ipv4: IpTree,
    ipv6: IpTree,
    other: Rule,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            domains: DomainNode::default(),
            ipv4: IpTree::default(),
            ipv6: IpTree::default(),
            other: Rule::Auto,
        }
    }
}

impl RuleSet {
    pub(crate) fn insert(&mut self, pattern: &str, rule: Rule) -> Result<()> {
        if pattern == "*" {
            self.other = rule;
        } else if let Ok(ip) = pattern.parse::<IpAddr>() {
            match ip {
                IpAddr::V4(v4) => self.ipv4.insert(&v4.octets(), 32, rule),
                IpAddr::V6(v6) => self.ipv6.insert(&v6.octets(), 128, rule),
            }
        } else if let Ok(net) = pattern.parse::<IpNet>() {
            let prefix = net.prefix_len() as usize;
            match net.network() {
                IpAddr::V4(v4) => self.ipv4.insert(&v4.octets(), prefix, rule),
                IpAddr::V6(v6) => self.ipv6.insert(&v6.octets(), prefix, rule),
            }
        } else {
            self.domains.insert(pattern, rule)?;
        }
        Ok(())
    }

    /// Raw lookup, without the AUTO cache upgrade.
    pub(crate) fn query(&self, addr: &str) -> Rule {
        let rule = match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => self.ipv4.lookup(&v4.octets()),
            Ok(IpAddr::V6(v6)) => self.ipv6.lookup(&v6.octets()),
            Err(_) => self.domains.lookup(addr),
        };
        if rule == Rule::None {
            self.other
        } else {
            rule
        }
    }
}

/// The routing engine. Lookups read a swappable snapshot; a file-backed
/// engine replaces the snapshot when the rule file is written.
pub struct Rules {
    snapshot: RwLock<Arc<RuleSet>>,
    cache: ProxyCache,
    source: Option<PathBuf>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Rules {
    /// Builds the engine from an inline pattern→action map.
    pub fn from_map(rules: &HashMap<String, String>) -> Result<Arc<Self>> {
        Self::build(parse::from_map(rules)?, None, Path::new(cache::CACHE_FILE))
    }

    /// Builds the engine from a rule file and watches it for changes.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let set = parse::from_file(&path)?;
        let rules = Self::build(set, Some(path.clone()), Path::new(cache::CACHE_FILE))?;
        rules.watch(&path);
        Ok(rules)
    }

    pub(crate) fn build(
        set: RuleSet,
        source: Option<PathBuf>,
        cache_path: &Path,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            snapshot: RwLock::new(Arc::new(set)),
            cache: ProxyCache::open(cache_path)?,
            source,
            watcher: Mutex::new(None),
        }))
    }

    fn watch(self: &Arc<Self>, path: &Path) {
        let weak = Arc::downgrade(self);
        let path_display = path.display().to_string();
        let result = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let Ok(event) = event else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let Some(rules) = weak.upgrade() else { return };
            tracing::info!("Reloading {}", path_display);
            rules.reload();
        });
        match result {
            Ok(mut watcher) => match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => *self.watcher.lock() = Some(watcher),
                Err(e) => tracing::warn!("Watching {} failed: {}", path.display(), e),
            },
            Err(e) => tracing::warn!("Watching {} failed: {}", path.display(), e),
        }
    }

    /// Re-parses the rule file and swaps the snapshot atomically. A parse
    /// failure keeps the previous snapshot.
    pub fn reload(&self) {
        let Some(path) = &self.source else { return };
        match parse::from_file(path) {
            Ok(set) => *self.snapshot.write() = Arc::new(set),
            Err(e) => tracing::error!("Reloading {} failed: {}", path.display(), e),
        }
    }

    /// Resolves the rule for `addr`, a hostname or IP literal exactly as the
    /// caller names it. An AUTO result is upgraded to PROXY when the address
    /// was learned to need the tunnel.
    pub fn get_rule(&self, addr: &str) -> Rule {
        let snapshot = self.snapshot.read().clone();
        let rule = snapshot.query(addr);
        if rule == Rule::Auto && self.cache.contains(addr) {
            return Rule::Proxy;
        }
        rule
    }

    /// Marks `addr` as needing the tunnel. Called after a direct dial failed
    /// under an AUTO rule.
    pub fn set_as_proxy(&self, addr: &str) {
        self.cache.insert(addr);
    }
}
