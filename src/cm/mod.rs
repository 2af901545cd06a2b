//! Configuration manager: a small INI-style store of named *sets*, each
//! holding *domains* (`[section]` headers) of case-insensitive key/value
//! pairs.
//!
//! The on-disk format is deliberately simple:
//!
//! ```text
//! # comment
//! [domain]
//! key = value
//! another_key = value with spaces
//! ```
//!
//! Keys are matched case-insensitively and values are trimmed of
//! surrounding whitespace. The field delimiter (`=` above) is caller
//! supplied so the same parser serves files that use `:` or other
//! separators.
//!
//! Multiple sets can live in one [`ConfigManager`], addressed by name, so
//! a process can keep (for example) a `"defaults"` set and an
//! operator-supplied set and [`ConfigSet::merge`] the latter on top of
//! the former without clobbering values the operator never mentioned.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use parking_lot::RwLock as PRwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CmError {
    #[error("config set {0:?} already exists")]
    SetExists(String),
    #[error("config set {0:?} not found")]
    SetNotFound(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An ordered domain of case-insensitive key/value pairs. Insertion order
/// is preserved so [`Domain::write`] round-trips a file in a stable shape.
#[derive(Debug, Default, Clone)]
pub struct Domain {
    order: Vec<String>,
    entries: HashMap<String, String>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

impl Domain {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(&normalize_key(key)).map(String::as_str)
    }

    /// Insert or replace `key`. Always wins over an existing value.
    pub fn set(&mut self, key: &str, value: &str) {
        let norm = normalize_key(key);
        if !self.entries.contains_key(&norm) {
            self.order.push(norm.clone());
        }
        self.entries.insert(norm, value.trim().to_string());
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let norm = normalize_key(key);
        if self.entries.remove(&norm).is_some() {
            self.order.retain(|k| k != &norm);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.entries[k].as_str()))
    }
}

/// A named collection of domains.
#[derive(Debug, Default)]
pub struct ConfigSet {
    name: String,
    domains: PRwLock<HashMap<String, Domain>>,
    domain_order: PRwLock<Vec<String>>,
}

impl ConfigSet {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domains: PRwLock::new(HashMap::new()),
            domain_order: PRwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the domain if it doesn't exist, then set `key` = `value`
    /// inside it, unconditionally replacing any prior value.
    pub fn add_key(&self, domain: &str, key: &str, value: &str) {
        let mut domains = self.domains.write();
        let existed = domains.contains_key(domain);
        let entry = domains.entry(domain.to_string()).or_default();
        entry.set(key, value);
        drop(domains);
        if !existed {
            self.domain_order.write().push(domain.to_string());
        }
    }

    pub fn remove_key(&self, domain: &str, key: &str) -> bool {
        self.domains
            .write()
            .get_mut(domain)
            .map(|d| d.remove(key))
            .unwrap_or(false)
    }

    pub fn remove_domain(&self, domain: &str) -> bool {
        let removed = self.domains.write().remove(domain).is_some();
        if removed {
            self.domain_order.write().retain(|d| d != domain);
        }
        removed
    }

    pub fn lookup_value(&self, domain: &str, key: &str) -> Option<String> {
        self.domains
            .read()
            .get(domain)
            .and_then(|d| d.lookup(key))
            .map(str::to_string)
    }

    pub fn lookup_domain(&self, domain: &str) -> Option<Domain> {
        self.domains.read().get(domain).cloned()
    }

    pub fn clear(&self) {
        self.domains.write().clear();
        self.domain_order.write().clear();
    }

    /// Domains in insertion order.
    pub fn enumerate(&self) -> Vec<String> {
        self.domain_order.read().clone()
    }

    /// Parse `text` (using `delimiter` to split `key<delim>value` lines)
    /// and load it into this set. Existing domains/keys are replaced by
    /// whatever the text specifies; domains not mentioned are untouched.
    pub fn load_str(&self, text: &str, delimiter: char) {
        let mut current_domain = "default".to_string();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current_domain = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            let Some(idx) = line.find(delimiter) else {
                continue;
            };
            let (key, value) = line.split_at(idx);
            let value = &value[delimiter.len_utf8()..];
            self.add_key(&current_domain, key, value);
        }
    }

    pub fn load_file(&self, path: impl AsRef<Path>, delimiter: char) -> Result<(), CmError> {
        let path_ref = path.as_ref();
        let text = fs::read_to_string(path_ref).map_err(|source| CmError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        self.load_str(&text, delimiter);
        Ok(())
    }

    pub fn write_string(&self, delimiter: char) -> String {
        let mut out = String::new();
        for domain in self.domain_order.read().iter() {
            let domains = self.domains.read();
            let Some(d) = domains.get(domain) else {
                continue;
            };
            if d.is_empty() {
                continue;
            }
            out.push_str(&format!("[{domain}]\n"));
            for (k, v) in d.iter() {
                out.push_str(&format!("{k}{delimiter}{v}\n"));
            }
            out.push('\n');
        }
        out
    }

    /// Merge `src` into `self`, keeping every value already present in
    /// `self` and only filling in keys `self` doesn't already have.
    pub fn merge_from(&self, src: &ConfigSet) {
        for domain in src.enumerate() {
            let Some(src_domain) = src.lookup_domain(&domain) else {
                continue;
            };
            for (key, value) in src_domain.iter() {
                let already_present = self
                    .domains
                    .read()
                    .get(&domain)
                    .map(|d| d.lookup(key).is_some())
                    .unwrap_or(false);
                if !already_present {
                    self.add_key(&domain, key, value);
                }
            }
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Holds every named [`ConfigSet`] a process uses.
#[derive(Default)]
pub struct ConfigManager {
    sets: RwLock<HashMap<String, Arc<ConfigSet>>>,
}

static SINGLETON: OnceCell<Arc<ConfigManager>> = OnceCell::new();

impl ConfigManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide instance, created lazily on first access.
    pub fn singleton() -> Arc<Self> {
        SINGLETON.get_or_init(|| Arc::new(Self::default())).clone()
    }

    pub fn create_set(&self, name: &str) -> Result<Arc<ConfigSet>, CmError> {
        let mut sets = self.sets.write().unwrap();
        if sets.contains_key(name) {
            return Err(CmError::SetExists(name.to_string()));
        }
        let set = Arc::new(ConfigSet::new(name));
        sets.insert(name.to_string(), set.clone());
        Ok(set)
    }

    /// Create `name` if missing, seed every `(domain, key, value)` triple
    /// into it, and return the set. Pre-existing values win, matching
    /// [`ConfigSet::merge_from`]'s "caller already decided, don't override"
    /// contract.
    pub fn default_set(
        &self,
        name: &str,
        defaults: &[(&str, &str, &str)],
    ) -> Arc<ConfigSet> {
        let set = {
            let mut sets = self.sets.write().unwrap();
            sets.entry(name.to_string())
                .or_insert_with(|| Arc::new(ConfigSet::new(name)))
                .clone()
        };
        for (domain, key, value) in defaults {
            if set.lookup_value(domain, key).is_none() {
                set.add_key(domain, key, value);
            }
        }
        set
    }

    pub fn lookup_set(&self, name: &str) -> Option<Arc<ConfigSet>> {
        self.sets.read().unwrap().get(name).cloned()
    }

    pub fn remove_set(&self, name: &str) -> Result<(), CmError> {
        self.sets
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CmError::SetNotFound(name.to_string()))
    }

    pub fn enumerate(&self) -> Vec<String> {
        self.sets.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_comments() {
        let set = ConfigSet::new("test");
        set.load_str(
            "# a comment\n[trace]\nbase port = 33434\nRequest Timeout=1000\n\n[store]\nlifespan=60\n",
            '=',
        );
        assert_eq!(set.lookup_value("trace", "base port").as_deref(), Some("33434"));
        assert_eq!(
            set.lookup_value("trace", "request timeout").as_deref(),
            Some("1000")
        );
        assert_eq!(set.lookup_value("store", "lifespan").as_deref(), Some("60"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let set = ConfigSet::new("test");
        set.add_key("trace", "Base Port", "1");
        assert_eq!(set.lookup_value("trace", "base port").as_deref(), Some("1"));
    }

    #[test]
    fn add_key_replaces_existing_value() {
        let set = ConfigSet::new("test");
        set.add_key("trace", "retries", "3");
        set.add_key("trace", "retries", "5");
        assert_eq!(set.lookup_value("trace", "retries").as_deref(), Some("5"));
    }

    #[test]
    fn merge_keeps_destination_values() {
        let dst = ConfigSet::new("dst");
        dst.add_key("trace", "retries", "5");
        let src = ConfigSet::new("src");
        src.add_key("trace", "retries", "3");
        src.add_key("trace", "base port", "33434");

        dst.merge_from(&src);

        // destination value survives...
        assert_eq!(dst.lookup_value("trace", "retries").as_deref(), Some("5"));
        // ...but a key only present in src gets filled in.
        assert_eq!(dst.lookup_value("trace", "base port").as_deref(), Some("33434"));
    }

    #[test]
    fn manager_default_set_is_idempotent_on_reentry() {
        let mgr = ConfigManager::new();
        let a = mgr.default_set("trace", &[("trace", "retries", "3")]);
        let b = mgr.default_set("trace", &[("trace", "retries", "9")]);
        assert!(Arc::ptr_eq(&a, &b));
        // second call shouldn't clobber the first call's value
        assert_eq!(a.lookup_value("trace", "retries").as_deref(), Some("3"));
    }

    #[test]
    fn load_file_reads_sections_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        writeln!(file, "[trace]\nbase port=33434\n").unwrap();

        let set = ConfigSet::new("test");
        set.load_file(file.path(), '=').unwrap();
        assert_eq!(set.lookup_value("trace", "base port").as_deref(), Some("33434"));
    }

    #[test]
    fn load_file_missing_path_reports_io_error() {
        let set = ConfigSet::new("test");
        let err = set.load_file("/nonexistent/path/does-not-exist.cfg", '=').unwrap_err();
        assert!(matches!(err, CmError::Io { .. }));
    }

    #[test]
    fn write_string_round_trips_through_load_str() {
        let set = ConfigSet::new("test");
        set.add_key("trace", "retries", "3");
        set.add_key("trace", "base port", "33434");
        let text = set.write_string('=');

        let reloaded = ConfigSet::new("reloaded");
        reloaded.load_str(&text, '=');
        assert_eq!(reloaded.lookup_value("trace", "retries").as_deref(), Some("3"));
        assert_eq!(
            reloaded.lookup_value("trace", "base port").as_deref(),
            Some("33434")
        );
    }
}
