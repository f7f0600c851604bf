//! NA Plugin System - Network Abstraction Backends
//!
//! An NA plugin turns a transport spec such as `"sock+tcp"` or
//! `"na+sm://shm0"` into a live NA class: something that can report its own
//! address, render addresses as text, and hand out per-context event sources
//! for the progress loop.
//!
//! Plugins are registered by name in a [`PluginRegistry`]. A spec names the
//! plugin explicitly (`plugin+protocol`) or only the protocol, in which case
//! the first registered plugin supporting that protocol is used.
//!
//! # Spec grammar
//! ```text
//! spec     := [plugin '+'] protocol ['://' [host] [':' port]]
//! host     := name | '[' ipv6 ']'
//! ```

pub mod mock;
pub mod sm;
pub mod sock;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{CompletionQueue, Operation};
use crate::error::NaError;
use crate::options::NaInitOptions;

pub use mock::{MockBehavior, MockPlugin};
pub use sm::SmPlugin;
pub use sock::SockPlugin;

/// A parsed transport spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    /// Plugin name, when given explicitly.
    pub plugin: Option<String>,
    /// Protocol within the plugin (e.g. "tcp", "sm", "loopback").
    pub protocol: String,
    /// Host part after `://`, brackets stripped for IPv6.
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl TransportSpec {
    pub fn parse(raw: &str) -> Result<Self, NaError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(NaError::InvalidSpec("empty transport spec".into()));
        }

        let (head, tail) = match raw.split_once("://") {
            Some((head, tail)) => (head, Some(tail)),
            None => (raw, None),
        };

        let mut parts = head.split('+');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(NaError::InvalidSpec(format!("too many '+' in '{raw}'")));
        }
        let (plugin, protocol) = match second {
            Some(protocol) => (Some(first), protocol),
            None => (None, first),
        };

        if let Some(plugin) = plugin {
            check_ident(raw, "plugin", plugin)?;
        }
        check_ident(raw, "protocol", protocol)?;

        let (host, port) = match tail {
            Some(tail) => parse_authority(raw, tail)?,
            None => (None, None),
        };

        Ok(Self {
            plugin: plugin.map(str::to_string),
            protocol: protocol.to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(plugin) = &self.plugin {
            write!(f, "{plugin}+")?;
        }
        write!(f, "{}", self.protocol)?;
        if self.host.is_some() || self.port.is_some() {
            write!(f, "://")?;
            match &self.host {
                Some(host) if host.contains(':') => write!(f, "[{host}]")?,
                Some(host) => write!(f, "{host}")?,
                None => {}
            }
            if let Some(port) = self.port {
                write!(f, ":{port}")?;
            }
        }
        Ok(())
    }
}

fn check_ident(raw: &str, what: &str, ident: &str) -> Result<(), NaError> {
    if ident.is_empty() {
        return Err(NaError::InvalidSpec(format!("empty {what} in '{raw}'")));
    }
    if !ident
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(NaError::InvalidSpec(format!(
            "illegal character in {what} '{ident}' of '{raw}'"
        )));
    }
    Ok(())
}

fn parse_authority(raw: &str, tail: &str) -> Result<(Option<String>, Option<u16>), NaError> {
    if tail.chars().any(char::is_whitespace) {
        return Err(NaError::InvalidSpec(format!("whitespace in address of '{raw}'")));
    }

    let (host, port) = if let Some(rest) = tail.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| NaError::InvalidSpec(format!("unterminated '[' in '{raw}'")))?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or_else(|| {
                NaError::InvalidSpec(format!("garbage after ']' in '{raw}'"))
            })?),
        };
        (host, port)
    } else {
        match tail.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (tail, None),
        }
    };

    let port = port
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| NaError::InvalidSpec(format!("bad port '{p}' in '{raw}'")))
        })
        .transpose()?;
    let host = (!host.is_empty()).then(|| host.to_string());
    Ok((host, port))
}

/// Everything a plugin needs to bring up an NA class.
pub struct NaInitInfo<'a> {
    pub spec: &'a TransportSpec,
    pub listen: bool,
    pub options: &'a NaInitOptions,
}

/// An NA-level endpoint address, as produced by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaAddr {
    uri: String,
}

impl NaAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Factory for NA classes of one plugin family.
pub trait NaPlugin: Send + Sync {
    /// Plugin identifier as written in specs (e.g. "sock").
    fn name(&self) -> &str;

    /// Protocols this plugin can initialize.
    fn protocols(&self) -> &[&str];

    fn supports(&self, protocol: &str) -> bool {
        self.protocols().iter().any(|p| *p == protocol)
    }

    /// Bring up an NA class. With `listen` set the class must be ready to
    /// accept inbound traffic when this returns.
    fn initialize(&self, info: &NaInitInfo<'_>) -> Result<Box<dyn NaClass>, NaError>;
}

/// A live NA instance owned by an engine. Resources are released on drop.
pub trait NaClass: Send + Sync {
    fn protocol(&self) -> &str;

    /// The address at which this class can be reached.
    fn addr_self(&self) -> Result<NaAddr, NaError>;

    /// Render an address as text. Must not contain NUL bytes.
    fn addr_to_string(&self, addr: &NaAddr) -> Result<String, NaError> {
        Ok(addr.uri().to_string())
    }

    /// Create the event source backing one engine context.
    fn context_create(&self) -> Result<Box<dyn NaContext>, NaError>;
}

/// Per-context event source driven by the progress loop.
pub trait NaContext: Send {
    /// Hand an operation to the network. The default treats the operation
    /// as completed locally and queues it for trigger.
    fn post(&mut self, op: Operation, queue: &CompletionQueue) -> Result<(), NaError> {
        queue.complete(op);
        Ok(())
    }

    /// Wait up to `timeout` for network events, moving anything that
    /// completes onto `queue`.
    fn poll(&mut self, queue: &CompletionQueue, timeout: Duration) -> Result<(), NaError> {
        queue.wait(timeout);
        Ok(())
    }
}

/// Registry of available NA plugins, keyed by name.
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn NaPlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `mock`, `na` (shared memory) and `sock`
    /// (TCP) plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MockPlugin::new()));
        registry.register(Arc::new(SmPlugin::new()));
        registry.register(Arc::new(SockPlugin::new()));
        registry
    }

    /// Register a plugin, replacing any previous plugin of the same name.
    pub fn register(&mut self, plugin: Arc<dyn NaPlugin>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            warn!("NA plugin '{}' replaced", name);
        } else {
            debug!("NA plugin '{}' registered", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NaPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn list_plugins(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Pick the plugin that should serve `spec`.
    pub fn resolve(&self, spec: &TransportSpec) -> Result<Arc<dyn NaPlugin>, NaError> {
        let plugin = match &spec.plugin {
            Some(name) => self
                .get(name)
                .ok_or_else(|| NaError::InvalidSpec(format!("plugin '{name}' is not available")))?,
            None => self
                .plugins
                .values()
                .find(|p| p.supports(&spec.protocol))
                .cloned()
                .ok_or_else(|| {
                    NaError::InvalidSpec(format!(
                        "no plugin supports protocol '{}'",
                        spec.protocol
                    ))
                })?,
        };

        if !plugin.supports(&spec.protocol) {
            return Err(NaError::ProtocolNotSupported {
                plugin: plugin.name().to_string(),
                protocol: spec.protocol.clone(),
            });
        }

        info!(plugin = plugin.name(), protocol = %spec.protocol, "NA plugin selected");
        Ok(plugin)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plugin_and_protocol() {
        let spec = TransportSpec::parse("mock+loopback").unwrap();
        assert_eq!(spec.plugin.as_deref(), Some("mock"));
        assert_eq!(spec.protocol, "loopback");
        assert!(spec.host.is_none());
        assert!(spec.port.is_none());
    }

    #[test]
    fn test_parse_bare_protocol() {
        let spec = TransportSpec::parse("tcp").unwrap();
        assert!(spec.plugin.is_none());
        assert_eq!(spec.protocol, "tcp");
    }

    #[test]
    fn test_parse_host_port() {
        let spec = TransportSpec::parse("sock+tcp://127.0.0.1:4000").unwrap();
        assert_eq!(spec.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(spec.port, Some(4000));

        let spec = TransportSpec::parse("sock+tcp://:4000").unwrap();
        assert!(spec.host.is_none());
        assert_eq!(spec.port, Some(4000));

        let spec = TransportSpec::parse("na+sm://shm0").unwrap();
        assert_eq!(spec.host.as_deref(), Some("shm0"));
        assert!(spec.port.is_none());
    }

    #[test]
    fn test_parse_ipv6() {
        let spec = TransportSpec::parse("sock+tcp://[::1]:5000").unwrap();
        assert_eq!(spec.host.as_deref(), Some("::1"));
        assert_eq!(spec.port, Some(5000));
        assert_eq!(spec.to_string(), "sock+tcp://[::1]:5000");
    }

    #[test]
    fn test_parse_malformed() {
        for raw in [
            "",
            "   ",
            "+tcp",
            "sock+",
            "a+b+c",
            "so ck+tcp",
            "sock+tcp://host:notaport",
            "sock+tcp://host:70000",
            "sock+tcp://[::1",
            "sock+tcp://[::1]x",
        ] {
            assert!(
                matches!(TransportSpec::parse(raw), Err(NaError::InvalidSpec(_))),
                "'{raw}' should be rejected"
            );
        }
    }

    #[test]
    fn test_display_roundtrip_simple() {
        assert_eq!(
            TransportSpec::parse("mock+loopback://node7:12").unwrap().to_string(),
            "mock+loopback://node7:12"
        );
        assert_eq!(TransportSpec::parse("na+sm").unwrap().to_string(), "na+sm");
    }

    #[test]
    fn test_registry_builtins() {
        let registry = PluginRegistry::with_builtins();
        let names = registry.list_plugins();
        assert_eq!(names, vec!["mock", "na", "sock"]);
    }

    #[test]
    fn test_registry_resolve_by_name() {
        let registry = PluginRegistry::with_builtins();
        let spec = TransportSpec::parse("mock+loopback").unwrap();
        assert_eq!(registry.resolve(&spec).unwrap().name(), "mock");
    }

    #[test]
    fn test_registry_resolve_by_protocol() {
        let registry = PluginRegistry::with_builtins();
        let spec = TransportSpec::parse("tcp").unwrap();
        assert_eq!(registry.resolve(&spec).unwrap().name(), "sock");
    }

    #[test]
    fn test_registry_unknown_plugin() {
        let registry = PluginRegistry::with_builtins();
        let spec = TransportSpec::parse("verbs+ib").unwrap();
        assert!(matches!(registry.resolve(&spec), Err(NaError::InvalidSpec(_))));
    }

    #[test]
    fn test_registry_protocol_mismatch() {
        let registry = PluginRegistry::with_builtins();
        let spec = TransportSpec::parse("mock+tcp").unwrap();
        assert!(matches!(
            registry.resolve(&spec),
            Err(NaError::ProtocolNotSupported { .. })
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PluginRegistry::new();
        assert!(registry.list_plugins().is_empty());
        let spec = TransportSpec::parse("loopback").unwrap();
        assert!(registry.resolve(&spec).is_err());
    }
}
