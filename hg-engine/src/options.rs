//! Engine Initialization Options
//!
//! `InitOptions` is assembled once before the engine starts and is frozen
//! inside the [`Engine`](crate::Engine) afterwards. Every field is optional
//! in the sense that a zero/unset value selects a documented default; the
//! `effective_*` accessors apply those defaults so callers never have to
//! repeat them.
//!
//! Options can be built in code with the chained `with_*` setters or read
//! from a JSON file (missing keys take their defaults).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, Result};

/// Default number of unexpected-request buffers posted at init and the
/// default growth increment.
pub const DEFAULT_REQUEST_POST: u32 = 512;

/// Default size hint for unexpected and expected messages.
pub const DEFAULT_MSG_SIZE: u32 = 4096;

/// Checksum coverage applied to RPC traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumLevel {
    #[default]
    None,
    RpcHeaders,
    RpcPayload,
}

/// Preferred traffic class, passed through to plugins that support QoS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    #[default]
    Unspec,
    BestEffort,
    LowLatency,
    BulkData,
    Scavenger,
    NetworkCtrl,
}

/// Whether progress may block waiting for events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    #[default]
    Block,
    /// Never block; progress returns immediately (busy polling).
    NoBlock,
}

/// Preferred address family for IP-based plugins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrFormat {
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
    Native,
}

/// Options handed to the NA plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NaInitOptions {
    /// Preferred local interface, as an address prefix ("10.92") or CIDR
    /// ("10.92.0.0/16").
    pub ip_subnet: Option<String>,
    /// Authentication key for fabrics that need one.
    pub auth_key: Option<String>,
    /// Max unexpected message size hint (0 = default).
    pub max_unexpected_size: u32,
    /// Max expected message size hint (0 = default).
    pub max_expected_size: u32,
    pub progress_mode: ProgressMode,
    pub addr_format: AddrFormat,
    /// Max number of contexts (0 = 1).
    pub max_contexts: u8,
    /// Caller promises single-threaded use.
    pub thread_mode_single: bool,
    /// Request support for transfers to/from memory devices.
    pub request_mem_device: bool,
    pub traffic_class: TrafficClass,
}

/// Configuration record consumed by [`Engine::init`](crate::Engine::init).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    pub na: NaInitOptions,
    /// Unexpected-request buffers posted at init when listening (0 = 512).
    pub request_post_init: u32,
    /// Extra buffers allocated when the initial pool runs dry
    /// (0 = 512, negative = growth disabled).
    pub request_post_incr: i32,
    /// Route same-host traffic through an internal shared-memory class.
    pub auto_sm: bool,
    /// Extra info for the shared-memory class (`na+sm://<info>`).
    pub sm_info_string: Option<String>,
    pub checksum_level: ChecksumLevel,
    /// Never inline small bulk data in serialized bulk handles.
    pub no_bulk_eager: bool,
    /// Disable the loopback shortcut for RPCs sent to self.
    pub no_loopback: bool,
    /// Print engine statistics at finalize.
    pub stats: bool,
    pub no_multi_recv: bool,
    pub release_input_early: bool,
    pub traffic_class: TrafficClass,
    pub no_overflow: bool,
    pub multi_recv_op_max: u32,
    pub multi_recv_copy_threshold: u32,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file. Absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn with_auto_sm(mut self, on: bool) -> Self {
        self.auto_sm = on;
        self
    }

    pub fn with_ip_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.na.ip_subnet = Some(subnet.into());
        self
    }

    pub fn with_sm_info(mut self, info: impl Into<String>) -> Self {
        self.sm_info_string = Some(info.into());
        self
    }

    pub fn with_request_post_init(mut self, count: u32) -> Self {
        self.request_post_init = count;
        self
    }

    pub fn with_request_post_incr(mut self, incr: i32) -> Self {
        self.request_post_incr = incr;
        self
    }

    pub fn with_max_contexts(mut self, max: u8) -> Self {
        self.na.max_contexts = max;
        self
    }

    pub fn with_max_unexpected_size(mut self, size: u32) -> Self {
        self.na.max_unexpected_size = size;
        self
    }

    pub fn with_max_expected_size(mut self, size: u32) -> Self {
        self.na.max_expected_size = size;
        self
    }

    pub fn with_progress_mode(mut self, mode: ProgressMode) -> Self {
        self.na.progress_mode = mode;
        self
    }

    pub fn with_addr_format(mut self, format: AddrFormat) -> Self {
        self.na.addr_format = format;
        self
    }

    pub fn with_checksum_level(mut self, level: ChecksumLevel) -> Self {
        self.checksum_level = level;
        self
    }

    pub fn with_stats(mut self, on: bool) -> Self {
        self.stats = on;
        self
    }

    pub fn effective_request_post_init(&self) -> u32 {
        if self.request_post_init == 0 {
            DEFAULT_REQUEST_POST
        } else {
            self.request_post_init
        }
    }

    /// Growth increment for the request pool. Zero means growth is
    /// disabled and inbound requests wait at the NA layer.
    pub fn effective_request_post_incr(&self) -> u32 {
        match self.request_post_incr {
            0 => DEFAULT_REQUEST_POST,
            n if n < 0 => 0,
            n => n as u32,
        }
    }

    pub fn effective_max_contexts(&self) -> usize {
        match self.na.max_contexts {
            0 => 1,
            n => n as usize,
        }
    }

    pub fn effective_max_unexpected_size(&self) -> usize {
        match self.na.max_unexpected_size {
            0 => DEFAULT_MSG_SIZE as usize,
            n => n as usize,
        }
    }

    pub fn effective_max_expected_size(&self) -> usize {
        match self.na.max_expected_size {
            0 => DEFAULT_MSG_SIZE as usize,
            n => n as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let opts = InitOptions::default();
        assert!(!opts.auto_sm);
        assert!(opts.na.ip_subnet.is_none());
        assert_eq!(opts.effective_request_post_init(), 512);
        assert_eq!(opts.effective_request_post_incr(), 512);
        assert_eq!(opts.effective_max_contexts(), 1);
        assert_eq!(opts.effective_max_unexpected_size(), 4096);
        assert_eq!(opts.effective_max_expected_size(), 4096);
        assert_eq!(opts.checksum_level, ChecksumLevel::None);
        assert_eq!(opts.na.progress_mode, ProgressMode::Block);
    }

    #[test]
    fn test_negative_increment_disables_growth() {
        let opts = InitOptions::new().with_request_post_incr(-5);
        assert_eq!(opts.effective_request_post_incr(), 0);
    }

    #[test]
    fn test_positive_values_pass_through() {
        let opts = InitOptions::new()
            .with_request_post_init(16)
            .with_request_post_incr(8)
            .with_max_contexts(4);
        assert_eq!(opts.effective_request_post_init(), 16);
        assert_eq!(opts.effective_request_post_incr(), 8);
        assert_eq!(opts.effective_max_contexts(), 4);
    }

    #[test]
    fn test_builder_chain() {
        let opts = InitOptions::new()
            .with_auto_sm(true)
            .with_ip_subnet("10.92")
            .with_sm_info("shm0")
            .with_addr_format(AddrFormat::Ipv4)
            .with_checksum_level(ChecksumLevel::RpcHeaders)
            .with_max_unexpected_size(1024)
            .with_max_expected_size(8192);
        assert!(opts.auto_sm);
        assert_eq!(opts.na.ip_subnet.as_deref(), Some("10.92"));
        assert_eq!(opts.sm_info_string.as_deref(), Some("shm0"));
        assert_eq!(opts.na.addr_format, AddrFormat::Ipv4);
        assert_eq!(opts.checksum_level, ChecksumLevel::RpcHeaders);
        assert_eq!(opts.effective_max_unexpected_size(), 1024);
        assert_eq!(opts.effective_max_expected_size(), 8192);
    }

    #[test]
    fn test_json_partial() {
        let opts = InitOptions::from_json_str(
            r#"{"auto_sm": true, "request_post_incr": -1, "na": {"ip_subnet": "192.168.0.0/16"}}"#,
        )
        .unwrap();
        assert!(opts.auto_sm);
        assert_eq!(opts.effective_request_post_incr(), 0);
        assert_eq!(opts.na.ip_subnet.as_deref(), Some("192.168.0.0/16"));
        assert_eq!(opts.effective_request_post_init(), 512);
    }

    #[test]
    fn test_json_enums() {
        let opts = InitOptions::from_json_str(
            r#"{"checksum_level": "rpc_payload", "na": {"progress_mode": "no_block", "addr_format": "ipv6"}}"#,
        )
        .unwrap();
        assert_eq!(opts.checksum_level, ChecksumLevel::RpcPayload);
        assert_eq!(opts.na.progress_mode, ProgressMode::NoBlock);
        assert_eq!(opts.na.addr_format, AddrFormat::Ipv6);
    }

    #[test]
    fn test_json_invalid() {
        let err = InitOptions::from_json_str("{not json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stats": true, "request_post_init": 64}}"#).unwrap();
        let opts = InitOptions::from_json_file(file.path()).unwrap();
        assert!(opts.stats);
        assert_eq!(opts.effective_request_post_init(), 64);
    }

    #[test]
    fn test_json_file_missing() {
        let err = InitOptions::from_json_file("/nonexistent/hg-options.json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
