//! Parsing for Redis text replies (`INFO`, `CLUSTER INFO`, `CLUSTER NODES`).
//!
//! All functions are pure so the topology rules can be tested without a
//! server.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

static INFO_LINE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([\w-]+):(.*)$").ok());

static VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?").ok());

/// Parse `key:value` lines, skipping blank lines and `#` section headers.
pub fn parse_info_output(info: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let Some(kv_regex) = INFO_LINE_RE.as_ref() else {
        return result;
    };
    for line in info.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().trim().to_string());
        }
    }
    result
}

pub fn parse_info_value(info: &str, key: &str) -> Option<String> {
    parse_info_output(info).remove(key)
}

pub fn parse_info_int(info: &str, key: &str) -> Option<i64> {
    parse_info_value(info, key).and_then(|v| v.parse().ok())
}

fn required_int(fields: &HashMap<String, String>, key: &str) -> Result<i64, ParseError> {
    fields
        .get(key)
        .ok_or_else(|| ParseError::MissingField(key.to_string()))?
        .parse()
        .map_err(|_| ParseError::Parse(format!("{} is not an integer", key)))
}

/// Server version as reported by `redis_version`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RedisVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RedisVersion {
    pub const MIN_SUPPORTED: RedisVersion = RedisVersion::new(2, 4, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let caps = VERSION_RE
            .as_ref()
            .and_then(|re| re.captures(raw.trim()))
            .ok_or_else(|| ParseError::Parse(format!("invalid redis_version '{}'", raw)))?;
        let number = |i: usize| -> u32 {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Ok(Self::new(number(1), number(2), number(3)))
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::MIN_SUPPORTED
    }

    /// `auto-aof-rewrite-percentage` can be changed at runtime from 7.0
    pub fn tunes_aof_rewrite(&self) -> bool {
        self.major >= 7
    }
}

impl fmt::Display for RedisVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Deployment mode reported by `redis_mode`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedisMode {
    Standalone,
    Sentinel,
    Cluster,
}

impl RedisMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "standalone" => Some(RedisMode::Standalone),
            "sentinel" => Some(RedisMode::Sentinel),
            "cluster" => Some(RedisMode::Cluster),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedisMode::Standalone => "standalone",
            RedisMode::Sentinel => "sentinel",
            RedisMode::Cluster => "cluster",
        }
    }
}

/// Fields of `INFO server` the driver needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: RedisVersion,
    pub mode: RedisMode,
}

impl ServerInfo {
    pub fn parse(info: &str) -> Result<Self, ParseError> {
        let fields = parse_info_output(info);
        let version = fields
            .get("redis_version")
            .ok_or_else(|| ParseError::MissingField("redis_version".to_string()))?;
        // Servers older than 3.0 have no redis_mode
        let mode = match fields.get("redis_mode") {
            Some(raw) => RedisMode::parse(raw)
                .ok_or_else(|| ParseError::Parse(format!("unknown redis_mode '{}'", raw)))?,
            None => RedisMode::Standalone,
        };
        Ok(Self {
            version: RedisVersion::parse(version)?,
            mode,
        })
    }
}

/// Fields of `CLUSTER INFO` the driver needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub state: String,
    pub size: i64,
    pub known_nodes: i64,
}

impl ClusterInfo {
    pub fn parse(info: &str) -> Result<Self, ParseError> {
        let fields = parse_info_output(info);
        Ok(Self {
            state: fields
                .get("cluster_state")
                .cloned()
                .ok_or_else(|| ParseError::MissingField("cluster_state".to_string()))?,
            size: required_int(&fields, "cluster_size")?,
            known_nodes: required_int(&fields, "cluster_known_nodes")?,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.state == "ok"
    }
}

/// One line of `CLUSTER NODES`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub is_master: bool,
}

impl ClusterNode {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `CLUSTER NODES`.
///
/// Address format is `ip:port@cport[,hostname]`; a `master` flag marks a
/// master, every other node counts as a replica.
pub fn parse_cluster_nodes(raw: &str) -> Result<Vec<ClusterNode>, ParseError> {
    let mut nodes = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(id), Some(address), Some(flags)) = (fields.first(), fields.get(1), fields.get(2))
        else {
            return Err(ParseError::Parse(format!("short cluster nodes line '{}'", line)));
        };

        let host_port = address
            .split(['@', ','])
            .next()
            .unwrap_or_default();
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| ParseError::Parse(format!("invalid node address '{}'", address)))?;
        let port = port
            .parse()
            .map_err(|_| ParseError::Parse(format!("invalid node port '{}'", address)))?;

        nodes.push(ClusterNode {
            id: id.to_string(),
            host: host.to_string(),
            port,
            is_master: flags.split(',').any(|f| f == "master"),
        });
    }
    Ok(nodes)
}

/// Check the node list against `CLUSTER INFO`
pub fn validate_cluster(info: &ClusterInfo, nodes: &[ClusterNode]) -> Result<(), ParseError> {
    if !info.is_ok() {
        return Err(ParseError::Parse(format!(
            "cluster_state is '{}'",
            info.state
        )));
    }

    let masters = nodes.iter().filter(|n| n.is_master).count() as i64;
    let replicas = nodes.len() as i64 - masters;
    if masters + replicas != info.known_nodes {
        return Err(ParseError::Parse(format!(
            "node count mismatch: {} masters + {} replicas != {} known nodes",
            masters, replicas, info.known_nodes
        )));
    }
    if masters != info.size {
        return Err(ParseError::Parse(format!(
            "master count mismatch: {} masters != cluster_size {}",
            masters, info.size
        )));
    }
    Ok(())
}
