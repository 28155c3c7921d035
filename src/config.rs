//! Engine configuration.

use crate::delegate::{
    AliveDelegate, ConflictDelegate, Delegate, EventDelegate, MergeDelegate, PingDelegate,
};
use crate::error::Error;
use crate::net::encrypted::Keyring;
use crate::types::{PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Label bytes ride in a one-byte length prefix.
pub const LABEL_MAX_SIZE: usize = 255;

/// Delegate protocol versions advertised in the node version vector.
pub const DELEGATE_PROTOCOL_MIN: u8 = 2;
pub const DELEGATE_PROTOCOL_MAX: u8 = 5;

/// Per-node opt-out for the TCP ping fallback.
pub type TcpPingFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Runtime configuration for a [`Membership`](crate::Membership) instance.
///
/// Construct with [`Config::default_lan`] (or the WAN/local variants) and
/// override fields as needed; `validate` runs at engine creation.
#[derive(Clone)]
pub struct Config {
    /// Unique node name in the cluster. Required.
    pub name: String,

    /// Address to bind the UDP and TCP listeners to.
    pub bind_addr: IpAddr,
    /// Bind port; 0 selects an ephemeral port (UDP and TCP share it).
    pub bind_port: u16,

    /// Address advertised to other nodes. Defaults to the bind address,
    /// falling back to loopback when bound to a wildcard.
    pub advertise_addr: Option<IpAddr>,
    /// Port advertised to other nodes. Defaults to the bound port.
    pub advertise_port: Option<u16>,

    /// Wire protocol version to speak; must lie within
    /// [`PROTOCOL_VERSION_MIN`, `PROTOCOL_VERSION_MAX`].
    pub protocol_version: u8,
    /// Delegate protocol version advertised in the version vector.
    pub delegate_protocol_version: u8,

    /// Timeout covering TCP dial plus one full push-pull direction.
    pub tcp_timeout: Duration,

    /// Number of intermediaries asked to ping an unresponsive peer.
    pub indirect_checks: usize,

    /// Retransmit scale: a broadcast is sent `retransmit_mult * ceil(log10(n+1))` times.
    pub retransmit_mult: usize,

    /// Suspicion timeout scale (multiplies `log10(n) * probe_interval`).
    pub suspicion_mult: u32,
    /// Ceiling of the suspicion timeout as a multiple of its floor.
    pub suspicion_max_timeout_mult: u32,

    /// Interval between full-state TCP exchanges; zero disables anti-entropy.
    pub push_pull_interval: Duration,

    /// Interval between failure-detection rounds.
    pub probe_interval: Duration,
    /// Time to wait for an ack before escalating to indirect probes.
    /// Should be set to the 99th percentile network RTT.
    pub probe_timeout: Duration,

    /// Disable the TCP fallback ping globally.
    pub disable_tcp_pings: bool,
    /// Disable the TCP fallback ping for specific target nodes.
    pub disable_tcp_pings_for: Option<TcpPingFilter>,

    /// Upper bound on the awareness multiplier applied to probe timeouts.
    pub awareness_max_multiplier: u32,

    /// Interval between gossip rounds; zero disables gossip.
    pub gossip_interval: Duration,
    /// Number of peers gossiped to per round.
    pub gossip_nodes: usize,
    /// How long dead or departed peers keep receiving gossip, so they can
    /// learn about (and refute) their own tombstone. Also the retention
    /// horizon for garbage-collecting tombstones from the registry.
    pub gossip_to_the_dead_time: Duration,

    /// Require inbound gossip to decrypt with an installed key.
    pub gossip_verify_incoming: bool,
    /// Encrypt outbound gossip. Disabling either flag is only meaningful
    /// while rolling encryption in or out of a running cluster.
    pub gossip_verify_outgoing: bool,

    /// Deflate-compress payloads before (optional) encryption.
    pub enable_compression: bool,

    /// Installed encryption keys; `None` disables encryption entirely.
    pub keyring: Option<Keyring>,

    /// Cluster label: an authenticated namespace prefixed to every packet and
    /// stream. Traffic carrying a different label is discarded.
    pub label: String,
    /// Accept packets regardless of their label (an accidentally present
    /// label then becomes an error). Debugging aid only.
    pub skip_inbound_label_check: bool,

    /// Networks allowed to join; `None` admits any address.
    pub cidrs_allowed: Option<Vec<IpNetwork>>,

    /// How long a dead node's address is considered reserved before another
    /// node may claim it. Zero means only an explicit leave frees it.
    pub dead_node_reclaim_time: Duration,

    /// Reject protocol messages that omit a node name.
    pub require_node_names: bool,

    /// Size budget for one UDP datagram.
    pub udp_buffer_size: usize,

    /// Bound on concurrent server-side push-pull exchanges.
    pub max_push_pull_concurrency: usize,

    // Application delegates. All optional; all invoked synchronously from the
    // protocol path and expected not to block.
    pub delegate: Option<Arc<dyn Delegate>>,
    pub events: Option<Arc<dyn EventDelegate>>,
    pub conflict: Option<Arc<dyn ConflictDelegate>>,
    pub alive: Option<Arc<dyn AliveDelegate>>,
    pub ping: Option<Arc<dyn PingDelegate>>,
    pub merge: Option<Arc<dyn MergeDelegate>>,
}

impl Config {
    /// Sane defaults for a local network: fast convergence at the cost of
    /// higher bandwidth.
    pub fn default_lan(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 7946,
            advertise_addr: None,
            advertise_port: None,
            protocol_version: PROTOCOL_VERSION_MAX,
            delegate_protocol_version: DELEGATE_PROTOCOL_MAX,
            tcp_timeout: Duration::from_secs(10),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            push_pull_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            disable_tcp_pings: false,
            disable_tcp_pings_for: None,
            awareness_max_multiplier: 8,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            gossip_verify_incoming: true,
            gossip_verify_outgoing: true,
            enable_compression: true,
            keyring: None,
            label: String::new(),
            skip_inbound_label_check: false,
            cidrs_allowed: None,
            dead_node_reclaim_time: Duration::ZERO,
            require_node_names: false,
            udp_buffer_size: 1400,
            max_push_pull_concurrency: 128,
            delegate: None,
            events: None,
            conflict: None,
            alive: None,
            ping: None,
            merge: None,
        }
    }

    /// Defaults for nodes spread across the internet: slower, more lenient.
    pub fn default_wan(name: impl Into<String>) -> Self {
        Self {
            tcp_timeout: Duration::from_secs(30),
            suspicion_mult: 6,
            push_pull_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            gossip_to_the_dead_time: Duration::from_secs(60),
            ..Self::default_lan(name)
        }
    }

    /// Defaults for co-located processes (tests, single-host clusters).
    pub fn default_local(name: impl Into<String>) -> Self {
        Self {
            tcp_timeout: Duration::from_secs(1),
            indirect_checks: 1,
            retransmit_mult: 2,
            suspicion_mult: 3,
            push_pull_interval: Duration::from_secs(15),
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(200),
            gossip_interval: Duration::from_millis(100),
            ..Self::default_lan(name)
        }
    }

    /// Whether outbound or inbound traffic may be encrypted at all.
    pub fn encryption_enabled(&self) -> bool {
        self.keyring.is_some()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("node name must not be empty".into()));
        }
        if self.protocol_version < PROTOCOL_VERSION_MIN
            || self.protocol_version > PROTOCOL_VERSION_MAX
        {
            return Err(Error::Config(format!(
                "protocol version {} outside [{}, {}]",
                self.protocol_version, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX
            )));
        }
        if self.label.len() > LABEL_MAX_SIZE {
            return Err(Error::Config(format!(
                "label exceeds {LABEL_MAX_SIZE} bytes"
            )));
        }
        if self.gossip_interval > Duration::ZERO && self.gossip_nodes == 0 {
            return Err(Error::Config("gossip_nodes must be positive".into()));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::Config("probe intervals must be positive".into()));
        }
        if self.udp_buffer_size < 512 {
            return Err(Error::Config("udp_buffer_size too small".into()));
        }
        Ok(())
    }

    /// Check an address against the join allowlist.
    pub fn ip_allowed(&self, ip: IpAddr) -> Result<(), Error> {
        let Some(cidrs) = &self.cidrs_allowed else {
            return Ok(());
        };
        if cidrs.iter().any(|net| net.contains(ip)) {
            Ok(())
        } else {
            Err(Error::PeerRejected(format!("{ip} is not allowed")))
        }
    }
}

/// Parse a list of CIDR strings (`"10.0.0.0/8"`, `"2001:db8::/32"`).
pub fn parse_cidrs(specs: &[String]) -> Result<Vec<IpNetwork>, Error> {
    specs
        .iter()
        .map(|s| {
            s.trim()
                .parse::<IpNetwork>()
                .map_err(|e| Error::Config(format!("bad CIDR {s:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default_lan("n1").validate().is_ok());
        assert!(Config::default_wan("n1").validate().is_ok());
        assert!(Config::default_local("n1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        assert!(Config::default_lan("").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_protocol_version() {
        let mut c = Config::default_lan("n1");
        c.protocol_version = 0;
        assert!(c.validate().is_err());
        c.protocol_version = PROTOCOL_VERSION_MAX + 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_cidr_allowlist() {
        let mut c = Config::default_lan("n1");
        c.cidrs_allowed = Some(parse_cidrs(&["10.0.0.0/8".into(), "127.0.0.1/32".into()]).unwrap());

        assert!(c.ip_allowed("10.1.2.3".parse().unwrap()).is_ok());
        assert!(c.ip_allowed("127.0.0.1".parse().unwrap()).is_ok());
        assert!(c.ip_allowed("192.168.1.1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_parse_cidrs_rejects_garbage() {
        assert!(parse_cidrs(&["not-a-cidr".into()]).is_err());
    }
}
