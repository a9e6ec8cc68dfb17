//! Application Classification
//!
//! The inspection engine is an external collaborator: the meter hands it the
//! payload of the first `n_dissections` packets of a flow and records whatever
//! it reports. When nothing is detected in time the engine's guess is used.

use crate::flow::FlowKey;
use crate::packet::Direction;

/// Label assigned before any detection
pub const UNKNOWN: &str = "Unknown";

/// What the inspection engine reports for a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Protocol/application label, e.g. `TLS.Facebook`
    pub application_name: String,
    /// Category label, e.g. `SocialNetwork`
    pub category_name: String,
    /// Engine confidence, 0-100
    pub confidence: u8,
    /// Server name from SNI/Host
    pub requested_server_name: Option<String>,
    /// Client handshake fingerprint
    pub client_fingerprint: Option<String>,
    /// Server handshake fingerprint
    pub server_fingerprint: Option<String>,
}

impl Detection {
    /// Detection with a label and category only
    pub fn new(application_name: impl Into<String>, category_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            category_name: category_name.into(),
            confidence: 100,
            requested_server_name: None,
            client_fingerprint: None,
            server_fingerprint: None,
        }
    }
}

/// Classification state carried by a flow record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub application_name: String,
    pub category_name: String,
    pub is_guessed: bool,
    pub confidence: u8,
    pub requested_server_name: String,
    pub client_fingerprint: String,
    pub server_fingerprint: String,
    pub(crate) completed: bool,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            application_name: UNKNOWN.to_string(),
            category_name: UNKNOWN.to_string(),
            is_guessed: false,
            confidence: 0,
            requested_server_name: String::new(),
            client_fingerprint: String::new(),
            server_fingerprint: String::new(),
            completed: false,
        }
    }
}

impl Classification {
    /// Whether inspection of this flow is over
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn apply(&mut self, detection: Detection, guessed: bool) {
        self.application_name = detection.application_name;
        self.category_name = detection.category_name;
        self.confidence = detection.confidence;
        self.is_guessed = guessed;
        if let Some(sni) = detection.requested_server_name {
            self.requested_server_name = sni;
        }
        if let Some(fp) = detection.client_fingerprint {
            self.client_fingerprint = fp;
        }
        if let Some(fp) = detection.server_fingerprint {
            self.server_fingerprint = fp;
        }
        self.completed = true;
    }
}

/// Inspection engine seam
pub trait Classifier: Send + Sync {
    /// Inspect one packet payload; `Some` ends inspection for the flow
    fn inspect(&self, key: &FlowKey, direction: Direction, payload: &[u8]) -> Option<Detection>;

    /// Best guess once inspection gave up
    fn guess(&self, _key: &FlowKey) -> Option<Detection> {
        None
    }
}

/// Leaves every flow `Unknown`
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClassifier;

impl Classifier for NoClassifier {
    fn inspect(&self, _key: &FlowKey, _direction: Direction, _payload: &[u8]) -> Option<Detection> {
        None
    }
}

/// Guesses applications from well-known ports. Never detects from payload.
pub struct PortClassifier {
    /// (port, protocol, application, category)
    app_patterns: Vec<(u16, u8, &'static str, &'static str)>,
}

impl PortClassifier {
    pub fn new() -> Self {
        Self {
            app_patterns: vec![
                (443, 6, "TLS", "Web"),
                (80, 6, "HTTP", "Web"),
                (53, 17, "DNS", "Network"),
                (53, 6, "DNS", "Network"),
                (5060, 17, "SIP", "VoIP"),
                (5061, 6, "SIP", "VoIP"),
                (3478, 17, "STUN", "Network"),
                (1194, 17, "OpenVPN", "VPN"),
                (51820, 17, "WireGuard", "VPN"),
                (22, 6, "SSH", "RemoteAccess"),
                (3389, 6, "RDP", "RemoteAccess"),
                (123, 17, "NTP", "System"),
                (443, 17, "QUIC", "Web"),
            ],
        }
    }

    fn classify_by_port(&self, port: u16, protocol: u8) -> Option<Detection> {
        self.app_patterns
            .iter()
            .find(|(p, proto, _, _)| *p == port && *proto == protocol)
            .map(|(_, _, app, category)| {
                let mut detection = Detection::new(*app, *category);
                detection.confidence = 10;
                detection
            })
    }
}

impl Default for PortClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for PortClassifier {
    fn inspect(&self, _key: &FlowKey, _direction: Direction, _payload: &[u8]) -> Option<Detection> {
        None
    }

    fn guess(&self, key: &FlowKey) -> Option<Detection> {
        self.classify_by_port(key.lower_port, key.protocol)
            .or_else(|| self.classify_by_port(key.upper_port, key.protocol))
    }
}
