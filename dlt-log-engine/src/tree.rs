//! ECU / Application / Context tree
//!
//! An arena of tagged nodes. ECUs are roots, applications hang below an ECU
//! and contexts below an application. Node ids stay stable until the node is
//! removed; removed slots are never reused.

use crate::protocol::{log_level, trace_status};
use crate::types::DltId;
use serde::{Deserialize, Serialize};

/// Handle to a node in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Whether the state shown for a node is confirmed by the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    #[default]
    Unknown,
    Invalid,
}

/// Transport used to reach an ECU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Interface {
    Tcp { host: String, port: u16 },
    Serial { port: String, baud_rate: u32 },
}

impl Interface {
    pub fn is_serial(&self) -> bool {
        matches!(self, Interface::Serial { .. })
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interface::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Interface::Serial { port, baud_rate } => write!(f, "serial://{}@{}", port, baud_rate),
        }
    }
}

/// Connection state of an ECU. For serial links Connected means "port open".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuNode {
    pub id: DltId,

    #[serde(default)]
    pub description: String,

    pub interface: Interface,

    /// Default log level pushed with SetDefaultLogLevel
    #[serde(default = "default_log_level")]
    pub log_level: i8,

    /// Default trace status pushed with SetDefaultTraceStatus
    #[serde(default)]
    pub trace_status: i8,

    #[serde(default)]
    pub verbose_mode: bool,

    #[serde(default)]
    pub timing_packets: bool,

    #[serde(default)]
    pub auto_reconnect: bool,

    /// Ticks between two auto-reconnect checks
    #[serde(default = "default_reconnect_timeout")]
    pub auto_reconnect_timeout: u32,

    /// Prefix sent messages with the serial marker
    #[serde(default)]
    pub send_serial_header: bool,

    #[serde(default)]
    pub send_default_log_level: bool,

    #[serde(default)]
    pub send_get_log_info: bool,

    /// Push configuration whenever the ECU (re)connects
    #[serde(default)]
    pub update_data_if_online: bool,

    #[serde(skip)]
    pub state: ConnectionState,

    /// Serial DSR status; always true for TCP once connected
    #[serde(skip)]
    pub online: bool,

    #[serde(skip)]
    pub validity: Validity,

    #[serde(skip)]
    pub last_error: Option<String>,
}

fn default_log_level() -> i8 {
    log_level::INFO
}

fn default_reconnect_timeout() -> u32 {
    1
}

impl EcuNode {
    pub fn new(id: impl Into<DltId>, interface: Interface) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            interface,
            log_level: default_log_level(),
            trace_status: trace_status::OFF,
            verbose_mode: false,
            timing_packets: false,
            auto_reconnect: false,
            auto_reconnect_timeout: default_reconnect_timeout(),
            send_serial_header: false,
            send_default_log_level: false,
            send_get_log_info: false,
            update_data_if_online: false,
            state: ConnectionState::Disconnected,
            online: false,
            validity: Validity::Unknown,
            last_error: None,
        }
    }

    pub fn tcp(id: impl Into<DltId>, host: impl Into<String>, port: u16) -> Self {
        Self::new(id, Interface::Tcp { host: host.into(), port })
    }

    pub fn serial(id: impl Into<DltId>, port: impl Into<String>, baud_rate: u32) -> Self {
        Self::new(id, Interface::Serial { port: port.into(), baud_rate })
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationNode {
    pub id: DltId,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextNode {
    pub id: DltId,
    pub description: String,
    pub log_level: i8,
    pub trace_status: i8,
    pub validity: Validity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Ecu(EcuNode),
    Application(ApplicationNode),
    Context(ContextNode),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct EcuTree {
    nodes: Vec<Option<Node>>,
    roots: Vec<NodeId>,
}

impl EcuTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn insert(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node { kind, parent, children: Vec::new() }));
        match parent {
            Some(parent) => {
                if let Some(node) = self.get_mut(parent) {
                    node.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        id
    }

    pub fn add_ecu(&mut self, ecu: EcuNode) -> NodeId {
        self.insert(NodeKind::Ecu(ecu), None)
    }

    /// All ECU nodes in insertion order
    pub fn ecus(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.iter().copied()
    }

    pub fn find_ecu(&self, id: &DltId) -> Option<NodeId> {
        self.ecus().find(|node| self.ecu(*node).map(|e| &e.id) == Some(id))
    }

    pub fn ecu(&self, id: NodeId) -> Option<&EcuNode> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Ecu(ecu)) => Some(ecu),
            _ => None,
        }
    }

    pub fn ecu_mut(&mut self, id: NodeId) -> Option<&mut EcuNode> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Ecu(ecu)) => Some(ecu),
            _ => None,
        }
    }

    pub fn application(&self, id: NodeId) -> Option<&ApplicationNode> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Application(app)) => Some(app),
            _ => None,
        }
    }

    pub fn context(&self, id: NodeId) -> Option<&ContextNode> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Context(ctx)) => Some(ctx),
            _ => None,
        }
    }

    fn context_mut(&mut self, id: NodeId) -> Option<&mut ContextNode> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Context(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    pub fn find_application(&self, ecu: NodeId, app_id: &DltId) -> Option<NodeId> {
        self.children(ecu)
            .iter()
            .copied()
            .find(|node| self.application(*node).map(|a| &a.id) == Some(app_id))
    }

    pub fn find_context(&self, app: NodeId, ctx_id: &DltId) -> Option<NodeId> {
        self.children(app)
            .iter()
            .copied()
            .find(|node| self.context(*node).map(|c| &c.id) == Some(ctx_id))
    }

    /// Context ids below an ECU as (app, ctx) pairs
    pub fn context_ids(&self, ecu: NodeId) -> Vec<(DltId, DltId)> {
        let mut out = Vec::new();
        for &app in self.children(ecu) {
            let Some(app_node) = self.application(app) else { continue };
            for &ctx in self.children(app) {
                if let Some(ctx_node) = self.context(ctx) {
                    out.push((app_node.id, ctx_node.id));
                }
            }
        }
        out
    }

    /// Update the description of an application or create it
    pub fn upsert_application(&mut self, ecu: NodeId, app_id: DltId, description: &str) -> Option<NodeId> {
        self.ecu(ecu)?;
        if let Some(app) = self.find_application(ecu, &app_id) {
            if let Some(Node { kind: NodeKind::Application(node), .. }) = self.get_mut(app) {
                node.description = description.to_string();
            }
            return Some(app);
        }
        let node = ApplicationNode { id: app_id, description: description.to_string() };
        Some(self.insert(NodeKind::Application(node), Some(ecu)))
    }

    /// Update an existing context, else add it below its application,
    /// else create both. The context ends up valid.
    pub fn upsert_context(
        &mut self,
        ecu: NodeId,
        app_id: DltId,
        ctx_id: DltId,
        log_level: i8,
        trace_status: i8,
        description: Option<&str>,
    ) -> Option<NodeId> {
        self.ecu(ecu)?;
        let app = match self.find_application(ecu, &app_id) {
            Some(app) => app,
            None => {
                let node = ApplicationNode { id: app_id, description: String::new() };
                self.insert(NodeKind::Application(node), Some(ecu))
            }
        };

        if let Some(ctx) = self.find_context(app, &ctx_id) {
            if let Some(node) = self.context_mut(ctx) {
                node.log_level = log_level;
                node.trace_status = trace_status;
                if let Some(description) = description {
                    node.description = description.to_string();
                }
                node.validity = Validity::Valid;
            }
            return Some(ctx);
        }

        let node = ContextNode {
            id: ctx_id,
            description: description.unwrap_or_default().to_string(),
            log_level,
            trace_status,
            validity: Validity::Valid,
        };
        Some(self.insert(NodeKind::Context(node), Some(app)))
    }

    /// Mark the ECU and every context below it invalid
    pub fn invalidate_all(&mut self, ecu: NodeId) {
        let Some(node) = self.ecu_mut(ecu) else { return };
        node.validity = Validity::Invalid;

        let apps = self.children(ecu).to_vec();
        for app in apps {
            let contexts = self.children(app).to_vec();
            for ctx in contexts {
                if let Some(node) = self.context_mut(ctx) {
                    node.validity = Validity::Invalid;
                }
            }
        }
    }

    /// Remove one context; returns false when it does not exist
    pub fn remove_context(&mut self, ecu: NodeId, app_id: &DltId, ctx_id: &DltId) -> bool {
        let Some(app) = self.find_application(ecu, app_id) else { return false };
        let Some(ctx) = self.find_context(app, ctx_id) else { return false };
        self.remove(ctx);
        true
    }

    /// Remove a node and everything below it
    pub fn remove(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else { return };
        match node.parent {
            Some(parent) => {
                if let Some(parent) = self.get_mut(parent) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
        for child in node.children {
            self.remove(child);
        }
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_ecu() -> (EcuTree, NodeId) {
        let mut tree = EcuTree::new();
        let ecu = tree.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));
        (tree, ecu)
    }

    #[test]
    fn test_upsert_context_three_ways() {
        let (mut tree, ecu) = tree_with_ecu();

        // creates app and context
        let ctx = tree.upsert_context(ecu, "APP1".into(), "CTX1".into(), 4, 0, None).unwrap();
        assert_eq!(tree.children(ecu).len(), 1);

        // adds a context under the existing app
        tree.upsert_context(ecu, "APP1".into(), "CTX2".into(), 3, 0, Some("second")).unwrap();
        let app = tree.find_application(ecu, &"APP1".into()).unwrap();
        assert_eq!(tree.children(app).len(), 2);

        // updates in place
        let same = tree.upsert_context(ecu, "APP1".into(), "CTX1".into(), 6, 1, Some("first")).unwrap();
        assert_eq!(same, ctx);
        let node = tree.context(ctx).unwrap();
        assert_eq!(node.log_level, 6);
        assert_eq!(node.trace_status, 1);
        assert_eq!(node.description, "first");
        assert_eq!(node.validity, Validity::Valid);
    }

    #[test]
    fn test_invalidate_all_and_remove_context() {
        let (mut tree, ecu) = tree_with_ecu();
        let a = tree.upsert_context(ecu, "APP1".into(), "CTX1".into(), 4, 0, None).unwrap();
        let b = tree.upsert_context(ecu, "APP2".into(), "CTX1".into(), 4, 0, None).unwrap();

        tree.invalidate_all(ecu);
        assert_eq!(tree.ecu(ecu).unwrap().validity, Validity::Invalid);
        assert_eq!(tree.context(a).unwrap().validity, Validity::Invalid);
        assert_eq!(tree.context(b).unwrap().validity, Validity::Invalid);

        assert!(tree.remove_context(ecu, &"APP2".into(), &"CTX1".into()));
        assert!(tree.context(b).is_none());
        assert!(tree.context(a).is_some());
        assert!(!tree.remove_context(ecu, &"APP2".into(), &"CTX1".into()));
    }

    #[test]
    fn test_remove_ecu_drops_subtree() {
        let (mut tree, ecu) = tree_with_ecu();
        tree.upsert_context(ecu, "APP1".into(), "CTX1".into(), 4, 0, None);
        assert_eq!(tree.len(), 3);
        tree.remove(ecu);
        assert_eq!(tree.len(), 0);
        assert!(tree.find_ecu(&"ECU1".into()).is_none());
    }

    #[test]
    fn test_ecu_from_toml_like_json() {
        let ecu: EcuNode = serde_json::from_str(
            r#"{"id":"ECU1","interface":{"type":"tcp","host":"10.0.0.2","port":3490},"auto_reconnect":true}"#,
        )
        .unwrap();
        assert_eq!(ecu.id, DltId::new("ECU1"));
        assert!(ecu.auto_reconnect);
        assert_eq!(ecu.auto_reconnect_timeout, 1);
        assert_eq!(ecu.state, ConnectionState::Disconnected);
        assert_eq!(ecu.interface.to_string(), "tcp://10.0.0.2:3490");
    }
}
