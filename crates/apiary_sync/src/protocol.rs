//! Sync protocol types and utilities.
//!
//! Contains namespace keys, atoms, device identities, remote actions and the
//! two message unions exchanged over the wire: [`ClientMessage`] (client to
//! server) and [`ServerMessage`] (server to client). Both serialize as
//! `{"name": "<channel>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ==================== Namespaces ====================

const BRANCH_PREFIX: &str = "/branch/";
const WATCHED_BRANCH_PREFIX: &str = "/watched_branch/";

/// Storage/partition key for a branch's atoms or its presence watchers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Atoms and watching devices of a branch (`/branch/<name>`).
    Branch(String),
    /// Devices observing who is on a branch (`/watched_branch/<name>`).
    WatchedBranch(String),
}

impl Namespace {
    /// Parse a namespace key. Returns `None` for keys in neither format.
    pub fn parse(key: &str) -> Option<Self> {
        if let Some(branch) = key.strip_prefix(BRANCH_PREFIX) {
            Some(Namespace::Branch(branch.to_string()))
        } else {
            key.strip_prefix(WATCHED_BRANCH_PREFIX)
                .map(|branch| Namespace::WatchedBranch(branch.to_string()))
        }
    }

    /// Get the branch name this namespace belongs to.
    pub fn branch(&self) -> &str {
        match self {
            Namespace::Branch(branch) | Namespace::WatchedBranch(branch) => branch,
        }
    }

    /// Get the store key for this namespace.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Branch(branch) => write!(f, "{}{}", BRANCH_PREFIX, branch),
            Namespace::WatchedBranch(branch) => write!(f, "{}{}", WATCHED_BRANCH_PREFIX, branch),
        }
    }
}

/// Namespace key holding the atoms (and watchers) of `branch`.
pub fn branch_namespace(branch: &str) -> String {
    Namespace::Branch(branch.to_string()).key()
}

/// Namespace key holding the presence watchers of `branch`.
pub fn watch_branch_namespace(branch: &str) -> String {
    Namespace::WatchedBranch(branch.to_string()).key()
}

// ==================== Atoms ====================

/// Identifier of an atom inside a causal tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomId {
    pub site: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// An immutable, content-addressed causal-tree node.
///
/// The sync layer never looks inside `value` or validates `hash`; it only
/// uses the hash as the identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub hash: String,
    pub id: AtomId,
    pub cause: Option<AtomId>,
    pub value: Value,
}

// ==================== Connections ====================

/// One live transport session and the identity it connected with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    pub connection_id: String,
    pub session_id: String,
    pub username: String,
    pub token: String,
}

impl DeviceConnection {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(&self.session_id, &self.username)
    }

    /// Build the membership row for this connection in `namespace`.
    pub fn in_namespace(&self, namespace: impl Into<String>, temporary: bool) -> NamespaceConnection {
        NamespaceConnection {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
            namespace: namespace.into(),
            temporary,
        }
    }
}

/// Membership of a connection in a namespace.
///
/// Carries the connection's identity so presence and routing can be computed
/// from membership rows alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConnection {
    pub connection_id: String,
    pub session_id: String,
    pub username: String,
    pub token: String,
    pub namespace: String,
    pub temporary: bool,
}

impl NamespaceConnection {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(&self.session_id, &self.username)
    }
}

// ==================== Device Identity ====================

/// Identity claims of a device.
///
/// `device_id` aliases `username`; see [`DeviceInfo::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaims {
    pub session_id: String,
    pub username: String,
    pub device_id: String,
}

/// Device identity attached to presence events and device actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub claims: DeviceClaims,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl DeviceInfo {
    /// Project a session id and username onto the device claims.
    pub fn new(session_id: &str, username: &str) -> Self {
        Self {
            claims: DeviceClaims {
                session_id: session_id.to_string(),
                username: username.to_string(),
                device_id: username.to_string(),
            },
            roles: Vec::new(),
        }
    }
}

/// Routing criteria for a remote action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
}

impl DeviceSelector {
    /// Select every device with the given session id.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// Select every device.
    pub fn broadcast() -> Self {
        Self {
            broadcast: Some(true),
            ..Default::default()
        }
    }

    /// Whether any selector field was given. Empty strings count as absent.
    pub fn is_explicit(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.device_id)
            || present(&self.session_id)
            || present(&self.username)
            || self.broadcast.is_some()
    }

    /// Whether this selector targets the given device.
    ///
    /// `device_id` is compared against the device's username.
    pub fn matches(&self, device: &NamespaceConnection) -> bool {
        if self.broadcast == Some(true) {
            return true;
        }
        self.username.as_deref() == Some(device.username.as_str())
            || self.session_id.as_deref() == Some(device.session_id.as_str())
            || self.device_id.as_deref() == Some(device.username.as_str())
    }
}

// ==================== Remote Actions ====================

/// Payload of an action sent by a device to other devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteActionKind {
    /// Fire-and-forget event.
    Remote { event: Value },
    /// Result of a task previously requested from the sender.
    RemoteResult {
        #[serde(default)]
        result: Value,
    },
    /// Failure of a task previously requested from the sender.
    RemoteError { error: Value },
}

/// An action addressed to other devices on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAction {
    #[serde(flatten)]
    pub kind: RemoteActionKind,
    #[serde(flatten)]
    pub selector: DeviceSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Value>,
}

impl RemoteAction {
    pub fn event(event: Value, selector: DeviceSelector) -> Self {
        Self {
            kind: RemoteActionKind::Remote { event },
            selector,
            task_id: None,
        }
    }

    /// Convert into the variant delivered to devices, stamped with the sender's identity.
    pub fn into_device_action(self, device: DeviceInfo) -> DeviceAction {
        let kind = match self.kind {
            RemoteActionKind::Remote { event } => DeviceActionKind::Device { event },
            RemoteActionKind::RemoteResult { result } => DeviceActionKind::DeviceResult { result },
            RemoteActionKind::RemoteError { error } => DeviceActionKind::DeviceError { error },
        };
        DeviceAction {
            kind,
            device,
            task_id: self.task_id,
        }
    }
}

/// Payload of an action as delivered to the target device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceActionKind {
    Device {
        event: Value,
    },
    DeviceResult {
        #[serde(default)]
        result: Value,
    },
    DeviceError {
        error: Value,
    },
}

/// An action delivered to a device, carrying the identity of the device that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAction {
    #[serde(flatten)]
    pub kind: DeviceActionKind,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Value>,
}

// ==================== Events ====================

/// Request to watch a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchBranchEvent {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

impl WatchBranchEvent {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            temporary: None,
            site_id: None,
        }
    }

    pub fn temporary(branch: impl Into<String>) -> Self {
        Self {
            temporary: Some(true),
            ..Self::new(branch)
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.unwrap_or(false)
    }
}

/// Atoms added to (and removed from) a branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAtomsEvent {
    #[serde(default)]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atoms: Option<Vec<Atom>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_atoms: Option<Vec<String>>,
}

/// Acknowledgement of the hashes processed by an `AddAtoms` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomsReceivedEvent {
    pub branch: String,
    pub hashes: Vec<String>,
}

/// A device started watching a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedToBranchEvent {
    pub broadcast: bool,
    pub branch: WatchBranchEvent,
    pub device: DeviceInfo,
}

/// A device stopped watching a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedFromBranchEvent {
    pub broadcast: bool,
    pub branch: String,
    pub device: DeviceInfo,
}

/// Request to route a remote action to devices on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRemoteActionEvent {
    pub branch: String,
    pub action: RemoteAction,
}

/// A routed action delivered to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveDeviceActionEvent {
    pub branch: String,
    pub action: DeviceAction,
}

/// Number of devices currently watching a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCountEvent {
    pub branch: String,
    pub count: usize,
}

// ==================== Messages ====================

/// Messages sent from a device to the server.
///
/// Payloads are optional so a frame with `"data": null` still decodes and can
/// be rejected by the server's null guards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "repo/watch_branch")]
    WatchBranch(Option<WatchBranchEvent>),
    #[serde(rename = "repo/unwatch_branch")]
    UnwatchBranch(Option<String>),
    #[serde(rename = "repo/add_atoms")]
    AddAtoms(Option<AddAtomsEvent>),
    #[serde(rename = "repo/send_event")]
    SendEvent(Option<SendRemoteActionEvent>),
    #[serde(rename = "repo/watch_branch_devices")]
    WatchBranchDevices(Option<String>),
    #[serde(rename = "repo/unwatch_branch_devices")]
    UnwatchBranchDevices(Option<String>),
    #[serde(rename = "repo/device_count")]
    DeviceCount(Option<String>),
}

impl ClientMessage {
    /// Channel name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::WatchBranch(_) => "repo/watch_branch",
            ClientMessage::UnwatchBranch(_) => "repo/unwatch_branch",
            ClientMessage::AddAtoms(_) => "repo/add_atoms",
            ClientMessage::SendEvent(_) => "repo/send_event",
            ClientMessage::WatchBranchDevices(_) => "repo/watch_branch_devices",
            ClientMessage::UnwatchBranchDevices(_) => "repo/unwatch_branch_devices",
            ClientMessage::DeviceCount(_) => "repo/device_count",
        }
    }
}

/// Messages sent from the server to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "repo/add_atoms")]
    AddAtoms(AddAtomsEvent),
    #[serde(rename = "repo/atoms_received")]
    AtomsReceived(AtomsReceivedEvent),
    #[serde(rename = "repo/device_connected_to_branch")]
    DeviceConnectedToBranch(ConnectedToBranchEvent),
    #[serde(rename = "repo/device_disconnected_from_branch")]
    DeviceDisconnectedFromBranch(DisconnectedFromBranchEvent),
    #[serde(rename = "repo/receive_event")]
    ReceiveEvent(ReceiveDeviceActionEvent),
    #[serde(rename = "repo/device_count")]
    DeviceCount(DeviceCountEvent),
}

impl ServerMessage {
    /// Channel name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::AddAtoms(_) => "repo/add_atoms",
            ServerMessage::AtomsReceived(_) => "repo/atoms_received",
            ServerMessage::DeviceConnectedToBranch(_) => "repo/device_connected_to_branch",
            ServerMessage::DeviceDisconnectedFromBranch(_) => {
                "repo/device_disconnected_from_branch"
            }
            ServerMessage::ReceiveEvent(_) => "repo/receive_event",
            ServerMessage::DeviceCount(_) => "repo/device_count",
        }
    }
}

// ==================== Tests ====================
