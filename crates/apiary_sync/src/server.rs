//! The causal repo sync server.
//!
//! [`SyncServer`] is stateless: every operation re-reads the stores, mutates
//! them, and then asks the [`Messenger`] to deliver the resulting messages.
//! Any number of instances can share the same stores.

use crate::error::Result;
use crate::messenger::Messenger;
use crate::protocol::{
    AddAtomsEvent, AtomsReceivedEvent, ClientMessage, ConnectedToBranchEvent, DeviceConnection,
    DeviceCountEvent, DisconnectedFromBranchEvent, Namespace, NamespaceConnection,
    ReceiveDeviceActionEvent, SendRemoteActionEvent, ServerMessage, WatchBranchEvent,
    branch_namespace, watch_branch_namespace,
};
use crate::store::{AtomStore, ConnectionStore};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source of uniformly distributed numbers in `[0, 1)` used for implicit routing.
pub type RandomSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Serves causal repos in realtime on top of injected stores and a messenger.
pub struct SyncServer {
    connection_store: Arc<dyn ConnectionStore>,
    atom_store: Arc<dyn AtomStore>,
    messenger: Arc<dyn Messenger>,
    random: RandomSource,
}

impl SyncServer {
    pub fn new(
        connection_store: Arc<dyn ConnectionStore>,
        atom_store: Arc<dyn AtomStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            connection_store,
            atom_store,
            messenger,
            random: Arc::new(rand::random::<f64>),
        }
    }

    /// Replace the random source used to pick a target for unaddressed events.
    pub fn with_random_source(mut self, random: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    /// Dispatch a decoded client message to the matching operation.
    ///
    /// Messages without a payload are logged and ignored.
    pub async fn handle_message(&self, connection_id: &str, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::WatchBranch(Some(event)) => self.watch_branch(connection_id, event).await,
            ClientMessage::UnwatchBranch(Some(branch)) => {
                self.unwatch_branch(connection_id, &branch).await
            }
            ClientMessage::AddAtoms(Some(event)) => self.add_atoms(connection_id, event).await,
            ClientMessage::SendEvent(Some(event)) => self.send_event(connection_id, event).await,
            ClientMessage::WatchBranchDevices(Some(branch)) => {
                self.watch_branch_devices(connection_id, &branch).await
            }
            ClientMessage::UnwatchBranchDevices(Some(branch)) => {
                self.unwatch_branch_devices(connection_id, &branch).await
            }
            ClientMessage::DeviceCount(Some(branch)) => {
                self.device_count(connection_id, &branch).await
            }
            other => {
                warn!(
                    "[SyncServer] [{}] Ignoring {} with a null event",
                    connection_id,
                    other.name()
                );
                Ok(())
            }
        }
    }

    pub async fn connect(&self, connection: &DeviceConnection) -> Result<()> {
        debug!("[SyncServer] [{}] Connect", connection.connection_id);
        self.connection_store.save_connection(connection).await
    }

    /// Remove a connection and everything it was watching.
    ///
    /// Temporary branches left without watchers are cleared, and presence
    /// watchers of every branch the connection was on are notified.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        debug!("[SyncServer] [{}] Disconnect", connection_id);
        self.remove_connection(connection_id).await
    }

    /// Recurses through [`Self::send`], which removes connections found gone.
    fn remove_connection<'a>(&'a self, connection_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let memberships = self.connection_store.get_connections(connection_id).await?;
            self.connection_store.clear_connection(connection_id).await?;

            for membership in memberships {
                let Some(Namespace::Branch(branch)) = Namespace::parse(&membership.namespace)
                else {
                    continue;
                };
                if membership.temporary {
                    self.collect_if_unwatched(&membership.namespace).await?;
                }
                self.notify_disconnected(&branch, &membership).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Start watching a branch and receive its current atoms.
    pub async fn watch_branch(&self, connection_id: &str, event: WatchBranchEvent) -> Result<()> {
        if event.branch.is_empty() {
            warn!("[SyncServer] [{}] Trying to watch a branch without a name", connection_id);
            return Ok(());
        }

        let namespace = branch_namespace(&event.branch);
        info!("[SyncServer] [{}] [{}] Watch", namespace, connection_id);

        let Some(connection) = self.connection_store.get_connection(connection_id).await? else {
            warn!(
                "[SyncServer] [{}] [{}] Watch from an unknown connection",
                namespace, connection_id
            );
            return Ok(());
        };
        self.connection_store
            .save_namespace_connection(&connection.in_namespace(&namespace, event.is_temporary()))
            .await?;

        let atoms = self.atom_store.load_atoms(&namespace).await?;
        let watchers = self
            .connection_store
            .get_connections_by_namespace(&watch_branch_namespace(&event.branch))
            .await?;

        info!(
            "[SyncServer] [{}] [{}] Connected with {} atoms",
            namespace,
            connection_id,
            atoms.len()
        );

        let connected = ServerMessage::DeviceConnectedToBranch(ConnectedToBranchEvent {
            broadcast: false,
            branch: event.clone(),
            device: connection.device_info(),
        });
        let snapshot = ServerMessage::AddAtoms(AddAtomsEvent {
            branch: event.branch,
            atoms: Some(atoms),
            removed_atoms: None,
        });
        let watcher_ids = connection_ids(&watchers);
        let caller = [connection.connection_id];

        futures::try_join!(
            self.send(&watcher_ids, &connected, None),
            self.send(&caller, &snapshot, None),
        )?;
        Ok(())
    }

    /// Stop watching a branch. Does nothing if the connection was not watching it.
    pub async fn unwatch_branch(&self, connection_id: &str, branch: &str) -> Result<()> {
        if branch.is_empty() {
            warn!("[SyncServer] [{}] Trying to unwatch a branch without a name", connection_id);
            return Ok(());
        }

        let namespace = branch_namespace(branch);
        info!("[SyncServer] [{}] [{}] Unwatch", namespace, connection_id);

        let Some(membership) = self
            .connection_store
            .get_namespace_connection(connection_id, &namespace)
            .await?
        else {
            return Ok(());
        };

        self.connection_store
            .delete_namespace_connection(connection_id, &namespace)
            .await?;
        if membership.temporary {
            self.collect_if_unwatched(&namespace).await?;
        }
        self.notify_disconnected(branch, &membership).await
    }

    /// Store added/removed atoms, relay them to the other watchers and acknowledge the sender.
    pub async fn add_atoms(&self, connection_id: &str, event: AddAtomsEvent) -> Result<()> {
        if event.branch.is_empty() {
            warn!("[SyncServer] [{}] Trying to add atoms without a branch", connection_id);
            return Ok(());
        }

        let namespace = branch_namespace(&event.branch);
        let atoms = event.atoms.unwrap_or_default();
        let removed = event.removed_atoms.unwrap_or_default();

        if !atoms.is_empty() {
            self.atom_store.save_atoms(&namespace, &atoms).await?;
        }
        if !removed.is_empty() {
            self.atom_store.delete_atoms(&namespace, &removed).await?;
        }

        let has_added = !atoms.is_empty();
        let has_removed = !removed.is_empty();
        if has_added || has_removed {
            let devices = self
                .connection_store
                .get_connections_by_namespace(&namespace)
                .await?;
            let relay = ServerMessage::AddAtoms(AddAtomsEvent {
                branch: event.branch.clone(),
                atoms: has_added.then(|| atoms.clone()),
                removed_atoms: has_removed.then(|| removed.clone()),
            });
            debug!(
                "[SyncServer] [{}] [{}] Relaying {} added and {} removed atoms",
                namespace,
                connection_id,
                atoms.len(),
                removed.len()
            );
            self.send(&connection_ids(&devices), &relay, Some(connection_id)).await?;
        }

        let hashes = atoms
            .iter()
            .map(|a| a.hash.clone())
            .chain(removed)
            .collect();
        let ack = ServerMessage::AtomsReceived(AtomsReceivedEvent {
            branch: event.branch,
            hashes,
        });
        self.send(&[connection_id.to_string()], &ack, None).await
    }

    /// Route a remote action to the devices on a branch that its selector targets.
    ///
    /// Actions without a selector go to one watcher picked at random.
    pub async fn send_event(&self, connection_id: &str, event: SendRemoteActionEvent) -> Result<()> {
        if event.branch.is_empty() {
            warn!("[SyncServer] [{}] Trying to send an event without a branch", connection_id);
            return Ok(());
        }

        let namespace = branch_namespace(&event.branch);
        let devices = self
            .connection_store
            .get_connections_by_namespace(&namespace)
            .await?;

        let SendRemoteActionEvent { branch, mut action } = event;
        if !action.selector.is_explicit() {
            let Some(target) = self.pick_random(&devices) else {
                debug!(
                    "[SyncServer] [{}] [{}] No devices to receive the event",
                    namespace, connection_id
                );
                return Ok(());
            };
            action.selector.session_id = Some(target.session_id.clone());
        }

        let Some(sender) = self.connection_store.get_connection(connection_id).await? else {
            warn!(
                "[SyncServer] [{}] [{}] Event from an unknown connection",
                namespace, connection_id
            );
            return Ok(());
        };

        let targets: Vec<String> = devices
            .iter()
            .filter(|d| action.selector.matches(d))
            .map(|d| d.connection_id.clone())
            .collect();
        let message = ServerMessage::ReceiveEvent(ReceiveDeviceActionEvent {
            branch,
            action: action.into_device_action(sender.device_info()),
        });
        self.send(&targets, &message, None).await
    }

    /// Watch which devices are on a branch.
    ///
    /// The caller immediately receives one "device connected" message per
    /// device currently on the branch; later joins and leaves arrive as they happen.
    pub async fn watch_branch_devices(&self, connection_id: &str, branch: &str) -> Result<()> {
        if branch.is_empty() {
            warn!(
                "[SyncServer] [{}] Trying to watch devices of a branch without a name",
                connection_id
            );
            return Ok(());
        }

        let namespace = watch_branch_namespace(branch);
        info!("[SyncServer] [{}] [{}] Watch devices for branch", namespace, connection_id);

        let Some(connection) = self.connection_store.get_connection(connection_id).await? else {
            warn!(
                "[SyncServer] [{}] [{}] Watch devices from an unknown connection",
                namespace, connection_id
            );
            return Ok(());
        };
        self.connection_store
            .save_namespace_connection(&connection.in_namespace(&namespace, true))
            .await?;

        let devices = self
            .connection_store
            .get_connections_by_namespace(&branch_namespace(branch))
            .await?;
        let messages: Vec<ServerMessage> = devices
            .iter()
            .map(|device| {
                ServerMessage::DeviceConnectedToBranch(ConnectedToBranchEvent {
                    broadcast: false,
                    branch: WatchBranchEvent {
                        branch: branch.to_string(),
                        temporary: Some(device.temporary),
                        site_id: None,
                    },
                    device: device.device_info(),
                })
            })
            .collect();

        let caller = [connection_id.to_string()];
        try_join_all(
            messages
                .iter()
                .map(|message| self.send(&caller, message, None)),
        )
        .await?;
        Ok(())
    }

    /// Stop watching which devices are on a branch.
    pub async fn unwatch_branch_devices(&self, connection_id: &str, branch: &str) -> Result<()> {
        if branch.is_empty() {
            warn!(
                "[SyncServer] [{}] Trying to unwatch devices of a branch without a name",
                connection_id
            );
            return Ok(());
        }
        let namespace = watch_branch_namespace(branch);
        info!("[SyncServer] [{}] [{}] Unwatch devices for branch", namespace, connection_id);
        self.connection_store
            .delete_namespace_connection(connection_id, &namespace)
            .await
    }

    /// Reply with the number of devices currently on a branch.
    pub async fn device_count(&self, connection_id: &str, branch: &str) -> Result<()> {
        if branch.is_empty() {
            warn!("[SyncServer] [{}] Trying to count devices without a branch", connection_id);
            return Ok(());
        }
        let count = self
            .connection_store
            .count_connections_by_namespace(&branch_namespace(branch))
            .await?;
        let message = ServerMessage::DeviceCount(DeviceCountEvent {
            branch: branch.to_string(),
            count,
        });
        self.send(&[connection_id.to_string()], &message, None).await
    }

    /// Clear a temporary branch once nobody is watching it.
    async fn collect_if_unwatched(&self, namespace: &str) -> Result<()> {
        let count = self
            .connection_store
            .count_connections_by_namespace(namespace)
            .await?;
        if count == 0 {
            info!("[SyncServer] [{}] Clearing unwatched temporary branch", namespace);
            self.atom_store.clear_namespace(namespace).await?;
        }
        Ok(())
    }

    async fn notify_disconnected(&self, branch: &str, membership: &NamespaceConnection) -> Result<()> {
        let watchers = self
            .connection_store
            .get_connections_by_namespace(&watch_branch_namespace(branch))
            .await?;
        let message = ServerMessage::DeviceDisconnectedFromBranch(DisconnectedFromBranchEvent {
            broadcast: false,
            branch: branch.to_string(),
            device: membership.device_info(),
        });
        self.send(&connection_ids(&watchers), &message, None).await
    }

    /// Deliver a message and disconnect every connection the messenger found gone.
    async fn send(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<()> {
        let gone = self
            .messenger
            .send_message(connection_ids, message, exclude)
            .await?;
        for connection_id in gone {
            info!("[SyncServer] [{}] Connection is gone, disconnecting", connection_id);
            self.remove_connection(&connection_id).await?;
        }
        Ok(())
    }

    fn pick_random<'a>(&self, devices: &'a [NamespaceConnection]) -> Option<&'a NamespaceConnection> {
        let last = devices.len().checked_sub(1)?;
        let index = ((self.random)() * devices.len() as f64).floor().max(0.0) as usize;
        devices.get(index.min(last))
    }
}

fn connection_ids(connections: &[NamespaceConnection]) -> Vec<String> {
    connections.iter().map(|c| c.connection_id.clone()).collect()
}
