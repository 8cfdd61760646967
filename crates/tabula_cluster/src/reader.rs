//! Reads served by cell peers. Follower reads race a backup request against
//! a second peer once the first has not answered within the backup delay.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tabula_chunk::NodeDirectory;
use tabula_common::error::{ConsistencyError, TabulaError, TabulaResult};
use tabula_hydra::{Cell, PeerHandle};
use tabula_tablet::TabletSlot;

type PeerRead<T> = Arc<dyn Fn(&TabletSlot) -> TabulaResult<T> + Send + Sync>;

fn serve<T>(nodes: &NodeDirectory, peer: &PeerHandle<TabletSlot>, read: &PeerRead<T>) -> TabulaResult<T> {
    if let Some(node) = nodes.get(peer.node) {
        let latency = node.latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
    let slot = peer.automaton.read();
    read(&slot)
}

fn spawn_read<T: Send + 'static>(
    nodes: Arc<NodeDirectory>,
    peer: PeerHandle<TabletSlot>,
    read: PeerRead<T>,
    sender: mpsc::Sender<TabulaResult<T>>,
) {
    let spawned = std::thread::Builder::new()
        .name("tabula-read".to_string())
        .spawn(move || {
            let _ = sender.send(serve(&nodes, &peer, &read));
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "cannot spawn peer read");
    }
}

/// Read from followers (falling back to the leader), sending a backup
/// request to the next peer after `backup_delay`. The first successful
/// answer wins.
pub fn read_from_followers<T, F>(
    cell: &Cell<TabletSlot>,
    nodes: &Arc<NodeDirectory>,
    backup_delay: Duration,
    timeout: Duration,
    read: F,
) -> TabulaResult<T>
where
    T: Send + 'static,
    F: Fn(&TabletSlot) -> TabulaResult<T> + Send + Sync + 'static,
{
    let mut peers = cell.followers();
    peers.extend(cell.leader().ok());
    let mut peers = peers.into_iter();
    let Some(primary) = peers.next() else {
        return Err(ConsistencyError::NoLeader { cell: cell.id() }.into());
    };
    let read: PeerRead<T> = Arc::new(read);
    let Some(backup) = peers.next() else {
        return serve(nodes, &primary, &read);
    };

    let started = Instant::now();
    let (sender, receiver) = mpsc::channel();
    spawn_read(nodes.clone(), primary, read.clone(), sender.clone());
    let mut last_error = None;
    match receiver.recv_timeout(backup_delay) {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => last_error = Some(e),
        Err(_) => tracing::debug!(cell = %cell.id(), peer = backup.peer_id, "sending backup request"),
    }
    spawn_read(nodes.clone(), backup, read, sender);

    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        match receiver.recv_timeout(remaining) {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last_error = Some(e),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(ConsistencyError::Timeout(timeout.as_millis() as u64).into())
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(last_error.unwrap_or_else(|| TabulaError::internal("peer reads vanished")))
            }
        }
    }
}
