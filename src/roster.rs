//! Roster Management
//!
//! The set of authenticated connections and the fan-out to them.
//!
//! Lock discipline: the single `members` mutex is held only for in-memory
//! work and non-blocking `try_send` calls, never across socket I/O or an
//! `.await`. Because mutation and the `UserList` fan-out happen under the
//! same lock, every member observes roster updates in mutation order.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::Message;

/// Server-assigned identity of one connection
pub type ConnectionId = Uuid;

/// Encoded frame payload queued for a connection's writer
pub type Outbound = Arc<[u8]>;

/// A connection in the `Active` state
#[derive(Debug)]
struct Member {
    id: ConnectionId,
    username: String,
    tx: mpsc::Sender<Outbound>,
    // Dropped with the member, which resolves the connection's `Removal`
    _removal: oneshot::Sender<()>,
}

/// Resolves once the member has left the roster, whether it left on its own
/// or was evicted
pub type Removal = oneshot::Receiver<()>;

/// Authoritative set of connected, authenticated users
#[derive(Debug, Default)]
pub struct Roster {
    members: Mutex<Vec<Member>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member and send the updated user list to everyone, the new
    /// member included
    pub fn join(&self, id: ConnectionId, username: String, tx: mpsc::Sender<Outbound>) -> Removal {
        let (removal_tx, removal_rx) = oneshot::channel();
        let mut members = self.members.lock();
        info!("{} joined the board ({})", username, id);
        members.push(Member {
            id,
            username,
            tx,
            _removal: removal_tx,
        });
        publish_user_list(&mut members);
        removal_rx
    }

    /// Remove a member and send the updated user list to the rest. Returns
    /// false if the member was already gone (evicted or left earlier).
    pub fn leave(&self, id: ConnectionId) -> bool {
        let mut members = self.members.lock();
        let Some(pos) = members.iter().position(|m| m.id == id) else {
            return false;
        };
        let member = members.remove(pos);
        info!("{} left the board ({})", member.username, member.id);
        publish_user_list(&mut members);
        true
    }

    /// Queue `payload` for every member except `sender`. Returns the number
    /// of members it was queued for, or `None` without queuing anything if
    /// `sender` is no longer a member.
    pub fn broadcast(&self, payload: &[u8], sender: ConnectionId) -> Option<usize> {
        let payload: Outbound = Arc::from(payload);
        let mut members = self.members.lock();
        if !members.iter().any(|m| m.id == sender) {
            debug!("Dropping frame from departed connection {}", sender);
            return None;
        }
        let targets = members.iter().filter(|m| m.id != sender).count();
        let dead = fan_out(&members, &payload, Some(sender));
        let delivered = targets - dead.len();
        evict(&mut members, dead);
        Some(delivered)
    }

    /// Usernames in join order
    pub fn names(&self) -> Vec<String> {
        self.members
            .lock()
            .iter()
            .map(|m| m.username.clone())
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().iter().any(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

fn user_list_frame(members: &[Member]) -> Outbound {
    let names = members.iter().map(|m| m.username.clone()).collect();
    Arc::from(Message::UserList { names }.encode())
}

/// Queue to every member but `except`; returns members whose queue is full
/// or whose writer is gone
fn fan_out(members: &[Member], payload: &Outbound, except: Option<ConnectionId>) -> Vec<ConnectionId> {
    let mut dead = Vec::new();
    for member in members.iter().filter(|m| Some(m.id) != except) {
        match member.tx.try_send(payload.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "{}",
                    RelayError::PeerUnreachable(format!("{} (outbound queue full)", member.username))
                );
                dead.push(member.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} writer already gone", member.username);
                dead.push(member.id);
            }
        }
    }
    dead
}

fn publish_user_list(members: &mut Vec<Member>) {
    let list = user_list_frame(members);
    let dead = fan_out(members, &list, None);
    evict(members, dead);
}

/// Drop unreachable members, then re-announce the roster until a fan-out
/// completes without further losses
fn evict(members: &mut Vec<Member>, mut dead: Vec<ConnectionId>) {
    while !dead.is_empty() {
        members.retain(|m| {
            let keep = !dead.contains(&m.id);
            if !keep {
                info!("Evicted {} ({})", m.username, m.id);
            }
            keep
        });
        let list = user_list_frame(members);
        dead = fan_out(members, &list, None);
    }
}
