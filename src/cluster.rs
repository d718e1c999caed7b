//! Cluster membership as observed by clients and servers.

use serde::Deserialize;
use serde::Serialize;

use crate::ids::MemberId;

/// The voting weight a member carries in the external consensus layer.
///
/// The runtime itself never inspects `role` beyond passing it through; it is
/// carried so that a `ClusterTransport` implementation can decide whether a
/// member is eligible to serve a given `ReadConsistency`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Active,
    Passive,
    Reserve,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub host: String,
    pub port: u16,
    pub role: Role,
}

impl Member {
    pub fn new(id: MemberId, host: impl Into<String>, port: u16, role: Role) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            role,
        }
    }
}

/// An insertion-ordered snapshot of cluster membership plus the current term
/// and (if known) leader.
///
/// Invariant: if `leader` is `Some`, it names a member present in `members`.
/// This is enforced at construction time rather than merely documented.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    members: Vec<Member>,
    pub leader: Option<MemberId>,
    pub term: u64,
}

#[derive(thiserror::Error, Debug)]
#[error("leader {leader} is not a member of the given view")]
pub struct InvalidClusterView {
    pub leader: MemberId,
}

impl ClusterView {
    pub fn new(members: Vec<Member>, leader: Option<MemberId>, term: u64) -> Result<Self, InvalidClusterView> {
        if let Some(leader) = leader {
            if !members.iter().any(|m| m.id == leader) {
                return Err(InvalidClusterView { leader });
            }
        }
        Ok(Self { members, leader, term })
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn leader_member(&self) -> Option<&Member> {
        let leader = self.leader?;
        self.members.iter().find(|m| m.id == leader)
    }
}
