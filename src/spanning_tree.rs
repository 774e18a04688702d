//! Federation spanning tree: loop-free multi-FNE topology, announcement,
//! duplicate-connection arbitration and tree-disconnect notification (spec
//! §4.9, §9 "cyclic/graph-like state").
//!
//! The tree is rooted at this FNE; children are neighbour-FNE peers,
//! grandchildren are peers connected to those. Modeled as an owned
//! registry keyed by peer ID (not raw pointers) — the design note calls
//! for a singleton with init/teardown tied to FNE lifecycle, realized here
//! as a struct owned by the `Server` for the process's lifetime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Consecutive differing announcements required before a node is moved to
/// a new parent (`s_maxUpdatesBeforeReparent` in the original).
pub const MAX_UPDATES_BEFORE_REPARENT: u8 = 3;

#[derive(Debug, Clone)]
pub struct SpanningTreeNode {
    pub peer_id: u32,
    pub master_id: u32,
    pub identity: String,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    updates_before_reparent: u8,
}

impl SpanningTreeNode {
    fn new(peer_id: u32, master_id: u32, identity: String, parent: Option<u32>) -> Self {
        SpanningTreeNode { peer_id, master_id, identity, parent, children: Vec::new(), updates_before_reparent: 0 }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Wire form of a subtree announcement (spec §4.9, §6 `NET_TREE.LIST`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNodeJson {
    pub id: u32,
    #[serde(rename = "masterId")]
    pub master_id: u32,
    pub identity: String,
    pub children: Vec<TreeNodeJson>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginAdmission {
    Accept,
    /// Fast-reconnect: same `(peerId, masterId)` pair as a stale entry; reparent under root.
    FastReconnect,
    /// Reject with `FNE_DUPLICATE_CONN`; carries the offending peer ID whose
    /// master should receive a `NET_TREE_DISC`.
    DuplicateReject { offending_peer_id: u32, informing_master: u32 },
}

#[derive(Default)]
pub struct SpanningTree {
    nodes: parking_lot::Mutex<HashMap<u32, SpanningTreeNode>>,
    root_peer_id: u32,
}

impl SpanningTree {
    pub fn new(root_peer_id: u32) -> Self {
        SpanningTree { nodes: parking_lot::Mutex::new(HashMap::new()), root_peer_id }
    }

    pub fn find_by_peer_id(&self, peer_id: u32) -> Option<SpanningTreeNode> {
        self.nodes.lock().get(&peer_id).cloned()
    }

    pub fn find_by_master_id(&self, master_id: u32) -> Option<SpanningTreeNode> {
        self.nodes.lock().values().find(|n| n.master_id == master_id).cloned()
    }

    pub fn count_children(&self, peer_id: u32) -> usize {
        self.nodes.lock().get(&peer_id).map(|n| n.children.len()).unwrap_or(0)
    }

    /// Create a tree node for a neighbour-FNE peer on config-exchange
    /// completion (spec §3 "Lifecycles"), parented under `parent_peer_id`
    /// (the root by default).
    pub fn create_node(&self, peer_id: u32, master_id: u32, identity: String, parent_peer_id: Option<u32>) {
        let parent = parent_peer_id.unwrap_or(self.root_peer_id);
        let mut nodes = self.nodes.lock();
        nodes.insert(peer_id, SpanningTreeNode::new(peer_id, master_id, identity, Some(parent)));
        if let Some(parent_node) = nodes.get_mut(&parent) {
            if !parent_node.children.contains(&peer_id) {
                parent_node.children.push(peer_id);
            }
        }
    }

    /// Erase a peer and its subtree recursively (spec §3 "Lifecycles": peer
    /// erase destroys the tree node; children recurse).
    pub fn erase_peer(&self, peer_id: u32) {
        let mut nodes = self.nodes.lock();
        Self::erase_recursive(&mut nodes, peer_id);
    }

    fn erase_recursive(nodes: &mut HashMap<u32, SpanningTreeNode>, peer_id: u32) {
        let Some(node) = nodes.remove(&peer_id) else { return };
        if let Some(parent_id) = node.parent {
            if let Some(parent) = nodes.get_mut(&parent_id) {
                parent.children.retain(|&c| c != peer_id);
            }
        }
        for child in node.children {
            Self::erase_recursive(nodes, child);
        }
    }

    /// Move `node_id` under `new_parent_id`. Rejects the operation (returns
    /// `false`) if either ID is dangling, guarding against cycles per the
    /// invariant that any reparent must be from an ancestor-less candidate
    /// relative to the new parent.
    pub fn move_parent(&self, node_id: u32, new_parent_id: u32) -> bool {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&node_id) || !nodes.contains_key(&new_parent_id) {
            return false;
        }
        if self.is_ancestor_locked(&nodes, new_parent_id, node_id) {
            return false;
        }
        let old_parent = nodes.get(&node_id).and_then(|n| n.parent);
        if let Some(old_parent_id) = old_parent {
            if let Some(old_parent) = nodes.get_mut(&old_parent_id) {
                old_parent.children.retain(|&c| c != node_id);
            }
        }
        if let Some(node) = nodes.get_mut(&node_id) {
            node.parent = Some(new_parent_id);
        }
        if let Some(new_parent) = nodes.get_mut(&new_parent_id) {
            if !new_parent.children.contains(&node_id) {
                new_parent.children.push(node_id);
            }
        }
        true
    }

    fn is_ancestor_locked(&self, nodes: &HashMap<u32, SpanningTreeNode>, candidate: u32, of: u32) -> bool {
        let mut cur = Some(candidate);
        let mut visited = std::collections::HashSet::new();
        while let Some(id) = cur {
            if id == of {
                return true;
            }
            if !visited.insert(id) {
                return false;
            }
            cur = nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Serialize this node's subtree into the nested JSON form used for
    /// upstream announcements (spec §4.9).
    pub fn serialize_subtree(&self, root: u32) -> Option<TreeNodeJson> {
        let nodes = self.nodes.lock();
        Self::serialize_recursive(&nodes, root)
    }

    fn serialize_recursive(nodes: &HashMap<u32, SpanningTreeNode>, id: u32) -> Option<TreeNodeJson> {
        let node = nodes.get(&id)?;
        Some(TreeNodeJson {
            id: node.peer_id,
            master_id: node.master_id,
            identity: node.identity.clone(),
            children: node.children.iter().filter_map(|&c| Self::serialize_recursive(nodes, c)).collect(),
        })
    }

    /// Deserialize an inbound announcement under `announcing_master`. New
    /// nodes become children of the announcer; nodes whose parent has
    /// changed across `MAX_UPDATES_BEFORE_REPARENT` consecutive
    /// announcements are moved, provided both endpoints still exist.
    /// Nodes present locally but missing from this announcement under the
    /// same subtree are erased recursively.
    pub fn deserialize_announcement(&self, announcing_master: u32, tree: &[TreeNodeJson]) {
        let mut nodes = self.nodes.lock();
        let seen = Self::deserialize_recursive(&mut nodes, announcing_master, tree);
        Self::prune_missing(&mut nodes, announcing_master, &seen);
    }

    fn deserialize_recursive(nodes: &mut HashMap<u32, SpanningTreeNode>, parent: u32, tree: &[TreeNodeJson]) -> std::collections::HashSet<u32> {
        let mut seen = std::collections::HashSet::new();
        for entry in tree {
            seen.insert(entry.id);
            match nodes.get_mut(&entry.id) {
                None => {
                    nodes.insert(entry.id, SpanningTreeNode::new(entry.id, entry.master_id, entry.identity.clone(), Some(parent)));
                    if let Some(p) = nodes.get_mut(&parent) {
                        if !p.children.contains(&entry.id) {
                            p.children.push(entry.id);
                        }
                    }
                }
                Some(existing) => {
                    if existing.parent != Some(parent) {
                        existing.updates_before_reparent += 1;
                        if existing.updates_before_reparent >= MAX_UPDATES_BEFORE_REPARENT && nodes.contains_key(&parent) {
                            let old_parent = nodes.get(&entry.id).and_then(|n| n.parent);
                            if let Some(old) = old_parent {
                                if let Some(op) = nodes.get_mut(&old) {
                                    op.children.retain(|&c| c != entry.id);
                                }
                            }
                            let node = nodes.get_mut(&entry.id).unwrap();
                            node.parent = Some(parent);
                            node.updates_before_reparent = 0;
                            if let Some(p) = nodes.get_mut(&parent) {
                                if !p.children.contains(&entry.id) {
                                    p.children.push(entry.id);
                                }
                            }
                        }
                    } else {
                        existing.updates_before_reparent = 0;
                        existing.identity = entry.identity.clone();
                    }
                }
            }
            let children_seen = Self::deserialize_recursive(nodes, entry.id, &entry.children);
            seen.extend(children_seen);
        }
        seen
    }

    fn prune_missing(nodes: &mut HashMap<u32, SpanningTreeNode>, parent: u32, seen: &std::collections::HashSet<u32>) {
        let Some(children) = nodes.get(&parent).map(|n| n.children.clone()) else { return };
        for child in children {
            if !seen.contains(&child) {
                Self::erase_recursive(nodes, child);
            }
        }
    }

    /// Admission check run on local peer login (`externalPeer == true`) or
    /// during announcement deserialization (spec §4.9 "Duplicate
    /// detection").
    pub fn admit_neighbour_login(&self, peer_id: u32, master_id: u32) -> LoginAdmission {
        let nodes = self.nodes.lock();
        match nodes.values().find(|n| n.master_id == master_id) {
            None => LoginAdmission::Accept,
            Some(existing) if existing.peer_id == peer_id => LoginAdmission::FastReconnect,
            Some(existing) => LoginAdmission::DuplicateReject { offending_peer_id: peer_id, informing_master: existing.peer_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_master_id_is_rejected_with_offending_peer() {
        let tree = SpanningTree::new(9);
        tree.create_node(5, 5, "site-a".into(), Some(9));
        tree.create_node(2, 5, "site-a-child".into(), Some(5));
        // a second login claiming masterId=5 under a different peerId is a duplicate
        match tree.admit_neighbour_login(2, 5) {
            LoginAdmission::DuplicateReject { offending_peer_id, .. } => assert_eq!(offending_peer_id, 2),
            other => panic!("expected duplicate reject, got {other:?}"),
        }
    }

    #[test]
    fn fast_reconnect_same_peer_and_master() {
        let tree = SpanningTree::new(9);
        tree.create_node(5, 5, "site-a".into(), Some(9));
        assert_eq!(tree.admit_neighbour_login(5, 5), LoginAdmission::FastReconnect);
    }

    #[test]
    fn erase_peer_recurses_into_children() {
        let tree = SpanningTree::new(9);
        tree.create_node(5, 5, "a".into(), Some(9));
        tree.create_node(6, 6, "b".into(), Some(5));
        tree.erase_peer(5);
        assert!(tree.find_by_peer_id(5).is_none());
        assert!(tree.find_by_peer_id(6).is_none());
    }

    #[test]
    fn serialize_round_trips_topology_modulo_reparent_counters() {
        let tree = SpanningTree::new(9);
        tree.create_node(5, 5, "a".into(), Some(9));
        tree.create_node(6, 6, "b".into(), Some(5));
        let serialized = tree.serialize_subtree(5).unwrap();
        assert_eq!(serialized.id, 5);
        assert_eq!(serialized.children.len(), 1);
        assert_eq!(serialized.children[0].id, 6);

        let tree2 = SpanningTree::new(9);
        tree2.create_node(5, 5, "a".into(), Some(9));
        tree2.deserialize_announcement(5, &serialized.children);
        assert!(tree2.find_by_peer_id(6).is_some());
    }

    #[test]
    fn move_parent_refuses_to_create_a_cycle() {
        let tree = SpanningTree::new(9);
        tree.create_node(5, 5, "a".into(), Some(9));
        tree.create_node(6, 6, "b".into(), Some(5));
        assert!(!tree.move_parent(5, 6));
    }
}
