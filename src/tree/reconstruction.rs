//! Rebuilds a linked tree from flat, parent-referencing records.
//!
//! Validation runs in a fixed order so that the same broken input always
//! yields the same error kind: tree membership and duplicate ids, then root
//! discovery, then parent resolution, then roles, then reachability.

use std::collections::{HashMap, VecDeque};

use super::record::FlatMessageRecord;
use super::{Message, Role, TreeNode};
use crate::error::{TreeError, TreeResult};

/// Arena produced by [`reconstruct`]: nodes in breadth-first order from the
/// root (index 0) plus the id index.
pub(crate) struct Reconstructed {
    pub nodes: Vec<TreeNode>,
    pub index: HashMap<String, usize>,
}

pub(crate) fn reconstruct(records: &[FlatMessageRecord]) -> TreeResult<Reconstructed> {
    let first = records.first().ok_or(TreeError::NoRoot)?;

    let mut by_id: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        if record.tree_id != first.tree_id {
            return Err(TreeError::ForeignRecord {
                message_id: record.id.clone(),
                tree_id: record.tree_id.clone(),
                expected: first.tree_id.clone(),
            });
        }
        if by_id.insert(record.id.as_str(), position).is_some() {
            return Err(TreeError::DuplicateMessage {
                message_id: record.id.clone(),
            });
        }
    }

    let mut root: Option<usize> = None;
    for (position, record) in records.iter().enumerate() {
        if record.is_root() {
            if let Some(existing) = root {
                return Err(TreeError::MultipleRoots {
                    first: records[existing].id.clone(),
                    second: record.id.clone(),
                });
            }
            root = Some(position);
        }
    }
    let root = root.ok_or(TreeError::NoRoot)?;

    let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();
    for (position, record) in records.iter().enumerate() {
        if let Some(parent_id) = record.parent_id.as_deref() {
            let parent = by_id
                .get(parent_id)
                .copied()
                .ok_or_else(|| TreeError::DanglingParent {
                    message_id: record.id.clone(),
                    parent_id: parent_id.to_string(),
                })?;
            children_of.entry(parent).or_default().push(position);
        }
    }

    let mut roles = Vec::with_capacity(records.len());
    for record in records {
        let role: Role = record.role.parse().map_err(|_| TreeError::InvalidRole {
            message_id: record.id.clone(),
            role: record.role.clone(),
        })?;
        roles.push(role);
    }

    let mut nodes: Vec<TreeNode> = Vec::with_capacity(records.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut queue: VecDeque<(usize, Option<usize>)> = VecDeque::from([(root, None)]);

    while let Some((position, parent)) = queue.pop_front() {
        let record = &records[position];
        let slot = nodes.len();
        nodes.push(TreeNode {
            message: Message::restore(&record.id, roles[position], &record.content, record.created_at),
            parent,
            children: Vec::new(),
        });
        index.insert(record.id.clone(), slot);
        if let Some(parent) = parent {
            nodes[parent].children.push(slot);
        }
        if let Some(children) = children_of.get(&position) {
            queue.extend(children.iter().map(|child| (*child, Some(slot))));
        }
    }

    if nodes.len() != records.len() {
        // Every parent resolved, so the leftovers form a cycle detached from the root.
        let orphan = records
            .iter()
            .find(|record| !index.contains_key(&record.id))
            .map(|record| record.id.clone())
            .unwrap_or_default();
        return Err(TreeError::Cycle { message_id: orphan });
    }

    Ok(Reconstructed { nodes, index })
}
