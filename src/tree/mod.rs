//! Branching conversation tree.
//!
//! Any message can become the parent of a new message, so a chat is a tree of
//! alternative continuations rather than a linear transcript. This module
//! provides:
//! - [`Message`] and [`Role`], the immutable turn value
//! - [`FlatMessageRecord`], the persisted parent-referencing shape
//! - [`ConversationTree`], the aggregate that owns every node, answers lookups
//!   and path-to-root queries, and grows by appending leaves
//!
//! Nodes live in an arena indexed by position with a side index from message
//! id to position, so lookups are O(1) regardless of depth or branching.

mod message;
mod reconstruction;
mod record;

pub use message::{Message, Role};
pub use record::FlatMessageRecord;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::error::{TreeError, TreeResult};

/// Arena slot wrapping exactly one message.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub(crate) message: Message,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
}

/// A conversation tree owned by exactly one user.
///
/// Lifecycle: an empty tree becomes active either through
/// [`start_new_tree`](Self::start_new_tree) or
/// [`restore_from_records`](Self::restore_from_records); afterwards it only
/// grows through [`append_message`](Self::append_message).
#[derive(Debug, Clone, Default)]
pub struct ConversationTree {
    id: Option<String>,
    owner_id: Option<String>,
    nodes: Vec<TreeNode>,
    index: HashMap<String, usize>,
}

impl ConversationTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `initial_message` as root and set owner and id.
    ///
    /// Only valid on an empty tree; the owner is mandatory.
    pub fn start_new_tree(
        &mut self,
        initial_message: Message,
        owner_id: impl Into<String>,
        tree_id: impl Into<String>,
    ) -> TreeResult<()> {
        if !self.nodes.is_empty() || self.id.is_some() {
            return Err(TreeError::InvalidOperation {
                message: "tree has already been started".to_string(),
            });
        }
        let owner_id = owner_id.into();
        let tree_id = tree_id.into();
        if owner_id.trim().is_empty() {
            return Err(TreeError::InvalidOperation {
                message: "a tree cannot be started without an owner".to_string(),
            });
        }
        if tree_id.trim().is_empty() {
            return Err(TreeError::InvalidOperation {
                message: "a tree cannot be started without an id".to_string(),
            });
        }

        self.index.insert(initial_message.id().to_string(), 0);
        self.nodes.push(TreeNode {
            message: initial_message,
            parent: None,
            children: Vec::new(),
        });
        self.owner_id = Some(owner_id);
        self.id = Some(tree_id);
        Ok(())
    }

    /// Rebuild a tree from flat records.
    ///
    /// The result has no id or owner: owner and tree fields embedded in the
    /// records are ignored, callers stamp identity from authoritative metadata
    /// with [`stamp_identity`](Self::stamp_identity).
    pub fn restore_from_records(records: &[FlatMessageRecord]) -> TreeResult<Self> {
        let rebuilt = reconstruction::reconstruct(records)?;
        Ok(Self {
            id: None,
            owner_id: None,
            nodes: rebuilt.nodes,
            index: rebuilt.index,
        })
    }

    /// Assign id and owner to a restored tree. Can only happen once.
    pub fn stamp_identity(
        &mut self,
        tree_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> TreeResult<()> {
        if self.id.is_some() || self.owner_id.is_some() {
            return Err(TreeError::InvalidOperation {
                message: "tree identity is already set".to_string(),
            });
        }
        let tree_id = tree_id.into();
        let owner_id = owner_id.into();
        if tree_id.trim().is_empty() || owner_id.trim().is_empty() {
            return Err(TreeError::InvalidOperation {
                message: "tree id and owner are both required".to_string(),
            });
        }
        self.id = Some(tree_id);
        self.owner_id = Some(owner_id);
        Ok(())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    /// Strict equality against the stored owner; an unowned tree is owned by nobody.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of messages in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<NodeRef<'_>> {
        (!self.nodes.is_empty()).then(|| self.node_at(0))
    }

    /// Look up the node holding `message_id`.
    pub fn find_node(&self, message_id: &str) -> TreeResult<NodeRef<'_>> {
        self.index
            .get(message_id)
            .map(|&slot| self.node_at(slot))
            .ok_or_else(|| TreeError::NodeNotFound {
                message_id: message_id.to_string(),
            })
    }

    /// Root-first sequence of messages ending at `message_id`.
    ///
    /// This is exactly the history handed to the language model.
    pub fn get_path_to_root(&self, message_id: &str) -> TreeResult<Vec<Message>> {
        let node = self.find_node(message_id)?;
        let mut path: Vec<Message> = node
            .ancestors_inclusive()
            .map(|n| n.message().clone())
            .collect();
        path.reverse();
        Ok(path)
    }

    /// Whether a message may be appended under `message_id`.
    pub fn can_attach_to(&self, message_id: &str) -> bool {
        self.find_node(message_id).is_ok()
    }

    /// Attach point used when the caller names no parent: the root, but only
    /// while it has no children yet (the first reply to the opening message).
    pub fn default_attach_point(&self) -> Option<&str> {
        self.nodes
            .first()
            .filter(|root| root.children.is_empty())
            .map(|root| root.message.id())
    }

    /// Append `message` as the last child of `parent_message_id`.
    pub fn append_message(&mut self, parent_message_id: &str, message: Message) -> TreeResult<()> {
        let parent = *self
            .index
            .get(parent_message_id)
            .ok_or_else(|| TreeError::NodeNotFound {
                message_id: parent_message_id.to_string(),
            })?;
        if self.index.contains_key(message.id()) {
            return Err(TreeError::InvalidOperation {
                message: format!("message {} is already in the tree", message.id()),
            });
        }

        let slot = self.nodes.len();
        self.index.insert(message.id().to_string(), slot);
        self.nodes.push(TreeNode {
            message,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(slot);
        Ok(())
    }

    /// Nodes without children, i.e. the tips of every branch.
    pub fn leaves(&self) -> Vec<NodeRef<'_>> {
        (0..self.nodes.len())
            .filter(|&slot| self.nodes[slot].children.is_empty())
            .map(|slot| self.node_at(slot))
            .collect()
    }

    /// Breadth-first traversal from the root.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> + '_ {
        let mut queue: VecDeque<usize> = VecDeque::new();
        if !self.nodes.is_empty() {
            queue.push_back(0);
        }
        std::iter::from_fn(move || {
            let slot = queue.pop_front()?;
            queue.extend(self.nodes[slot].children.iter().copied());
            Some(self.node_at(slot))
        })
    }

    /// Flatten into persisted records, root first.
    ///
    /// Requires an identity, since every record carries tree and owner ids.
    pub fn flatten(&self) -> TreeResult<Vec<FlatMessageRecord>> {
        let (tree_id, owner_id) = match (self.id.as_deref(), self.owner_id.as_deref()) {
            (Some(tree_id), Some(owner_id)) => (tree_id, owner_id),
            _ => {
                return Err(TreeError::InvalidOperation {
                    message: "cannot flatten a tree without id and owner".to_string(),
                })
            }
        };

        Ok(self
            .iter()
            .map(|node| {
                let message = node.message();
                FlatMessageRecord {
                    id: message.id().to_string(),
                    role: message.role().to_string(),
                    content: message.content().to_string(),
                    parent_id: node.parent().map(|p| p.message().id().to_string()),
                    tree_id: tree_id.to_string(),
                    owner_id: owner_id.to_string(),
                    created_at: message.created_at(),
                    updated_at: message.created_at(),
                }
            })
            .collect())
    }

    /// Nested, serializable view of the whole tree.
    pub fn to_view(&self) -> Option<TreeView> {
        // Children always sit after their parent in the arena, so a reverse
        // sweep finishes every subtree before its parent needs it.
        let mut views: Vec<Option<TreeView>> = vec![None; self.nodes.len()];
        for slot in (0..self.nodes.len()).rev() {
            let node = &self.nodes[slot];
            let children = node
                .children
                .iter()
                .filter_map(|&child| views[child].take())
                .collect();
            views[slot] = Some(TreeView {
                id: node.message.id().to_string(),
                role: node.message.role(),
                content: node.message.content().to_string(),
                created_at: node.message.created_at(),
                children,
            });
        }
        views.into_iter().next().flatten()
    }

    fn node_at(&self, slot: usize) -> NodeRef<'_> {
        NodeRef { tree: self, slot }
    }
}

/// Borrowed view of one node inside a [`ConversationTree`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a ConversationTree,
    slot: usize,
}

impl<'a> NodeRef<'a> {
    pub fn message(&self) -> &'a Message {
        &self.tree.nodes[self.slot].message
    }

    /// `None` only for the root.
    pub fn parent(&self) -> Option<NodeRef<'a>> {
        self.tree.nodes[self.slot]
            .parent
            .map(|slot| self.tree.node_at(slot))
    }

    /// Children in insertion order.
    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        tree.nodes[self.slot]
            .children
            .iter()
            .map(move |&slot| tree.node_at(slot))
    }

    pub fn is_root(&self) -> bool {
        self.tree.nodes[self.slot].parent.is_none()
    }

    /// Number of edges between this node and the root.
    pub fn depth(&self) -> usize {
        self.ancestors_inclusive().count() - 1
    }

    fn ancestors_inclusive(&self) -> impl Iterator<Item = NodeRef<'a>> {
        std::iter::successors(Some(*self), |node| node.parent())
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tree, other.tree) && self.slot == other.slot
    }
}

impl Eq for NodeRef<'_> {}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("message_id", &self.message().id())
            .field("role", &self.message().role())
            .finish()
    }
}

/// Nested representation of a tree, with `children` arrays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeView {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub children: Vec<TreeView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn started(system: &str) -> (ConversationTree, String) {
        let mut tree = ConversationTree::new();
        let root = Message::system(system);
        let root_id = root.id().to_string();
        tree.start_new_tree(root, "owner-1", "tree-1").unwrap();
        (tree, root_id)
    }

    fn ids(path: &[Message]) -> Vec<&str> {
        path.iter().map(|m| m.id()).collect()
    }

    #[test]
    fn test_start_sets_identity_and_root() {
        let (tree, root_id) = started("You are a helpful assistant.");
        assert_eq!(tree.id(), Some("tree-1"));
        assert_eq!(tree.owner_id(), Some("owner-1"));
        assert_eq!(tree.len(), 1);
        let root = tree.root().unwrap();
        assert!(root.is_root());
        assert_eq!(root.message().id(), root_id);
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let (mut tree, _) = started("");
        let err = tree
            .start_new_tree(Message::system("again"), "owner-1", "tree-2")
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidOperation { .. }));
        assert_eq!(tree.id(), Some("tree-1"));
    }

    #[test]
    fn test_start_requires_owner() {
        let mut tree = ConversationTree::new();
        let err = tree
            .start_new_tree(Message::system(""), "  ", "tree-1")
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidOperation { .. }));
        assert!(tree.is_empty());
        assert!(tree.owner_id().is_none());
    }

    #[test]
    fn test_branching_scenario() {
        let (mut tree, r) = started("You are a helpful assistant.");

        let u1 = Message::user("Hi");
        let u1_id = u1.id().to_string();
        tree.append_message(&r, u1).unwrap();
        assert_eq!(ids(&tree.get_path_to_root(&u1_id).unwrap()), vec![r.as_str(), u1_id.as_str()]);

        let a1 = Message::assistant("Hello!");
        let a1_id = a1.id().to_string();
        tree.append_message(&u1_id, a1).unwrap();
        let a1_path = tree.get_path_to_root(&a1_id).unwrap();
        assert_eq!(ids(&a1_path), vec![r.as_str(), u1_id.as_str(), a1_id.as_str()]);
        assert_eq!(a1_path[2].content(), "Hello!");

        let u2 = Message::user("Hi again");
        let u2_id = u2.id().to_string();
        tree.append_message(&r, u2).unwrap();
        let u2_path = tree.get_path_to_root(&u2_id).unwrap();
        assert_eq!(ids(&u2_path), vec![r.as_str(), u2_id.as_str()]);

        let shared: Vec<_> = u2_path
            .iter()
            .filter(|m| a1_path.iter().any(|other| other.id() == m.id()))
            .map(|m| m.id())
            .collect();
        assert_eq!(shared, vec![r.as_str()]);
    }

    #[test]
    fn test_branches_share_prefix_then_diverge() {
        let (mut tree, r) = started("");
        let u = Message::user("question");
        let u_id = u.id().to_string();
        tree.append_message(&r, u).unwrap();

        let left = Message::assistant("left");
        let right = Message::assistant("right");
        let (left_id, right_id) = (left.id().to_string(), right.id().to_string());
        tree.append_message(&u_id, left).unwrap();
        tree.append_message(&u_id, right).unwrap();

        let left_path = tree.get_path_to_root(&left_id).unwrap();
        let right_path = tree.get_path_to_root(&right_id).unwrap();
        assert_eq!(&left_path[..2], &right_path[..2]);
        assert_ne!(left_path[2], right_path[2]);

        let children: Vec<_> = tree
            .find_node(&u_id)
            .unwrap()
            .children()
            .map(|c| c.message().content().to_string())
            .collect();
        assert_eq!(children, vec!["left", "right"]);
    }

    #[test]
    fn test_path_length_is_depth_plus_one() {
        let (mut tree, r) = started("");
        let mut parent = r.clone();
        for i in 0..50 {
            let msg = if i % 2 == 0 {
                Message::user(format!("u{}", i))
            } else {
                Message::assistant(format!("a{}", i))
            };
            let id = msg.id().to_string();
            tree.append_message(&parent, msg).unwrap();
            parent = id;
        }

        for node in tree.iter() {
            let path = tree.get_path_to_root(node.message().id()).unwrap();
            assert_eq!(path.len(), node.depth() + 1);
            assert_eq!(path[0].id(), r);
            assert_eq!(path.last().unwrap().id(), node.message().id());
        }
    }

    #[test]
    fn test_find_node_is_idempotent() {
        let (tree, r) = started("");
        let first = tree.find_node(&r).unwrap();
        let second = tree.find_node(&r).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message(), second.message());
    }

    #[test]
    fn test_find_missing_node() {
        let (tree, _) = started("");
        assert_eq!(
            tree.find_node("missing").unwrap_err(),
            TreeError::NodeNotFound {
                message_id: "missing".to_string()
            }
        );
        assert!(!tree.can_attach_to("missing"));
    }

    #[test]
    fn test_can_attach_agrees_with_find() {
        let (mut tree, r) = started("");
        let u = Message::user("x");
        let u_id = u.id().to_string();
        tree.append_message(&r, u).unwrap();

        for id in [r.as_str(), u_id.as_str(), "nope"] {
            assert_eq!(tree.can_attach_to(id), tree.find_node(id).is_ok());
        }
    }

    #[test]
    fn test_default_attach_point_only_before_first_reply() {
        let (mut tree, r) = started("");
        assert_eq!(tree.default_attach_point(), Some(r.as_str()));

        tree.append_message(&r, Message::user("first")).unwrap();
        assert_eq!(tree.default_attach_point(), None);
        assert!(ConversationTree::new().default_attach_point().is_none());
    }

    #[test]
    fn test_append_to_missing_parent() {
        let (mut tree, _) = started("");
        let err = tree.append_message("ghost", Message::user("x")).unwrap_err();
        assert!(matches!(err, TreeError::NodeNotFound { .. }));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_append_to_empty_tree() {
        let mut tree = ConversationTree::new();
        assert!(tree.append_message("any", Message::user("x")).is_err());
    }

    #[test]
    fn test_append_rejects_reused_id() {
        let (mut tree, r) = started("");
        let u = Message::user("x");
        tree.append_message(&r, u.clone()).unwrap();
        let err = tree.append_message(&r, u).unwrap_err();
        assert!(matches!(err, TreeError::InvalidOperation { .. }));
    }

    #[test]
    fn test_is_owned_by_is_strict() {
        let (tree, _) = started("");
        assert!(tree.is_owned_by("owner-1"));
        assert!(!tree.is_owned_by("owner-2"));
        assert!(!tree.is_owned_by("OWNER-1"));
        assert!(!ConversationTree::new().is_owned_by(""));
    }

    #[test]
    fn test_restore_ignores_embedded_owner() {
        let (mut tree, r) = started("");
        tree.append_message(&r, Message::user("x")).unwrap();
        let mut records = tree.flatten().unwrap();
        for record in &mut records {
            record.owner_id = "attacker".to_string();
        }

        let restored = ConversationTree::restore_from_records(&records).unwrap();
        assert!(restored.id().is_none());
        assert!(restored.owner_id().is_none());
        assert!(!restored.is_owned_by("attacker"));
    }

    #[test]
    fn test_stamp_identity_once() {
        let (tree, _) = started("");
        let mut restored = ConversationTree::restore_from_records(&tree.flatten().unwrap()).unwrap();
        restored.stamp_identity("tree-1", "owner-1").unwrap();
        assert!(restored.is_owned_by("owner-1"));

        let err = restored.stamp_identity("tree-1", "owner-2").unwrap_err();
        assert!(matches!(err, TreeError::InvalidOperation { .. }));
        assert!(restored.is_owned_by("owner-1"));
    }

    #[test]
    fn test_flatten_restore_round_trip() {
        let (mut tree, r) = started("system");
        let u1 = Message::user("Hi");
        let u1_id = u1.id().to_string();
        tree.append_message(&r, u1).unwrap();
        tree.append_message(&u1_id, Message::assistant("Hello!")).unwrap();
        tree.append_message(&r, Message::user("Hi again")).unwrap();

        let mut restored = ConversationTree::restore_from_records(&tree.flatten().unwrap()).unwrap();
        restored.stamp_identity("tree-1", "owner-1").unwrap();

        assert_eq!(restored.to_view(), tree.to_view());
        assert_eq!(restored.flatten().unwrap(), tree.flatten().unwrap());
    }

    #[test]
    fn test_flatten_requires_identity() {
        let (tree, _) = started("");
        let restored = ConversationTree::restore_from_records(&tree.flatten().unwrap()).unwrap();
        assert!(restored.flatten().is_err());
    }

    #[test]
    fn test_leaves_are_branch_tips() {
        let (mut tree, r) = started("");
        let u = Message::user("a");
        let u_id = u.id().to_string();
        tree.append_message(&r, u).unwrap();
        tree.append_message(&u_id, Message::assistant("b")).unwrap();
        tree.append_message(&r, Message::user("c")).unwrap();

        let mut tips: Vec<_> = tree
            .leaves()
            .iter()
            .map(|n| n.message().content().to_string())
            .collect();
        tips.sort();
        assert_eq!(tips, vec!["b", "c"]);
    }

    #[test]
    fn test_view_nests_children() {
        let (mut tree, r) = started("root");
        let u = Message::user("q");
        let u_id = u.id().to_string();
        tree.append_message(&r, u).unwrap();
        tree.append_message(&u_id, Message::assistant("a")).unwrap();

        let view = tree.to_view().unwrap();
        assert_eq!(view.content, "root");
        assert_eq!(view.children.len(), 1);
        assert_eq!(view.children[0].role, Role::User);
        assert_eq!(view.children[0].children[0].content, "a");

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["children"][0]["children"][0]["role"], "assistant");
        assert!(ConversationTree::new().to_view().is_none());
    }
}
