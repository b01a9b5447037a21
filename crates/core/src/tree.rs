use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Comment, CommentId};

/// Deepest level an answer may sit at below its thread root.
pub const MAX_THREAD_DEPTH: usize = 256;

/// A comment together with its nested answers.
///
/// Trees produced by [`CommentTree::build`] are at most [`MAX_THREAD_DEPTH`] levels deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTree {
    pub comment: Comment,
    pub answers: Vec<CommentTree>,
}

/// Errors raised when the stored parent links do not describe a valid tree.
///
/// These always point at inconsistent data in the store and are never repaired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("comment {id} references parent {parent} which is not part of the thread")]
    Orphan { id: CommentId, parent: CommentId },
    #[error("comment {0} has no parent but was returned as a descendant")]
    MissingParent(CommentId),
    #[error("comment {0} appears more than once in the thread")]
    Duplicate(CommentId),
    #[error("{0} comments are not reachable from the thread root")]
    Unreachable(usize),
    #[error("ancestor chain of comment {id} is broken at parent {parent}")]
    BrokenChain { id: CommentId, parent: CommentId },
    #[error("comment {id} is nested deeper than {limit} levels")]
    TooDeep { id: CommentId, limit: usize },
}

struct Slot {
    comment: Comment,
    children: Vec<usize>,
}

impl CommentTree {
    /// Creates a tree without answers.
    pub fn leaf(comment: Comment) -> Self {
        Self {
            comment,
            answers: Vec::new(),
        }
    }

    /// Builds the answer tree of `root` from the flat set of its transitive descendants.
    ///
    /// Nodes live in an arena and are linked through their ids; the owned tree is only
    /// assembled once every link has been resolved. Answers keep the input order.
    pub fn build(root: Comment, descendants: Vec<Comment>) -> Result<Self, TreeError> {
        let total = descendants.len();
        let mut index: HashMap<CommentId, usize> = HashMap::with_capacity(total);
        let mut arena: Vec<Slot> = Vec::with_capacity(total);

        for comment in descendants {
            if comment.id == root.id || index.contains_key(&comment.id) {
                return Err(TreeError::Duplicate(comment.id));
            }
            index.insert(comment.id, arena.len());
            arena.push(Slot {
                comment,
                children: Vec::new(),
            });
        }

        let mut root_children = Vec::new();
        for position in 0..arena.len() {
            let comment = &arena[position].comment;
            let parent = comment
                .parent_id
                .ok_or(TreeError::MissingParent(comment.id))?;

            if parent == root.id {
                root_children.push(position);
                continue;
            }

            let Some(&parent_position) = index.get(&parent) else {
                return Err(TreeError::Orphan {
                    id: comment.id,
                    parent,
                });
            };
            arena[parent_position].children.push(position);
        }

        // Depths are checked breadth-first before anything is nested.
        let mut placed = 0;
        let mut queue: VecDeque<(usize, usize)> =
            root_children.iter().map(|&position| (position, 1)).collect();
        while let Some((position, depth)) = queue.pop_front() {
            if depth > MAX_THREAD_DEPTH {
                return Err(TreeError::TooDeep {
                    id: arena[position].comment.id,
                    limit: MAX_THREAD_DEPTH,
                });
            }
            placed += 1;
            queue.extend(arena[position].children.iter().map(|&child| (child, depth + 1)));
        }

        // Cycles among descendants are never reached from the root.
        if placed != total {
            return Err(TreeError::Unreachable(total - placed));
        }

        let mut slots: Vec<Option<Slot>> = arena.into_iter().map(Some).collect();
        let answers = root_children
            .into_iter()
            .map(|position| assemble(&mut slots, position))
            .collect();

        Ok(Self {
            comment: root,
            answers,
        })
    }

    /// Number of comments in the tree, including the root.
    pub fn size(&self) -> usize {
        1 + self.answers.iter().map(CommentTree::size).sum::<usize>()
    }

    /// Returns every descendant in depth-first order, excluding the root.
    pub fn descendants(&self) -> Vec<&Comment> {
        let mut out = Vec::with_capacity(self.size() - 1);
        let mut stack: Vec<&CommentTree> = self.answers.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(&node.comment);
            stack.extend(node.answers.iter().rev());
        }
        out
    }

    /// Returns mutable references to every comment in the tree, root first.
    pub fn comments_mut(&mut self) -> Vec<&mut Comment> {
        let mut out = Vec::new();
        let mut stack: Vec<&mut CommentTree> = vec![self];
        while let Some(node) = stack.pop() {
            let CommentTree { comment, answers } = node;
            out.push(comment);
            stack.extend(answers.iter_mut().rev());
        }
        out
    }

    /// Drops all answers, keeping only the root comment.
    pub fn truncate(&mut self) {
        self.answers.clear();
    }

    /// Projects the tree for external consumers. Without `recurse` the answers are omitted.
    pub fn to_view(&self, recurse: bool) -> CommentTreeView {
        CommentTreeView {
            comment: CommentView::from(&self.comment),
            answers: if recurse {
                self.answers
                    .iter()
                    .map(|answer| answer.to_view(true))
                    .collect()
            } else {
                Vec::new()
            },
        }
    }
}

fn assemble(slots: &mut [Option<Slot>], position: usize) -> CommentTree {
    let Some(slot) = slots[position].take() else {
        unreachable!("each slot has exactly one parent");
    };
    let answers = slot
        .children
        .into_iter()
        .map(|child| assemble(slots, child))
        .collect();
    CommentTree {
        comment: slot.comment,
        answers,
    }
}

/// Orders the unordered path set returned by the store into the ancestor chain of
/// `comment`, closest parent first and thread root last.
pub fn ancestor_chain(comment: &Comment, path: Vec<Comment>) -> Result<Vec<Comment>, TreeError> {
    let mut by_id: HashMap<CommentId, Comment> = path
        .into_iter()
        .filter(|entry| entry.id != comment.id)
        .map(|entry| (entry.id, entry))
        .collect();

    let mut chain = Vec::with_capacity(by_id.len());
    let mut cursor = comment.parent_id;
    let mut child = comment.id;
    while let Some(parent) = cursor {
        let Some(entry) = by_id.remove(&parent) else {
            return Err(TreeError::BrokenChain { id: child, parent });
        };
        child = entry.id;
        cursor = entry.parent_id;
        chain.push(entry);
    }

    Ok(chain)
}

/// Externally visible projection of a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentView {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub creator_id: String,
}

impl From<&Comment> for CommentView {
    fn from(comment: &Comment) -> Self {
        Self {
            id: comment.id.to_string(),
            scope: Some(comment.scope.clone()),
            reference: comment.reference.clone(),
            content: comment.content.clone(),
            parent_id: comment.parent_id.map(|id| id.to_string()),
            created_at: comment.created_at,
            creator_id: comment.creator_id.clone(),
        }
    }
}

/// Externally visible projection of a [`CommentTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentTreeView {
    pub comment: CommentView,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<CommentTreeView>,
}

impl CommentTreeView {
    /// Strips scope, parent and reference from every node below the root; they are
    /// implied by the nesting.
    pub fn minify(mut self) -> Self {
        for answer in &mut self.answers {
            answer.strip();
        }
        self
    }

    fn strip(&mut self) {
        self.comment.scope = None;
        self.comment.parent_id = None;
        self.comment.reference = None;
        for answer in &mut self.answers {
            answer.strip();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn root() -> Comment {
        Comment::new_root(
            "tickets",
            Some("t-1".to_string()),
            "root",
            "alice",
            Utc::now(),
        )
    }

    fn reply(parent: &Comment, author: &str) -> Comment {
        Comment::new_reply(parent, format!("reply by {author}"), author, Utc::now())
    }

    #[test]
    fn nests_answers_under_their_parents() {
        let root = root();
        let a = reply(&root, "bob");
        let b = reply(&root, "carol");
        let a1 = reply(&a, "dave");
        let a1x = reply(&a1, "erin");

        // deliberately out of order
        let tree = CommentTree::build(
            root.clone(),
            vec![a1x.clone(), a.clone(), a1.clone(), b.clone()],
        )
        .expect("valid tree");

        assert_eq!(tree.comment.id, root.id);
        assert_eq!(tree.answers.len(), 2);
        assert_eq!(tree.answers[0].comment.id, a.id);
        assert_eq!(tree.answers[1].comment.id, b.id);
        assert_eq!(tree.answers[0].answers[0].comment.id, a1.id);
        assert_eq!(tree.answers[0].answers[0].answers[0].comment.id, a1x.id);
        assert_eq!(tree.size(), 5);
    }

    #[test]
    fn flattening_preserves_the_descendant_set() {
        let root = root();
        let mut flat = Vec::new();
        let mut parents = vec![root.clone()];
        for i in 0..25 {
            let parent = parents[(i * 7) % parents.len()].clone();
            let child = reply(&parent, &format!("user-{i}"));
            parents.push(child.clone());
            flat.push(child);
        }

        let expected: HashSet<CommentId> = flat.iter().map(|c| c.id).collect();
        let tree = CommentTree::build(root, flat.clone()).expect("valid tree");
        let flattened = tree.descendants();

        assert_eq!(flattened.len(), flat.len());
        let seen: HashSet<CommentId> = flattened.iter().map(|c| c.id).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn keeps_insertion_order_of_siblings() {
        let root = root();
        let mut later = reply(&root, "bob");
        later.created_at = Utc::now() + Duration::hours(1);
        let earlier = reply(&root, "carol");

        let tree = CommentTree::build(root, vec![later.clone(), earlier.clone()]).unwrap();
        let order: Vec<_> = tree.answers.iter().map(|t| t.comment.id).collect();
        assert_eq!(order, vec![later.id, earlier.id]);
    }

    #[test]
    fn orphan_reference_is_a_structural_error() {
        let root = root();
        let other_thread = Comment::new_root("tickets", None, "other", "zoe", Utc::now());
        let stray = reply(&other_thread, "bob");
        let fine = reply(&root, "carol");

        let err = CommentTree::build(root, vec![fine, stray.clone()]).unwrap_err();
        assert_eq!(
            err,
            TreeError::Orphan {
                id: stray.id,
                parent: other_thread.id
            }
        );
    }

    #[test]
    fn cycles_are_reported_instead_of_dropped() {
        let root = root();
        let mut a = reply(&root, "bob");
        let b = reply(&a, "carol");
        a.parent_id = Some(b.id);

        let err = CommentTree::build(root, vec![a, b]).unwrap_err();
        assert_eq!(err, TreeError::Unreachable(2));
    }

    fn chain(root: &Comment, length: usize) -> Vec<Comment> {
        let mut out: Vec<Comment> = Vec::with_capacity(length);
        for _ in 0..length {
            let parent = out.last().unwrap_or(root);
            let child = reply(parent, "bob");
            out.push(child);
        }
        out
    }

    #[test]
    fn chains_past_the_depth_limit_are_rejected() {
        let root = root();
        let deep = chain(&root, 10_000);
        let first_too_deep = deep[MAX_THREAD_DEPTH].id;

        let err = CommentTree::build(root, deep).unwrap_err();
        assert_eq!(
            err,
            TreeError::TooDeep {
                id: first_too_deep,
                limit: MAX_THREAD_DEPTH
            }
        );
    }

    #[test]
    fn chain_at_the_depth_limit_projects_and_serializes() {
        let root = root();
        let deep = chain(&root, MAX_THREAD_DEPTH);

        let tree = CommentTree::build(root, deep).expect("within limit");
        assert_eq!(tree.size(), MAX_THREAD_DEPTH + 1);

        let view = tree.to_view(true).minify();
        let mut depth = 0;
        let mut node = &view;
        while let Some(answer) = node.answers.first() {
            assert!(answer.comment.parent_id.is_none());
            depth += 1;
            node = answer;
        }
        assert_eq!(depth, MAX_THREAD_DEPTH);
        assert!(serde_json::to_string(&view).is_ok());
    }

    #[test]
    fn duplicate_descendants_are_rejected() {
        let root = root();
        let a = reply(&root, "bob");
        let err = CommentTree::build(root, vec![a.clone(), a.clone()]).unwrap_err();
        assert_eq!(err, TreeError::Duplicate(a.id));
    }

    #[test]
    fn ancestor_chain_runs_from_parent_to_root() {
        let root = root();
        let a = reply(&root, "bob");
        let b = reply(&a, "carol");
        let c = reply(&b, "dave");

        let chain = ancestor_chain(&c, vec![root.clone(), c.clone(), b.clone(), a.clone()])
            .expect("chain");
        let ids: Vec<_> = chain.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, a.id, root.id]);

        assert!(ancestor_chain(&root, vec![root.clone()]).unwrap().is_empty());
    }

    #[test]
    fn ancestor_chain_detects_missing_links() {
        let root = root();
        let a = reply(&root, "bob");
        let b = reply(&a, "carol");

        let err = ancestor_chain(&b, vec![root]).unwrap_err();
        assert_eq!(
            err,
            TreeError::BrokenChain {
                id: b.id,
                parent: a.id
            }
        );
    }

    #[test]
    fn minify_only_keeps_root_metadata() {
        let root = root();
        let a = reply(&root, "bob");
        let a1 = reply(&a, "carol");
        let tree = CommentTree::build(root.clone(), vec![a, a1]).unwrap();

        let view = tree.to_view(true).minify();
        assert_eq!(view.comment.scope.as_deref(), Some("tickets"));
        assert_eq!(view.comment.reference.as_deref(), Some("t-1"));

        let child = &view.answers[0];
        let grandchild = &child.answers[0];
        for node in [child, grandchild] {
            assert!(node.comment.scope.is_none());
            assert!(node.comment.parent_id.is_none());
            assert!(node.comment.reference.is_none());
            assert!(!node.comment.creator_id.is_empty());
        }

        let json = serde_json::to_value(&view).unwrap();
        assert!(json["answers"][0]["comment"].get("scope").is_none());
        assert_eq!(json["comment"]["scope"], "tickets");
    }

    #[test]
    fn non_recursive_view_omits_answers() {
        let root = root();
        let a = reply(&root, "bob");
        let tree = CommentTree::build(root, vec![a]).unwrap();
        assert!(tree.to_view(false).answers.is_empty());
    }

    #[test]
    fn comments_mut_visits_every_node() {
        let root = root();
        let a = reply(&root, "bob");
        let b = reply(&a, "carol");
        let mut tree = CommentTree::build(root, vec![a, b]).unwrap();
        for comment in tree.comments_mut() {
            comment.content = comment.content.to_uppercase();
        }
        assert_eq!(tree.answers[0].answers[0].comment.content, "REPLY BY CAROL");
        assert_eq!(tree.comment.content, "ROOT");
    }
}
