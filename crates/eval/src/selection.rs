//! Document arena and selection results.
//!
//! A document is flattened into an [`Arena`] of nodes addressed by
//! [`NodeId`]. Nodes are allocated in document pre-order, so comparing ids
//! of original nodes compares their document position. A selected node may
//! carry a [`Handle`], the (parent, slot) pair through which it can be
//! replaced or removed. Mutations allocate new nodes and rewire only the
//! parent slot; the source JSON is never touched.

use serde_json::Value as Json;

use crate::error::EvalError;
use crate::value::Val;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Json),
    Array(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
}

/// Position of a child inside its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Index(usize),
    Key(String),
}

/// Mutation handle: the parent node and the slot a child occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub parent: NodeId,
    pub slot: Slot,
}

/// One selected node and, when it has a parent, its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub node: NodeId,
    pub handle: Option<Handle>,
}

impl Selected {
    pub fn root(node: NodeId) -> Self {
        Selected { node, handle: None }
    }

    pub fn child(node: NodeId, parent: NodeId, slot: Slot) -> Self {
        Selected {
            node,
            handle: Some(Handle { parent, slot }),
        }
    }
}

/// Outcome of a step chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The chain narrowed to no result (undefined).
    Nothing,
    Single(Selected),
    /// A fan-out, in document order.
    Multiple(Vec<Selected>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena holding `value`, returning it with the root id.
    pub fn from_json(value: &Json) -> (Self, NodeId) {
        let mut arena = Arena::new();
        let root = arena.insert(value);
        (arena, root)
    }

    /// Allocate `value` and all of its descendants in pre-order.
    pub fn insert(&mut self, value: &Json) -> NodeId {
        let id = self.nodes.len();
        match value {
            Json::Array(items) => {
                self.nodes.push(Node::Array(Vec::with_capacity(items.len())));
                let children: Vec<NodeId> = items.iter().map(|item| self.insert(item)).collect();
                self.nodes[id] = Node::Array(children);
            }
            Json::Object(members) => {
                self.nodes.push(Node::Object(Vec::with_capacity(members.len())));
                let children: Vec<(String, NodeId)> = members
                    .iter()
                    .map(|(k, v)| (k.clone(), self.insert(v)))
                    .collect();
                self.nodes[id] = Node::Object(children);
            }
            scalar => self.nodes.push(Node::Scalar(scalar.clone())),
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn is_array(&self, id: NodeId) -> bool {
        matches!(self.nodes[id], Node::Array(_))
    }

    pub fn is_object(&self, id: NodeId) -> bool {
        matches!(self.nodes[id], Node::Object(_))
    }

    pub fn kind(&self, id: NodeId) -> &'static str {
        match &self.nodes[id] {
            Node::Scalar(v) => crate::value::json_kind(v),
            Node::Array(_) => "array",
            Node::Object(_) => "object",
        }
    }

    /// Rebuild the JSON value rooted at `id`.
    pub fn to_json(&self, id: NodeId) -> Json {
        match &self.nodes[id] {
            Node::Scalar(v) => v.clone(),
            Node::Array(children) => Json::Array(children.iter().map(|c| self.to_json(*c)).collect()),
            Node::Object(members) => Json::Object(
                members
                    .iter()
                    .map(|(k, c)| (k.clone(), self.to_json(*c)))
                    .collect(),
            ),
        }
    }

    /// Direct children of `id` with their handles, in document order.
    pub fn children(&self, id: NodeId) -> Vec<Selected> {
        match &self.nodes[id] {
            Node::Scalar(_) => Vec::new(),
            Node::Array(children) => children
                .iter()
                .enumerate()
                .map(|(i, c)| Selected::child(*c, id, Slot::Index(i)))
                .collect(),
            Node::Object(members) => members
                .iter()
                .map(|(k, c)| Selected::child(*c, id, Slot::Key(k.clone())))
                .collect(),
        }
    }

    /// Child of an object by key.
    pub fn member(&self, id: NodeId, key: &str) -> Option<Selected> {
        match &self.nodes[id] {
            Node::Object(members) => members
                .iter()
                .find(|(k, _)| k == key)
                .map(|(k, c)| Selected::child(*c, id, Slot::Key(k.clone()))),
            _ => None,
        }
    }

    /// Child of an array by position; negative positions count from the end.
    pub fn element(&self, id: NodeId, index: i64) -> Result<Selected, EvalError> {
        match &self.nodes[id] {
            Node::Array(children) => {
                let i = normalize_index(index, children.len()).ok_or(EvalError::IndexOutOfRange {
                    index,
                    len: children.len(),
                })?;
                Ok(Selected::child(children[i], id, Slot::Index(i)))
            }
            _ => Err(EvalError::type_mismatch(format!(
                "index step expects an array, got {}",
                self.kind(id)
            ))),
        }
    }

    /// All descendants of `id` (excluding `id`) in pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<Selected> {
        let mut out = Vec::new();
        self.collect_descendants(id, &mut out);
        out
    }

    fn collect_descendants(&self, id: NodeId, out: &mut Vec<Selected>) {
        for child in self.children(id) {
            let node = child.node;
            out.push(child);
            self.collect_descendants(node, out);
        }
    }

    /// `id` followed by all of its descendants, in pre-order.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        out.extend(self.descendants(id).into_iter().map(|s| s.node));
        out
    }

    /// Point the handle's slot at a freshly allocated copy of `value`.
    pub fn replace(&mut self, handle: &Handle, value: &Json) -> Result<NodeId, EvalError> {
        let new_id = self.insert(value);
        let slot_ref = match (&mut self.nodes[handle.parent], &handle.slot) {
            (Node::Array(children), Slot::Index(i)) => children.get_mut(*i),
            (Node::Object(members), Slot::Key(k)) => {
                members.iter_mut().find(|(key, _)| key == k).map(|(_, c)| c)
            }
            _ => None,
        };
        match slot_ref {
            Some(slot) => {
                *slot = new_id;
                Ok(new_id)
            }
            None => Err(stale_handle(handle)),
        }
    }

    /// Detach the handle's slot from its parent. Later array elements shift down.
    pub fn remove(&mut self, handle: &Handle) -> Result<(), EvalError> {
        match (&mut self.nodes[handle.parent], &handle.slot) {
            (Node::Array(children), Slot::Index(i)) if *i < children.len() => {
                children.remove(*i);
                Ok(())
            }
            (Node::Object(members), Slot::Key(k)) => {
                let before = members.len();
                members.retain(|(key, _)| key != k);
                if members.len() == before {
                    Err(stale_handle(handle))
                } else {
                    Ok(())
                }
            }
            _ => Err(stale_handle(handle)),
        }
    }
}

fn stale_handle(handle: &Handle) -> EvalError {
    EvalError::filter_target(format!(
        "selection handle {:?} of node {} no longer resolves",
        handle.slot, handle.parent
    ))
}

/// Map a possibly negative index onto `0..len`.
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { len + index } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

/// A step chain's result bound to the arena it points into.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub arena: std::sync::Arc<Arena>,
    pub root: NodeId,
    pub selection: Selection,
}

impl Resolved {
    /// Start a chain at `value`. Undefined starts with no result.
    pub fn from_val(value: &Val) -> Resolved {
        match value.get() {
            Some(json) => {
                let (arena, root) = Arena::from_json(json);
                Resolved {
                    arena: std::sync::Arc::new(arena),
                    root,
                    selection: Selection::Single(Selected::root(root)),
                }
            }
            None => Resolved {
                arena: std::sync::Arc::new(Arena::new()),
                root: 0,
                selection: Selection::Nothing,
            },
        }
    }

    pub fn with_selection(&self, selection: Selection) -> Resolved {
        Resolved {
            arena: self.arena.clone(),
            root: self.root,
            selection,
        }
    }

    /// The selected value: undefined, the single node, or an array of the
    /// fanned-out nodes.
    pub fn value(&self) -> Val {
        match &self.selection {
            Selection::Nothing => Val::Undefined,
            Selection::Single(s) => Val::of(self.arena.to_json(s.node)),
            Selection::Multiple(items) => Val::of(Json::Array(
                items.iter().map(|s| self.arena.to_json(s.node)).collect(),
            )),
        }
    }

    /// The whole document the selection points into.
    pub fn document(&self) -> Val {
        match self.selection {
            Selection::Nothing if self.arena.nodes.is_empty() => Val::Undefined,
            _ => Val::of(self.arena.to_json(self.root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_follow_document_preorder() {
        let (arena, root) = Arena::from_json(&json!({"a": [1, 2], "b": {"c": 3}}));
        assert_eq!(root, 0);
        let order: Vec<Json> = arena.subtree(root).iter().map(|id| arena.to_json(*id)).collect();
        assert_eq!(
            order,
            vec![
                json!({"a": [1, 2], "b": {"c": 3}}),
                json!([1, 2]),
                json!(1),
                json!(2),
                json!({"c": 3}),
                json!(3)
            ]
        );
    }

    #[test]
    fn replace_rewires_only_the_parent_slot() {
        let source = json!({"a": [1, 2], "b": "x"});
        let (mut arena, root) = Arena::from_json(&source);
        let a = arena.member(root, "a").unwrap();
        let second = arena.element(a.node, -1).unwrap();
        arena.replace(second.handle.as_ref().unwrap(), &json!({"n": 2})).unwrap();
        assert_eq!(arena.to_json(root), json!({"a": [1, {"n": 2}], "b": "x"}));
        assert_eq!(source, json!({"a": [1, 2], "b": "x"}));
    }

    #[test]
    fn remove_shifts_array_and_drops_keys() {
        let (mut arena, root) = Arena::from_json(&json!({"a": [1, 2, 3], "b": true}));
        let a = arena.member(root, "a").unwrap();
        let first = arena.element(a.node, 0).unwrap();
        arena.remove(first.handle.as_ref().unwrap()).unwrap();
        let b = arena.member(root, "b").unwrap();
        arena.remove(b.handle.as_ref().unwrap()).unwrap();
        assert_eq!(arena.to_json(root), json!({"a": [2, 3]}));
    }

    #[test]
    fn stale_handles_are_reported() {
        let (mut arena, root) = Arena::from_json(&json!([1]));
        let handle = Handle {
            parent: root,
            slot: Slot::Index(3),
        };
        assert!(matches!(
            arena.remove(&handle),
            Err(EvalError::FilterTargetError { .. })
        ));
        assert!(arena.replace(&handle, &json!(0)).is_err());
    }

    #[test]
    fn element_bounds_and_kind() {
        let (arena, root) = Arena::from_json(&json!([10, 20]));
        assert_eq!(arena.to_json(arena.element(root, -2).unwrap().node), json!(10));
        assert_eq!(
            arena.element(root, 2),
            Err(EvalError::IndexOutOfRange { index: 2, len: 2 })
        );
        let (obj, obj_root) = Arena::from_json(&json!({}));
        assert!(matches!(
            obj.element(obj_root, 0),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn normalize_index_handles_negatives() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(0, 0), None);
    }

    #[test]
    fn resolved_value_of_fan_out_is_an_array() {
        let start = Resolved::from_val(&Val::of(json!({"a": 1, "b": 2})));
        let root = start.root;
        let fan = start.with_selection(Selection::Multiple(start.arena.children(root)));
        assert_eq!(fan.value(), Val::of(json!([1, 2])));
        assert_eq!(Resolved::from_val(&Val::Undefined).value(), Val::Undefined);
    }
}
