use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::primitives::SpinLock;

pub(crate) const IN_OLIST: u8 = 0x1;
pub(crate) const IN_DLIST: u8 = 0x2;
pub(crate) const DEAD: u8 = 0x4;

pub type DeleteCb = Arc<dyn Fn(&[u8], &(dyn Any + Send + Sync)) + Send + Sync>;

pub(crate) struct LeafState {
    pub(crate) key: Vec<u8>,
    pub(crate) data: Box<dyn Any + Send + Sync>,
    pub(crate) delete_cb: Option<DeleteCb>,
    pub(crate) ts: Instant,
}

/// A node in the bit-sliced trie. Every node has a `children` list
/// (empty for leaves); only a leaf's `leaf` field is `Some`.
///
/// When a new key collides with an existing leaf at the leaf's level,
/// the leaf's [`LeafState`] moves into a freshly created child one level
/// deeper (`leaf` becomes `None` on the original node, which stays in
/// the tree as a purely structural internal node). This sidesteps the
/// original's self-referential `key_ref` pointer entirely: nothing here
/// ever needs to borrow another node's key, because every place that
/// would dereference `key_ref` already holds the leaf in question
/// directly.
pub(crate) struct Node {
    pub(crate) parent: Option<Arc<Node>>,
    pub(crate) id: u32,
    pub(crate) level: i32,
    pub(crate) children: SpinLock<Vec<Arc<Node>>>,
    pub(crate) leaf: Mutex<Option<LeafState>>,
    mask: AtomicU8,
}

impl Node {
    pub(crate) fn root() -> Arc<Node> {
        Arc::new(Node {
            parent: None,
            id: 0,
            level: -1,
            children: SpinLock::new(Vec::new()),
            leaf: Mutex::new(None),
            mask: AtomicU8::new(0),
        })
    }

    pub(crate) fn new_leaf(parent: Arc<Node>, id: u32, level: i32, state: LeafState) -> Arc<Node> {
        Arc::new(Node {
            parent: Some(parent),
            id,
            level,
            children: SpinLock::new(Vec::new()),
            leaf: Mutex::new(Some(state)),
            mask: AtomicU8::new(IN_OLIST),
        })
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf.lock().unwrap().is_some()
    }

    pub(crate) fn mask_has(&self, bit: u8) -> bool {
        self.mask.load(Ordering::SeqCst) & bit != 0
    }

    pub(crate) fn mask_set(&self, bit: u8) {
        self.mask.fetch_or(bit, Ordering::SeqCst);
    }

    pub(crate) fn mask_clear(&self, bit: u8) {
        self.mask.fetch_and(!bit, Ordering::SeqCst);
    }
}
