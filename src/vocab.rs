//! Maps (node_type, name) pairs to dense ids.  Both nodes and features use it; names are interned
//! since node types and feature namespaces repeat across millions of entries.
use hashbrown::HashMap;
use lasso::{Rodeo,Spur};

use crate::graph::NodeID;

#[derive(Debug,Default)]
pub struct Vocab {
    interner: Rodeo,
    vocab_to_idx: HashMap<(Spur, Spur), NodeID>,
    idx_to_vocab: Vec<(Spur, Spur)>
}

impl Vocab {
    pub fn new() -> Self {
        Vocab::default()
    }

    pub fn get_node_id(&self, node_type: &str, name: &str) -> Option<NodeID> {
        let nt = self.interner.get(node_type)?;
        let n = self.interner.get(name)?;
        self.vocab_to_idx.get(&(nt, n)).copied()
    }

    pub fn get_or_insert(&mut self, node_type: &str, name: &str) -> NodeID {
        let key = (self.interner.get_or_intern(node_type), self.interner.get_or_intern(name));
        if let Some(node_id) = self.vocab_to_idx.get(&key) {
            *node_id
        } else {
            let new_idx = self.idx_to_vocab.len();
            self.vocab_to_idx.insert(key, new_idx);
            self.idx_to_vocab.push(key);
            new_idx
        }
    }

    pub fn get_name(&self, node: NodeID) -> Option<(&str, &str)> {
        self.idx_to_vocab.get(node).map(|(nt, n)| {
            (self.interner.resolve(nt), self.interner.resolve(n))
        })
    }

    pub fn len(&self) -> usize {
        self.idx_to_vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_to_vocab.is_empty()
    }
}

#[cfg(test)]
mod vocab_tests {
    use super::*;

    #[test]
    fn test_insert_lookup() {
        let mut vocab = Vocab::new();
        let a = vocab.get_or_insert("user", "a");
        let b = vocab.get_or_insert("item", "a");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(vocab.get_or_insert("user", "a"), 0);
        assert_eq!(vocab.len(), 2);

        assert_eq!(vocab.get_node_id("item", "a"), Some(1));
        assert_eq!(vocab.get_node_id("item", "b"), None);
        assert_eq!(vocab.get_name(1), Some(("item", "a")));
        assert_eq!(vocab.get_name(2), None);
    }
}
