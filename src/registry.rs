//! Book-keeping for operations the device has not finished yet.

use std::fmt;
use std::mem;
use std::sync::Arc;

use slab::Slab;

use crate::device::Handle;

/// Identifies one in-flight operation.
///
/// Tokens carry the generation of the registry that issued them, so a token
/// left over from a closed session never matches an operation of a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token {
    index: usize,
    generation: u64,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.generation, self.index)
    }
}

/// An operation the device still owns.
pub(crate) struct Entry<H: Handle> {
    /// The handle the operation was submitted on.
    pub(crate) handle: Arc<H>,
    pub(crate) context: Arc<H::Context>,
}

/// Maps tokens to in-flight operations.
///
/// Not synchronized itself; it lives inside the port's state mutex together
/// with the handle, so registering and submitting happen as one step.
pub(crate) struct Registry<H: Handle> {
    ops: Slab<Entry<H>>,
    generation: u64,
}

impl<H: Handle> Registry<H> {
    pub(crate) fn new() -> Registry<H> {
        Registry {
            ops: Slab::new(),
            generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, handle: Arc<H>, context: Arc<H::Context>) -> Token {
        let index = self.ops.insert(Entry { handle, context });
        Token {
            index,
            generation: self.generation,
        }
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Entry<H>> {
        if token.generation != self.generation {
            return None;
        }
        self.ops.get(token.index)
    }

    pub(crate) fn remove(&mut self, token: Token) -> Option<Entry<H>> {
        if token.generation != self.generation {
            return None;
        }
        self.ops.try_remove(token.index)
    }

    /// Empties the registry and retires every token issued so far.
    pub(crate) fn take_all(&mut self) -> Vec<(Token, Entry<H>)> {
        let generation = self.generation;
        self.generation = self.generation.wrapping_add(1);
        mem::take(&mut self.ops)
            .into_iter()
            .map(|(index, entry)| (Token { index, generation }, entry))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}
