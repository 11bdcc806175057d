// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Command lists and their recycling pool.

A frame records work into one or more *branches*: independent recording streams identified by
a small integer (e.g. one per pass, or one per recording thread).  Each branch is a chain of
command lists.  When the frame's slot comes around again and its fence has been waited on, every
list in every branch is reset and handed back to a [`CommandListPool`] so the next frame can
record into it without allocating.
*/

/// A recording stream whose storage can be reused once the GPU is done with it.
pub trait CommandList {
    /// Discards recorded commands, keeping any allocated storage.
    fn reset(&mut self);
}

/// Recycled command lists waiting to be recorded into again.
#[derive(Debug)]
pub struct CommandListPool<C> {
    available: Vec<C>,
    released: u64,
}

impl<C> Default for CommandListPool<C> {
    fn default() -> Self {
        CommandListPool {
            available: Vec::new(),
            released: 0,
        }
    }
}

impl<C: CommandList> CommandListPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reset list out of the pool, if any are available.
    pub fn acquire(&mut self) -> Option<C> {
        self.available.pop()
    }

    /// Resets `list` and makes it available again.
    pub fn release(&mut self, mut list: C) {
        list.reset();
        self.released += 1;
        self.available.push(list);
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Total number of lists ever returned to the pool.
    pub fn released_count(&self) -> u64 {
        self.released
    }
}

/**
Per-frame chains of tracked command lists, indexed by branch.

Branches are created on demand when a list is tracked under an index beyond the current count.
*/
#[derive(Debug)]
pub(crate) struct Branches<C> {
    chains: Vec<Vec<C>>,
}

impl<C> Default for Branches<C> {
    fn default() -> Self {
        Branches { chains: Vec::new() }
    }
}

impl<C: CommandList> Branches<C> {
    pub fn track(&mut self, branch: usize, list: C) {
        if branch >= self.chains.len() {
            self.chains.resize_with(branch + 1, Vec::new);
        }
        self.chains[branch].push(list);
    }

    pub fn branch_count(&self) -> usize {
        self.chains.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.chains.iter().map(Vec::len).sum()
    }

    pub fn branch_len(&self, branch: usize) -> usize {
        self.chains.get(branch).map_or(0, Vec::len)
    }

    /// Hands every tracked list back to `pool`, newest first within each branch.
    pub fn release_into(&mut self, pool: &mut CommandListPool<C>) {
        for chain in &mut self.chains {
            while let Some(list) = chain.pop() {
                pool.release(list);
            }
        }
        self.chains.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Recorded {
        id: u32,
        commands: Vec<&'static str>,
    }

    impl CommandList for Recorded {
        fn reset(&mut self) {
            self.commands.clear();
        }
    }

    #[test]
    fn branches_grow_on_demand() {
        let mut branches = Branches::default();
        branches.track(
            3,
            Recorded {
                id: 0,
                commands: vec!["draw"],
            },
        );
        assert_eq!(branches.branch_count(), 4);
        assert_eq!(branches.branch_len(3), 1);
        assert_eq!(branches.branch_len(0), 0);
        assert_eq!(branches.branch_len(9), 0);
    }

    #[test]
    fn release_resets_newest_first() {
        let mut branches = Branches::default();
        for id in 0..3 {
            branches.track(
                0,
                Recorded {
                    id,
                    commands: vec!["dispatch"],
                },
            );
        }
        let mut pool = CommandListPool::new();
        branches.release_into(&mut pool);
        assert_eq!(branches.tracked_count(), 0);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.released_count(), 3);
        //the oldest list was released last, so it is reused first
        let reused = pool.acquire().unwrap();
        assert_eq!(reused.id, 0);
        assert!(reused.commands.is_empty());
    }
}
