//! Coalescing free-list arenas for mid-size requests.
//!
//! An arena is a contiguous committed range carved into variable-size blocks.
//! Free blocks form a singly linked list sorted by address; each free block
//! starts with a node `[size][next]`. An allocated block starts with
//! `padding - HEADER_SIZE` unused bytes followed by the header
//! `[block_size][padding]`, then the payload:
//!
//! ```text
//! block start                       payload
//! |<------------- padding ------------>|
//! [ alignment slack ][block_size][padding][ payload ... ]
//! ```
//!
//! Freeing rebuilds the node at `payload - padding`, so the alignment slack
//! goes back to the list with the rest of the block.

use super::error::AllocError;
use super::reservation::{Region, WORD};

/// Bytes of the allocation header that precedes every payload.
pub const HEADER_SIZE: usize = 2 * WORD;

/// Smallest free node: `[size][next]`.
pub const NODE_SIZE: usize = 2 * WORD;

/// End-of-list marker in a node's `next` word.
const NIL: usize = usize::MAX;

/// A free node as seen from outside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeNode {
    /// Reservation offset of the node.
    pub offset: usize,
    pub size: usize,
}

/// Snapshot of one arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeListStats {
    pub capacity: usize,
    pub in_use: usize,
    pub free_nodes: usize,
    pub largest_free_node: usize,
}

/// Node picked by the search, with what it takes to carve from it.
struct Fit {
    node: usize,
    prev: Option<usize>,
    size: usize,
    padding: usize,
}

pub(crate) struct FreeListArena {
    /// Reservation offset of the first byte.
    start: usize,
    capacity: usize,
    /// Bytes currently handed out, headers and slack included.
    in_use: usize,
    alignment: usize,
    head: Option<usize>,
}

impl FreeListArena {
    /// Lay one free node over `[start, start + capacity)`.
    pub fn new(region: &mut Region<'_>, start: usize, capacity: usize, alignment: usize) -> Self {
        debug_assert!(capacity >= NODE_SIZE && capacity.is_multiple_of(WORD));
        let mut arena = Self {
            start,
            capacity,
            in_use: 0,
            alignment,
            head: None,
        };
        arena.reset(region);
        arena
    }

    /// Throw away every block and go back to a single free node.
    pub fn reset(&mut self, region: &mut Region<'_>) {
        write_node(region, self.start, self.capacity, NIL);
        self.head = Some(self.start);
        self.in_use = 0;
    }

    #[inline]
    fn end(&self) -> usize {
        self.start + self.capacity
    }

    /// True when `offset` lies inside the arena range.
    #[inline]
    #[must_use]
    pub fn contains(&self, offset: usize) -> bool {
        (self.start..self.end()).contains(&offset)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Distance from `node` to the first aligned payload that leaves room
    /// for a header.
    fn padding_for(&self, region: &Region<'_>, node: usize) -> usize {
        let addr = region.addr_of(node);
        (addr + HEADER_SIZE).next_multiple_of(self.alignment) - addr
    }

    /// Scan the whole list and keep the *last* node big enough.
    fn find(&self, region: &Region<'_>, size: usize) -> Option<Fit> {
        let mut fit = None;
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(node) = cursor {
            let node_size = region.read_word(node);
            let padding = self.padding_for(region, node);
            if node_size >= size.saturating_add(padding) {
                fit = Some(Fit {
                    node,
                    prev,
                    size: node_size,
                    padding,
                });
            }
            prev = Some(node);
            cursor = next_of(region, node);
        }
        fit
    }

    /// Carve `size` payload bytes out of the list.
    ///
    /// Returns the payload offset, or `None` with nothing changed when no
    /// node can hold the request.
    pub fn allocate(&mut self, region: &mut Region<'_>, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(WORD)?;
        let fit = self.find(region, size)?;

        let mut required = size + fit.padding;
        if self.in_use + required > self.capacity {
            return None;
        }

        let rest = fit.size - required;
        let next = region.read_word(fit.node + WORD);
        let successor = if rest >= NODE_SIZE {
            let remainder = fit.node + required;
            write_node(region, remainder, rest, next);
            remainder
        } else {
            // Too small to stand alone; the slack rides along with the block.
            required = fit.size;
            next
        };
        self.link(region, fit.prev, successor);

        let payload = fit.node + fit.padding;
        region.write_word(payload - 2 * WORD, required);
        region.write_word(payload - WORD, fit.padding);
        self.in_use += required;

        log::trace!(
            "arena {:#x}: {required} bytes at {:#x} (payload {payload:#x})",
            self.start,
            fit.node
        );
        Some(payload)
    }

    /// Give a block back and merge it with adjacent free nodes.
    ///
    /// Returns the block size released.
    ///
    /// # Errors
    ///
    /// `DoubleFree` if the block is already (partly) on the free list,
    /// `ForeignPointer` if the header does not describe a block of this
    /// arena. The list is untouched on error.
    pub fn free(&mut self, region: &mut Region<'_>, payload: usize) -> Result<usize, AllocError> {
        let foreign = || AllocError::ForeignPointer {
            addr: region.addr_of(payload),
        };
        if payload < self.start + HEADER_SIZE || payload >= self.end() {
            return Err(foreign());
        }

        // A payload inside a free node means its header was already consumed
        // by a previous free.
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if (node..node + region.read_word(node)).contains(&payload) {
                return Err(AllocError::DoubleFree {
                    addr: region.addr_of(payload),
                });
            }
            cursor = next_of(region, node);
        }

        let block_size = region.read_word(payload - 2 * WORD);
        let padding = region.read_word(payload - WORD);
        let header_ok = padding >= HEADER_SIZE
            && padding < HEADER_SIZE + self.alignment
            && payload.checked_sub(padding).is_some_and(|b| b >= self.start)
            && block_size >= NODE_SIZE
            && block_size > padding
            && block_size.is_multiple_of(WORD)
            && block_size <= self.in_use
            && (payload - padding)
                .checked_add(block_size)
                .is_some_and(|end| end <= self.end());
        if !header_ok {
            return Err(foreign());
        }
        let block = payload - padding;

        // Find the neighbours in address order.
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if node > block {
                break;
            }
            prev = Some(node);
            cursor = next_of(region, node);
        }
        let next = cursor;

        let overlaps_prev = prev.is_some_and(|p| p + region.read_word(p) > block);
        let overlaps_next = next.is_some_and(|n| block + block_size > n);
        if overlaps_prev || overlaps_next {
            return Err(AllocError::DoubleFree {
                addr: region.addr_of(payload),
            });
        }

        write_node(region, block, block_size, next.unwrap_or(NIL));
        self.link(region, prev, block);
        self.in_use -= block_size;

        self.merge_with_next(region, block);
        if let Some(p) = prev {
            self.merge_with_next(region, p);
        }

        log::trace!("arena {:#x}: freed {block_size} bytes at {block:#x}", self.start);
        Ok(block_size)
    }

    /// Payload bytes of the live block at `payload`.
    #[must_use]
    pub fn usable_size(&self, region: &Region<'_>, payload: usize) -> Option<usize> {
        if payload < self.start + HEADER_SIZE || payload >= self.end() {
            return None;
        }
        let block_size = region.read_word(payload - 2 * WORD);
        let padding = region.read_word(payload - WORD);
        block_size.checked_sub(padding)
    }

    /// Fold `node`'s successor into it when the two touch.
    fn merge_with_next(&mut self, region: &mut Region<'_>, node: usize) {
        let size = region.read_word(node);
        let Some(next) = next_of(region, node) else {
            return;
        };
        if node + size == next {
            let merged = size + region.read_word(next);
            let after = region.read_word(next + WORD);
            write_node(region, node, merged, after);
        }
    }

    fn link(&mut self, region: &mut Region<'_>, prev: Option<usize>, to: usize) {
        let to = (to != NIL).then_some(to);
        match prev {
            Some(p) => region.write_word(p + WORD, to.unwrap_or(NIL)),
            None => self.head = to,
        }
    }

    /// Free nodes in address order.
    pub fn free_nodes<'r>(&self, region: &'r Region<'_>) -> FreeNodes<'r> {
        FreeNodes {
            region,
            cursor: self.head,
        }
    }

    #[must_use]
    pub fn stats(&self, region: &Region<'_>) -> FreeListStats {
        let (count, largest) = self
            .free_nodes(region)
            .fold((0, 0), |(n, max), node| (n + 1, max.max(node.size)));
        FreeListStats {
            capacity: self.capacity,
            in_use: self.in_use,
            free_nodes: count,
            largest_free_node: largest,
        }
    }
}

pub(crate) struct FreeNodes<'r> {
    region: &'r Region<'r>,
    cursor: Option<usize>,
}

impl Iterator for FreeNodes<'_> {
    type Item = FreeNode;

    fn next(&mut self) -> Option<FreeNode> {
        let node = self.cursor?;
        self.cursor = next_of(self.region, node);
        Some(FreeNode {
            offset: node,
            size: self.region.read_word(node),
        })
    }
}

#[inline]
fn write_node(region: &mut Region<'_>, node: usize, size: usize, next: usize) {
    region.write_word(node, size);
    region.write_word(node + WORD, next);
}

#[inline]
fn next_of(region: &Region<'_>, node: usize) -> Option<usize> {
    let next = region.read_word(node + WORD);
    (next != NIL).then_some(next)
}
