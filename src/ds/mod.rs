//! Internal data structures: the recyclable entry chain and the segment
//! tree. These types trade borrow-checked ownership for the single-writer /
//! lock-free-reader protocol and are only sound behind the public facades.

pub(crate) mod entry;
pub(crate) mod segment;
