// Tie-break rules - pick one winner among visible lease tokens

use crate::token::ChildEntry;

/// A deterministic total order over competing tokens.
///
/// Every participant applies the same rule to whatever children it can see,
/// so once visibility converges they all agree on the winner without talking
/// to each other. Implementations must be pure: same input set (in any order),
/// same answer, on every process.
pub trait TieBreak: Send + Sync {
    fn winner<'a>(&self, candidates: &'a [ChildEntry]) -> Option<&'a ChildEntry>;
}

/// Reference rule: the byte-wise smallest name wins.
///
/// Identical names (a collision) fall back to the smaller id so the order
/// stays total.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lexicographic;

impl TieBreak for Lexicographic {
    fn winner<'a>(&self, candidates: &'a [ChildEntry]) -> Option<&'a ChildEntry> {
        candidates
            .iter()
            .min_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()).then_with(|| a.id.cmp(&b.id)))
    }
}
