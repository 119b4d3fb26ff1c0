//! Parsing instructions: the edge alphabet of bundle trees.
//!
//! The message splitter compiles a method name into a straight-line (or,
//! with repetition groups, looping) sequence of these instructions. Bundle
//! tree nodes key their outgoing edges by instruction, so the type derives
//! `Hash`/`Eq`.

/// One step of parsing a message send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParsingInstruction {
    /// Match the keyword part at this index of the bundle's parts tuple.
    ParsePart(usize),
    /// Match the (lowercased) part at this index, ignoring case.
    ParsePartCaseInsensitive(usize),
    /// Parse one argument expression.
    ParseArgument,
    /// Validate the most recently parsed argument as argument `n` (1-based).
    CheckArgument(usize),
    /// Either continue at the next instruction or skip to `target`
    /// (repetition-group exit).
    BranchForward(usize),
    /// Continue at `target`, earlier in the sequence (repetition-group
    /// loop-back).
    JumpBackward(usize),
}

impl ParsingInstruction {
    /// Whether this instruction consumes a keyword token.
    pub fn is_part(self) -> bool {
        matches!(
            self,
            ParsingInstruction::ParsePart(_) | ParsingInstruction::ParsePartCaseInsensitive(_)
        )
    }
}
