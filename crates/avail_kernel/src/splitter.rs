//! The message splitter: method names to parsing instructions.
//!
//! A method name encodes its own grammar:
//!
//! - `_` parses one argument
//! - alphanumeric runs are keyword parts; other symbols are one-character
//!   parts of their own
//! - `~` marks the preceding part case-insensitive
//! - `` ` `` escapes the following character into the current keyword part
//! - `«` … `»` wraps a zero-or-more repetition group
//!
//! `"_+_"` therefore splits into parts `["+"]` and instructions
//! `[ParseArgument, CheckArgument(1), ParsePart(0), ParseArgument,
//! CheckArgument(2)]`.
//!
//! Ill-formed names (empty, unbalanced guillemets, dangling `~` or
//! `` ` ``) fail with `MalformedMessage`.

use avail_base::{ErrorKind, VmError, VmResult};

use crate::instruction::ParsingInstruction;

/// The result of splitting a message name.
#[derive(Debug, Clone)]
pub struct MessageSplit {
    /// Keyword parts, in order of first appearance.
    pub parts: Vec<String>,
    /// The compiled instruction sequence.
    pub instructions: Vec<ParsingInstruction>,
    /// Number of `_` argument positions.
    pub argument_count: usize,
}

fn malformed(name: &str, why: &str) -> VmError {
    VmError::with_detail(ErrorKind::MalformedMessage, format!("{:?}: {}", name, why))
}

/// Splits a message name into keyword parts and parsing instructions.
pub fn split(name: &str) -> VmResult<MessageSplit> {
    if name.is_empty() {
        return Err(malformed(name, "empty message name"));
    }
    let mut parts: Vec<String> = Vec::new();
    let mut instructions: Vec<ParsingInstruction> = Vec::new();
    let mut argument_count = 0usize;
    let mut group_starts: Vec<usize> = Vec::new();
    let mut current: String = String::new();
    let mut chars = name.chars().peekable();

    let flush = |current: &mut String,
                 parts: &mut Vec<String>,
                 instructions: &mut Vec<ParsingInstruction>| {
        if !current.is_empty() {
            let index = part_index(parts, current);
            instructions.push(ParsingInstruction::ParsePart(index));
            current.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '_' => {
                flush(&mut current, &mut parts, &mut instructions);
                argument_count += 1;
                instructions.push(ParsingInstruction::ParseArgument);
                instructions.push(ParsingInstruction::CheckArgument(argument_count));
            }
            '~' => {
                if !current.is_empty() {
                    let lowered = current.to_lowercase();
                    let index = part_index(&mut parts, &lowered);
                    instructions.push(ParsingInstruction::ParsePartCaseInsensitive(index));
                    current.clear();
                } else {
                    match instructions.last().copied() {
                        Some(ParsingInstruction::ParsePart(index)) => {
                            let lowered = parts[index].to_lowercase();
                            let lowered_index = part_index(&mut parts, &lowered);
                            let last = instructions.len() - 1;
                            instructions[last] =
                                ParsingInstruction::ParsePartCaseInsensitive(lowered_index);
                        }
                        _ => return Err(malformed(name, "`~` must follow a keyword part")),
                    }
                }
            }
            '`' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(malformed(name, "dangling escape")),
            },
            '«' => {
                flush(&mut current, &mut parts, &mut instructions);
                // Placeholder branch target, patched when the group closes.
                group_starts.push(instructions.len());
                instructions.push(ParsingInstruction::BranchForward(usize::MAX));
            }
            '»' => {
                flush(&mut current, &mut parts, &mut instructions);
                let start = group_starts
                    .pop()
                    .ok_or_else(|| malformed(name, "`»` without matching `«`"))?;
                instructions.push(ParsingInstruction::JumpBackward(start));
                let exit = instructions.len();
                instructions[start] = ParsingInstruction::BranchForward(exit);
            }
            ' ' => flush(&mut current, &mut parts, &mut instructions),
            c if c.is_alphanumeric() => current.push(c),
            c => {
                // Symbol characters stand alone as single-character parts.
                flush(&mut current, &mut parts, &mut instructions);
                let token = c.to_string();
                let index = part_index(&mut parts, &token);
                instructions.push(ParsingInstruction::ParsePart(index));
            }
        }
    }
    flush(&mut current, &mut parts, &mut instructions);
    if !group_starts.is_empty() {
        return Err(malformed(name, "unclosed `«`"));
    }
    if instructions.is_empty() {
        return Err(malformed(name, "no parts or arguments"));
    }
    Ok(MessageSplit {
        parts,
        instructions,
        argument_count,
    })
}

fn part_index(parts: &mut Vec<String>, token: &str) -> usize {
    match parts.iter().position(|p| p == token) {
        Some(index) => index,
        None => {
            parts.push(token.to_string());
            parts.len() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParsingInstruction::*;

    #[test]
    fn infix_plus() {
        let split = split("_+_").unwrap();
        assert_eq!(split.parts, vec!["+"]);
        assert_eq!(split.argument_count, 2);
        assert_eq!(
            split.instructions,
            vec![
                ParseArgument,
                CheckArgument(1),
                ParsePart(0),
                ParseArgument,
                CheckArgument(2),
            ]
        );
    }

    #[test]
    fn prefix_negate() {
        let split = split("-_").unwrap();
        assert_eq!(split.parts, vec!["-"]);
        assert_eq!(
            split.instructions,
            vec![ParsePart(0), ParseArgument, CheckArgument(1)]
        );
    }

    #[test]
    fn multi_word_keywords() {
        let split = split("Print_to console").unwrap();
        assert_eq!(split.parts, vec!["Print", "to", "console"]);
        assert_eq!(split.argument_count, 1);
    }

    #[test]
    fn case_insensitive_marker_lowercases_the_part() {
        let split = split("Assert~_").unwrap();
        assert_eq!(split.parts, vec!["assert"]);
        assert_eq!(split.instructions[0], ParsePartCaseInsensitive(0));
    }

    #[test]
    fn escapes_join_the_current_part() {
        let split = split("`_literal`~").unwrap();
        assert_eq!(split.parts, vec!["_literal~"]);
    }

    #[test]
    fn repetition_group_loops_back() {
        let split = split("{«_,»}").unwrap();
        // parts: "{", ",", "}"
        assert_eq!(split.parts, vec!["{", ",", "}"]);
        let branch_at = split
            .instructions
            .iter()
            .position(|i| matches!(i, BranchForward(_)))
            .unwrap();
        let jump_at = split
            .instructions
            .iter()
            .position(|i| matches!(i, JumpBackward(_)))
            .unwrap();
        assert!(branch_at < jump_at);
        match (split.instructions[branch_at], split.instructions[jump_at]) {
            (BranchForward(exit), JumpBackward(back)) => {
                assert_eq!(back, branch_at);
                assert_eq!(exit, jump_at + 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in ["", "«_", "_»", "~x", "tail`"] {
            let err = split(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::MalformedMessage, "{:?}", bad);
        }
    }
}
