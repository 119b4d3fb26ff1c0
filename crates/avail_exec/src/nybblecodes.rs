//! Level One nybblecodes.
//!
//! Instructions pack into four-bit units. The first nybble is the opcode
//! (15 = extended: the next nybble selects among the rarer operations);
//! operands follow as nybbles, where values 0..=14 encode directly and 15
//! prefixes eight nybbles of big-endian `u32`.
//!
//! The stream has no branch instructions (Level One loops come from
//! recursion and continuation restarts), so every decode is a straight
//! left-to-right walk.

use avail_base::{ErrorKind, VmError, VmResult};

/// One decoded Level One instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Op {
    /// Look up and invoke the method named by the atom at `bundle_literal`,
    /// consuming `num_args` stack values.
    Call { bundle_literal: usize, num_args: usize },
    /// Push the literal at the given pool index.
    PushLiteral(usize),
    /// Push the value in frame slot `index` (argument or local).
    PushLocal(usize),
    /// Push the function's captured outer at `index`.
    PushOuter(usize),
    /// Build a function over the raw function literal, capturing
    /// `num_copied` stack values as outers.
    Close { num_copied: usize, code_literal: usize },
    /// Pop a value and write it through the variable in frame slot `index`.
    SetLocal(usize),
    /// Push the value read through the variable in frame slot `index`.
    GetLocal(usize),
    /// Pop `count` values and push a tuple of them.
    MakeTuple(usize),
    /// Push the value read through the captured outer variable.
    GetOuter(usize),
    /// Pop a value and write it through the captured outer variable.
    SetOuter(usize),
    /// Reorder the top stack values by the permutation tuple literal.
    Permute(usize),
    /// Method call using explicit argument types for lookup (super-cast).
    SuperCall {
        bundle_literal: usize,
        num_args: usize,
        types_literal: usize,
    },
    /// Reify the current frame and push it as a continuation.
    PushLabel,
    /// Pop a variable and push its value.
    GetVariable,
    /// Pop a variable, pop a value, and write the value through it.
    SetVariable,
    /// Pop `count` values and push a set of them.
    MakeSet(usize),
    /// Pop `2·count` values (key/value pairs) and push a map.
    MakeMap(usize),
    /// Explicit safe point: observe interrupt flags.
    CheckInterrupts,
    /// Return the top of stack to the caller.
    Return,
    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Pop a function and `num_args` values and invoke it directly.
    Apply { num_args: usize },
}

/// Incrementally encodes instructions into packed nybbles.
#[derive(Default)]
pub struct NybbleWriter {
    nybbles: Vec<u8>,
}

impl NybbleWriter {
    pub fn new() -> Self {
        NybbleWriter::default()
    }

    fn nybble(&mut self, n: u8) {
        debug_assert!(n <= 0xF);
        self.nybbles.push(n);
    }

    fn operand(&mut self, value: usize) {
        if value < 15 {
            self.nybble(value as u8);
        } else {
            self.nybble(15);
            let value = value as u32;
            for shift in (0..8).rev() {
                self.nybble(((value >> (shift * 4)) & 0xF) as u8);
            }
        }
    }

    /// Appends one instruction.
    pub fn op(&mut self, op: L1Op) {
        use L1Op::*;
        match op {
            Call {
                bundle_literal,
                num_args,
            } => {
                self.nybble(0);
                self.operand(bundle_literal);
                self.operand(num_args);
            }
            PushLiteral(index) => {
                self.nybble(1);
                self.operand(index);
            }
            PushLocal(index) => {
                self.nybble(2);
                self.operand(index);
            }
            PushOuter(index) => {
                self.nybble(3);
                self.operand(index);
            }
            Close {
                num_copied,
                code_literal,
            } => {
                self.nybble(4);
                self.operand(num_copied);
                self.operand(code_literal);
            }
            SetLocal(index) => {
                self.nybble(5);
                self.operand(index);
            }
            GetLocal(index) => {
                self.nybble(6);
                self.operand(index);
            }
            MakeTuple(count) => {
                self.nybble(7);
                self.operand(count);
            }
            GetOuter(index) => {
                self.nybble(8);
                self.operand(index);
            }
            SetOuter(index) => {
                self.nybble(9);
                self.operand(index);
            }
            Permute(index) => {
                self.nybble(10);
                self.operand(index);
            }
            SuperCall {
                bundle_literal,
                num_args,
                types_literal,
            } => {
                self.nybble(11);
                self.operand(bundle_literal);
                self.operand(num_args);
                self.operand(types_literal);
            }
            PushLabel => self.nybble(12),
            GetVariable => self.nybble(13),
            SetVariable => self.nybble(14),
            MakeSet(count) => {
                self.nybble(15);
                self.nybble(0);
                self.operand(count);
            }
            MakeMap(count) => {
                self.nybble(15);
                self.nybble(1);
                self.operand(count);
            }
            CheckInterrupts => {
                self.nybble(15);
                self.nybble(2);
            }
            Return => {
                self.nybble(15);
                self.nybble(3);
            }
            Pop => {
                self.nybble(15);
                self.nybble(4);
            }
            Dup => {
                self.nybble(15);
                self.nybble(5);
            }
            Apply { num_args } => {
                self.nybble(15);
                self.nybble(6);
                self.operand(num_args);
            }
        }
    }

    /// The packed stream, one nybble per byte, ready for a nybble tuple.
    pub fn finish(self) -> Vec<u8> {
        self.nybbles
    }
}

fn read_nybble(nybbles: &[u8], pc: &mut usize) -> VmResult<u8> {
    let n = *nybbles
        .get(*pc)
        .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, "truncated nybblecodes"))?;
    *pc += 1;
    Ok(n)
}

fn read_operand(nybbles: &[u8], pc: &mut usize) -> VmResult<usize> {
    let first = read_nybble(nybbles, pc)?;
    if first < 15 {
        return Ok(first as usize);
    }
    let mut value: u32 = 0;
    for _ in 0..8 {
        value = (value << 4) | read_nybble(nybbles, pc)? as u32;
    }
    Ok(value as usize)
}

/// Decodes the instruction at `pc`, returning it and the next pc.
pub fn decode(nybbles: &[u8], pc: usize) -> VmResult<(L1Op, usize)> {
    let mut cursor = pc;
    let opcode = read_nybble(nybbles, &mut cursor)?;
    let op = match opcode {
        0 => L1Op::Call {
            bundle_literal: read_operand(nybbles, &mut cursor)?,
            num_args: read_operand(nybbles, &mut cursor)?,
        },
        1 => L1Op::PushLiteral(read_operand(nybbles, &mut cursor)?),
        2 => L1Op::PushLocal(read_operand(nybbles, &mut cursor)?),
        3 => L1Op::PushOuter(read_operand(nybbles, &mut cursor)?),
        4 => L1Op::Close {
            num_copied: read_operand(nybbles, &mut cursor)?,
            code_literal: read_operand(nybbles, &mut cursor)?,
        },
        5 => L1Op::SetLocal(read_operand(nybbles, &mut cursor)?),
        6 => L1Op::GetLocal(read_operand(nybbles, &mut cursor)?),
        7 => L1Op::MakeTuple(read_operand(nybbles, &mut cursor)?),
        8 => L1Op::GetOuter(read_operand(nybbles, &mut cursor)?),
        9 => L1Op::SetOuter(read_operand(nybbles, &mut cursor)?),
        10 => L1Op::Permute(read_operand(nybbles, &mut cursor)?),
        11 => L1Op::SuperCall {
            bundle_literal: read_operand(nybbles, &mut cursor)?,
            num_args: read_operand(nybbles, &mut cursor)?,
            types_literal: read_operand(nybbles, &mut cursor)?,
        },
        12 => L1Op::PushLabel,
        13 => L1Op::GetVariable,
        14 => L1Op::SetVariable,
        15 => match read_nybble(nybbles, &mut cursor)? {
            0 => L1Op::MakeSet(read_operand(nybbles, &mut cursor)?),
            1 => L1Op::MakeMap(read_operand(nybbles, &mut cursor)?),
            2 => L1Op::CheckInterrupts,
            3 => L1Op::Return,
            4 => L1Op::Pop,
            5 => L1Op::Dup,
            6 => L1Op::Apply {
                num_args: read_operand(nybbles, &mut cursor)?,
            },
            other => {
                return Err(VmError::with_detail(
                    ErrorKind::NotSupported,
                    format!("unknown extended nybblecode {}", other),
                ))
            }
        },
        _ => unreachable!("nybbles are four bits"),
    };
    Ok((op, cursor))
}

/// Decodes the whole stream.
pub fn decode_all(nybbles: &[u8]) -> VmResult<Vec<(usize, L1Op)>> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < nybbles.len() {
        let (op, next) = decode(nybbles, pc)?;
        out.push((pc, op));
        pc = next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ops: &[L1Op]) {
        let mut writer = NybbleWriter::new();
        for &op in ops {
            writer.op(op);
        }
        let stream = writer.finish();
        let decoded: Vec<L1Op> = decode_all(&stream)
            .unwrap()
            .into_iter()
            .map(|(_, op)| op)
            .collect();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn simple_ops_round_trip() {
        round_trip(&[
            L1Op::PushLiteral(3),
            L1Op::PushLocal(0),
            L1Op::Call {
                bundle_literal: 1,
                num_args: 2,
            },
            L1Op::Return,
        ]);
    }

    #[test]
    fn wide_operands_use_the_escape() {
        round_trip(&[
            L1Op::PushLiteral(14),
            L1Op::PushLiteral(15),
            L1Op::PushLiteral(16),
            L1Op::PushLiteral(70_000),
            L1Op::MakeTuple(1_000_000),
        ]);
    }

    #[test]
    fn extended_ops_round_trip() {
        round_trip(&[
            L1Op::MakeSet(4),
            L1Op::MakeMap(2),
            L1Op::CheckInterrupts,
            L1Op::Dup,
            L1Op::Pop,
            L1Op::Apply { num_args: 3 },
            L1Op::Return,
        ]);
    }

    #[test]
    fn truncated_stream_fails_cleanly() {
        let mut writer = NybbleWriter::new();
        writer.op(L1Op::PushLiteral(70_000));
        let mut stream = writer.finish();
        stream.truncate(stream.len() - 2);
        assert!(decode(&stream, 0).is_err());
    }
}
