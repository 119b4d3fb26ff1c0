//! Level Two chunks: optimized wordcode rewrites of raw functions.
//!
//! A chunk is a cache entry, never a semantic authority: it rewrites a raw
//! function's instruction stream with call sites resolved against the
//! method graph *as it stood at translation time*, and records every method
//! it relied on. When any of those methods changes, the method walks its
//! dependents and flips the chunk's validity flag; the next invocation
//! notices, falls back to the Level One stream, and restarts the
//! reoptimization countdown.
//!
//! The wordcodes (a tuple of 16-bit integers) are the canonical form; the
//! decoded op list sits beside them with a per-op Level One pc so an
//! interrupted Level Two frame can always be resumed, or deoptimized,
//! at the equivalent Level One position.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use avail_base::{AvailObject, VmResult};
use avail_kernel::{ChunkDependent, Definition, Method};

use crate::interpreter::BundleResolver;
use crate::nybblecodes::{self, L1Op};
use crate::raw_function;

/// One decoded Level Two operation.
#[derive(Clone)]
pub enum ChunkOp {
    /// Same semantics as the Level One op.
    Plain { op: L1Op, l1_pc: usize },
    /// A monomorphic send, resolved at translation time. Valid only while
    /// the chunk is valid.
    CallDirect {
        function: AvailObject,
        num_args: usize,
        l1_pc: usize,
    },
}

impl ChunkOp {
    /// The Level One pc this op corresponds to.
    pub fn l1_pc(&self) -> usize {
        match self {
            ChunkOp::Plain { l1_pc, .. } | ChunkOp::CallDirect { l1_pc, .. } => *l1_pc,
        }
    }
}

/// An optimized rewrite of one raw function.
pub struct Chunk {
    id: u64,
    wordcodes: Vec<u16>,
    literals: Vec<AvailObject>,
    ops: Vec<ChunkOp>,
    dependencies: Vec<Arc<Method>>,
    valid: AtomicBool,
}

impl Chunk {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether optimized execution may still trust this chunk.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// The decoded operations.
    pub fn ops(&self) -> &[ChunkOp] {
        &self.ops
    }

    /// The canonical 16-bit wordcodes.
    pub fn wordcodes(&self) -> &[u16] {
        &self.wordcodes
    }

    /// The chunk's literal pool.
    pub fn literals(&self) -> &[AvailObject] {
        &self.literals
    }

    /// Methods whose mutation invalidates this chunk.
    pub fn dependencies(&self) -> &[Arc<Method>] {
        &self.dependencies
    }
}

impl ChunkDependent for Chunk {
    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn dependent_id(&self) -> u64 {
        self.id
    }
}

/// All live chunks, keyed by id. Id 0 is reserved for "unoptimized".
#[derive(Default)]
pub struct ChunkRegistry {
    chunks: RwLock<FxHashMap<u64, Arc<Chunk>>>,
    next_id: AtomicU64,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        ChunkRegistry {
            chunks: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Looks up a chunk by id.
    pub fn get(&self, id: u64) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&id).cloned()
    }

    /// Drops a chunk (after deoptimization).
    pub fn remove(&self, id: u64) {
        self.chunks.write().remove(&id);
    }

    /// Translates a raw function into a chunk, registering dependencies on
    /// every method whose dispatch was inlined. Returns `None` when the
    /// code contains something the translator will not commit to.
    pub fn translate(
        &self,
        resolver: &dyn BundleResolver,
        code: &AvailObject,
    ) -> VmResult<Option<Arc<Chunk>>> {
        let stream = raw_function::nybblecodes(code)?;
        let decoded = nybblecodes::decode_all(&stream)?;
        let mut literals: Vec<AvailObject> = Vec::new();
        let mut ops: Vec<ChunkOp> = Vec::new();
        let mut dependencies: Vec<Arc<Method>> = Vec::new();

        for (l1_pc, op) in decoded {
            match op {
                L1Op::Call {
                    bundle_literal,
                    num_args,
                } => {
                    let atom = raw_function::literal_at(code, bundle_literal)?;
                    let direct = resolver.bundle_for_atom(&atom).and_then(|bundle| {
                        let method = bundle.method().clone();
                        let definitions = method.definitions();
                        let target = match definitions.as_slice() {
                            [single] => match &**single {
                                Definition::Method { body, .. } => Some(body.clone()),
                                _ => None,
                            },
                            _ => None,
                        };
                        target.map(|function| (method, function))
                    });
                    match direct {
                        Some((method, function)) => {
                            if !dependencies.iter().any(|m| Arc::ptr_eq(m, &method)) {
                                dependencies.push(method);
                            }
                            literals.push(function.clone());
                            ops.push(ChunkOp::CallDirect {
                                function,
                                num_args,
                                l1_pc,
                            });
                        }
                        None => ops.push(ChunkOp::Plain { op, l1_pc }),
                    }
                }
                other => ops.push(ChunkOp::Plain { op: other, l1_pc }),
            }
        }

        let wordcodes = match encode_wordcodes(&ops) {
            Some(words) => words,
            None => return Ok(None),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id > u32::MAX as u64 {
            return Ok(None);
        }
        let chunk = Arc::new(Chunk {
            id,
            wordcodes,
            literals,
            ops,
            dependencies,
            valid: AtomicBool::new(true),
        });
        for method in &chunk.dependencies {
            let as_dependent: Arc<dyn ChunkDependent> = chunk.clone();
            method.add_dependent(Arc::downgrade(&as_dependent));
        }
        self.chunks.write().insert(id, chunk.clone());
        raw_function::set_chunk_id(code, id)?;
        debug!(
            chunk = id,
            ops = chunk.ops.len(),
            dependencies = chunk.dependencies.len(),
            "translated chunk"
        );
        Ok(Some(chunk))
    }
}

/// Serializes ops as 16-bit wordcodes; bails when an operand overflows.
fn encode_wordcodes(ops: &[ChunkOp]) -> Option<Vec<u16>> {
    let mut words: Vec<u16> = Vec::with_capacity(ops.len() * 2);
    let mut direct_index = 0u16;
    let word = |value: usize| -> Option<u16> { u16::try_from(value).ok() };
    for op in ops {
        match op {
            ChunkOp::CallDirect { num_args, .. } => {
                words.push(1);
                words.push(direct_index);
                words.push(word(*num_args)?);
                direct_index = direct_index.checked_add(1)?;
            }
            ChunkOp::Plain { op, .. } => {
                use L1Op::*;
                match *op {
                    Call {
                        bundle_literal,
                        num_args,
                    } => {
                        words.push(2);
                        words.push(word(bundle_literal)?);
                        words.push(word(num_args)?);
                    }
                    PushLiteral(k) => {
                        words.push(3);
                        words.push(word(k)?);
                    }
                    PushLocal(k) => {
                        words.push(4);
                        words.push(word(k)?);
                    }
                    PushOuter(k) => {
                        words.push(5);
                        words.push(word(k)?);
                    }
                    Close {
                        num_copied,
                        code_literal,
                    } => {
                        words.push(6);
                        words.push(word(num_copied)?);
                        words.push(word(code_literal)?);
                    }
                    SetLocal(k) => {
                        words.push(7);
                        words.push(word(k)?);
                    }
                    GetLocal(k) => {
                        words.push(8);
                        words.push(word(k)?);
                    }
                    MakeTuple(n) => {
                        words.push(9);
                        words.push(word(n)?);
                    }
                    GetOuter(k) => {
                        words.push(10);
                        words.push(word(k)?);
                    }
                    SetOuter(k) => {
                        words.push(11);
                        words.push(word(k)?);
                    }
                    Permute(k) => {
                        words.push(12);
                        words.push(word(k)?);
                    }
                    SuperCall {
                        bundle_literal,
                        num_args,
                        types_literal,
                    } => {
                        words.push(13);
                        words.push(word(bundle_literal)?);
                        words.push(word(num_args)?);
                        words.push(word(types_literal)?);
                    }
                    PushLabel => words.push(14),
                    GetVariable => words.push(15),
                    SetVariable => words.push(16),
                    MakeSet(n) => {
                        words.push(17);
                        words.push(word(n)?);
                    }
                    MakeMap(n) => {
                        words.push(18);
                        words.push(word(n)?);
                    }
                    CheckInterrupts => words.push(19),
                    Return => words.push(20),
                    Pop => words.push(21),
                    Dup => words.push(22),
                    Apply { num_args } => {
                        words.push(23);
                        words.push(word(num_args)?);
                    }
                }
            }
        }
    }
    Some(words)
}
