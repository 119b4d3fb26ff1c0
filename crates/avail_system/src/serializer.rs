//! The binary serializer.
//!
//! The format is a pre-order stream of per-kind operations, one per
//! distinct object, with later occurrences of an already-written object
//! emitted as back references. Each operation's payload is the minimal set
//! of sub-objects needed to reconstruct the value:
//!
//! - atoms round-trip by identity: the payload is the issuing module and
//!   name, re-interned through the runtime's atom table on read;
//! - every other kind round-trips to structural equality: tuple
//!   representations are canonicalized (a spliced tuple deserializes flat,
//!   a character tuple as a string), which equality guarantees make
//!   invisible;
//! - fiber handles are scheduler state and do not serialize.
//!
//! The stream is framed by a magic header and closed by a crc32 trailer
//! over the payload.

use rustc_hash::FxHashMap;

use avail_base::{AvailObject, ErrorKind, Kind, VmError, VmResult};
use avail_data::{atom, character, map, number, set, tuple, types, values, variable};
use avail_exec::continuation;
use avail_exec::raw_function::{self, RawFunctionBuilder};
use avail_exec::nybblecodes;

use crate::runtime::Runtime;

const MAGIC: &[u8; 4] = b"AVSR";
const FORMAT_VERSION: u8 = 1;

mod op {
    pub const BACK_REF: u8 = 0;
    pub const NIL: u8 = 1;
    pub const FALSE: u8 = 2;
    pub const TRUE: u8 = 3;
    pub const CHARACTER: u8 = 4;
    pub const INTEGER: u8 = 5;
    pub const POSITIVE_INFINITY: u8 = 6;
    pub const NEGATIVE_INFINITY: u8 = 7;
    pub const FLOAT: u8 = 8;
    pub const DOUBLE: u8 = 9;
    pub const STRING: u8 = 10;
    pub const BYTE_TUPLE: u8 = 11;
    pub const NYBBLE_TUPLE: u8 = 12;
    pub const TUPLE: u8 = 13;
    pub const SET: u8 = 14;
    pub const MAP: u8 = 15;
    pub const ATOM: u8 = 16;
    pub const TYPE: u8 = 17;
    pub const VARIABLE: u8 = 18;
    pub const FUNCTION: u8 = 19;
    pub const RAW_FUNCTION: u8 = 20;
    pub const CONTINUATION: u8 = 21;
}

/// Serializes objects into one framed byte stream.
pub struct Serializer {
    payload: Vec<u8>,
    seen: FxHashMap<usize, u64>,
    next_index: u64,
}

impl Serializer {
    pub fn new() -> Serializer {
        Serializer {
            payload: Vec::new(),
            seen: FxHashMap::default(),
            next_index: 0,
        }
    }

    fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.payload.push(byte);
                return;
            }
            self.payload.push(byte | 0x80);
        }
    }

    fn string(&mut self, text: &str) {
        self.varint(text.len() as u64);
        self.payload.extend_from_slice(text.as_bytes());
    }

    /// Appends one object (and its sub-objects) to the stream.
    pub fn serialize(&mut self, obj: &AvailObject) -> VmResult<()> {
        let obj = obj.traverse();
        if let Some(&index) = self.seen.get(&obj.addr()) {
            self.payload.push(op::BACK_REF);
            self.varint(index);
            return Ok(());
        }
        self.seen.insert(obj.addr(), self.next_index);
        self.next_index += 1;
        match obj.kind() {
            Kind::Nil => self.payload.push(op::NIL),
            Kind::Boolean => {
                let truth = values::boolean_value(&obj)?;
                self.payload.push(if truth { op::TRUE } else { op::FALSE });
            }
            Kind::Character => {
                self.payload.push(op::CHARACTER);
                self.varint(character::to_char(&obj)? as u64);
            }
            Kind::Integer => {
                self.payload.push(op::INTEGER);
                let ints = obj.integer_slots_snapshot();
                self.payload.push(ints[0] as u8);
                self.varint((ints.len() - 1) as u64);
                for limb in &ints[1..] {
                    self.varint(*limb as u64);
                }
            }
            Kind::PositiveInfinity => self.payload.push(op::POSITIVE_INFINITY),
            Kind::NegativeInfinity => self.payload.push(op::NEGATIVE_INFINITY),
            Kind::SingleFloat => {
                self.payload.push(op::FLOAT);
                self.payload
                    .extend_from_slice(&obj.integer_slot(0).to_le_bytes());
            }
            Kind::DoubleFloat => {
                self.payload.push(op::DOUBLE);
                self.payload
                    .extend_from_slice(&obj.integer_slot(0).to_le_bytes());
                self.payload
                    .extend_from_slice(&obj.integer_slot(1).to_le_bytes());
            }
            kind if kind.is_tuple() => self.serialize_tuple(&obj)?,
            Kind::Set => {
                self.payload.push(op::SET);
                let elements = set::to_vec(&obj)?;
                self.varint(elements.len() as u64);
                for element in &elements {
                    self.serialize(element)?;
                }
            }
            Kind::Map => {
                self.payload.push(op::MAP);
                let pairs = map::to_pairs(&obj)?;
                self.varint(pairs.len() as u64);
                for (key, value) in &pairs {
                    self.serialize(key)?;
                    self.serialize(value)?;
                }
            }
            Kind::Atom => {
                self.payload.push(op::ATOM);
                let module = atom::module_name(&obj)?.unwrap_or_default();
                self.string(&module);
                self.string(&atom::name(&obj)?);
            }
            Kind::Type => {
                self.payload.push(op::TYPE);
                self.varint(obj.integer_slot(0) as u64);
                self.varint(obj.integer_slot(1) as u64);
                let params = obj.object_slots_snapshot();
                self.varint(params.len() as u64);
                for param in &params {
                    self.serialize(param)?;
                }
            }
            Kind::Variable => {
                self.payload.push(op::VARIABLE);
                self.serialize(&variable::inner_type(&obj)?)?;
                self.payload.push(variable::is_write_once(&obj)? as u8);
                match variable::get(&obj) {
                    Ok(value) => {
                        self.payload.push(1);
                        self.serialize(&value)?;
                    }
                    Err(_) => self.payload.push(0),
                }
            }
            Kind::Function => {
                self.payload.push(op::FUNCTION);
                let code = raw_function::function_code(&obj)?;
                self.serialize(&code)?;
                let outer_count = obj.object_slot_count() - 1;
                self.varint(outer_count as u64);
                for index in 0..outer_count {
                    self.serialize(&raw_function::function_outer(&obj, index)?)?;
                }
            }
            Kind::RawFunction => {
                self.payload.push(op::RAW_FUNCTION);
                let stream = raw_function::nybblecodes(&obj)?;
                self.varint(stream.len() as u64);
                self.payload.extend_from_slice(&stream);
                let literals = raw_function::literals(&obj)?;
                self.varint(literals.len() as u64);
                for literal in &literals {
                    self.serialize(literal)?;
                }
                self.serialize(&raw_function::outer_types_tuple(&obj)?)?;
                self.serialize(&raw_function::parameter_types_tuple(&obj)?)?;
                self.serialize(&raw_function::return_type(&obj)?)?;
                self.varint(raw_function::num_locals(&obj)? as u64);
                self.varint(raw_function::primitive_number(&obj)? as u64);
            }
            Kind::Continuation => {
                self.payload.push(op::CONTINUATION);
                self.serialize(&continuation::caller(&obj)?)?;
                self.serialize(&continuation::function(&obj)?)?;
                self.varint(continuation::pc(&obj)? as u64);
                self.varint(continuation::stack_pointer(&obj)? as u64);
                let frame = continuation::frame(&obj)?;
                self.varint(frame.len() as u64);
                for slot in &frame {
                    self.serialize(slot)?;
                }
            }
            other => {
                return Err(VmError::with_detail(
                    ErrorKind::NotSupported,
                    format!("{:?} does not serialize", other),
                ));
            }
        }
        Ok(())
    }

    fn serialize_tuple(&mut self, obj: &AvailObject) -> VmResult<()> {
        let size = tuple::size(obj)?;
        let elements = tuple::to_vec(obj)?;
        // Character tuples canonicalize to the string op, small-integer
        // tuples to their packed forms, everything else to the general op.
        if elements
            .iter()
            .all(|e| e.traverse().kind() == Kind::Character)
        {
            self.payload.push(op::STRING);
            self.string(&tuple::to_string(obj)?);
            return Ok(());
        }
        let small_ints: Option<Vec<u32>> = elements
            .iter()
            .map(|e| number::to_u32(&e.traverse()))
            .collect();
        if let Some(units) = small_ints {
            if units.iter().all(|&u| u <= 0xF) {
                self.payload.push(op::NYBBLE_TUPLE);
                self.varint(size as u64);
                self.payload.extend(units.iter().map(|&u| u as u8));
                return Ok(());
            }
            if units.iter().all(|&u| u <= 0xFF) {
                self.payload.push(op::BYTE_TUPLE);
                self.varint(size as u64);
                self.payload.extend(units.iter().map(|&u| u as u8));
                return Ok(());
            }
        }
        self.payload.push(op::TUPLE);
        self.varint(size as u64);
        for element in &elements {
            self.serialize(element)?;
        }
        Ok(())
    }

    /// Frames the payload with the magic header and crc32 trailer.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 9);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&self.payload);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::new()
    }
}

/// Reads objects back out of a framed stream.
pub struct Deserializer<'a> {
    runtime: &'a Runtime,
    payload: &'a [u8],
    position: usize,
    objects: Vec<AvailObject>,
}

impl<'a> Deserializer<'a> {
    /// Validates the frame (magic, version, checksum) and prepares to read.
    pub fn new(runtime: &'a Runtime, bytes: &'a [u8]) -> VmResult<Deserializer<'a>> {
        let malformed = |why: &str| VmError::with_detail(ErrorKind::NotSupported, why.to_string());
        if bytes.len() < 9 || &bytes[..4] != MAGIC {
            return Err(malformed("bad serializer magic"));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(malformed("unsupported serializer version"));
        }
        let payload = &bytes[5..bytes.len() - 4];
        let mut trailer = [0u8; 4];
        trailer.copy_from_slice(&bytes[bytes.len() - 4..]);
        if crc32fast::hash(payload) != u32::from_le_bytes(trailer) {
            return Err(malformed("serializer checksum mismatch"));
        }
        Ok(Deserializer {
            runtime,
            payload,
            position: 0,
            objects: Vec::new(),
        })
    }

    fn byte(&mut self) -> VmResult<u8> {
        let byte = *self
            .payload
            .get(self.position)
            .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, "truncated stream"))?;
        self.position += 1;
        Ok(byte)
    }

    fn bytes(&mut self, count: usize) -> VmResult<&'a [u8]> {
        if self.position + count > self.payload.len() {
            return Err(VmError::with_detail(ErrorKind::NotSupported, "truncated stream"));
        }
        let slice = &self.payload[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn varint(&mut self) -> VmResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(VmError::with_detail(ErrorKind::NotSupported, "varint overflow"));
            }
        }
    }

    fn string(&mut self) -> VmResult<String> {
        let length = self.varint()? as usize;
        let bytes = self.bytes(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VmError::with_detail(ErrorKind::NotSupported, "invalid UTF-8"))
    }

    /// Reads the next object from the stream.
    pub fn deserialize(&mut self) -> VmResult<AvailObject> {
        let opcode = self.byte()?;
        if opcode == op::BACK_REF {
            let index = self.varint()? as usize;
            return self
                .objects
                .get(index)
                .cloned()
                .ok_or_else(|| {
                    VmError::with_detail(ErrorKind::NotSupported, "dangling back reference")
                });
        }
        // Reserve this object's identity slot before reading sub-objects so
        // indices line up with the serializer's pre-order numbering.
        let slot = self.objects.len();
        self.objects.push(AvailObject::nil());
        let value = self.deserialize_op(opcode, slot)?;
        self.objects[slot] = value.clone();
        Ok(value)
    }

    fn deserialize_op(&mut self, opcode: u8, slot: usize) -> VmResult<AvailObject> {
        Ok(match opcode {
            op::NIL => values::nil(),
            op::FALSE => values::boolean(false),
            op::TRUE => values::boolean(true),
            op::CHARACTER => {
                let code_point = self.varint()? as u32;
                let c = char::from_u32(code_point).ok_or_else(|| {
                    VmError::with_detail(ErrorKind::NotSupported, "invalid code point")
                })?;
                character::from_char(c)
            }
            op::INTEGER => {
                let negative = self.byte()? != 0;
                let count = self.varint()? as usize;
                let mut limbs = Vec::with_capacity(count);
                for _ in 0..count {
                    limbs.push(self.varint()? as u32);
                }
                number::from_limbs(negative, limbs)
            }
            op::POSITIVE_INFINITY => number::positive_infinity(),
            op::NEGATIVE_INFINITY => number::negative_infinity(),
            op::FLOAT => {
                let mut bits = [0u8; 4];
                bits.copy_from_slice(self.bytes(4)?);
                number::single_from_f32(f32::from_bits(u32::from_le_bytes(bits)))
            }
            op::DOUBLE => {
                let mut low = [0u8; 4];
                low.copy_from_slice(self.bytes(4)?);
                let mut high = [0u8; 4];
                high.copy_from_slice(self.bytes(4)?);
                let bits = u32::from_le_bytes(low) as u64 | ((u32::from_le_bytes(high) as u64) << 32);
                number::double_from_f64(f64::from_bits(bits))
            }
            op::STRING => tuple::string_from_str(&self.string()?),
            op::BYTE_TUPLE => {
                let count = self.varint()? as usize;
                tuple::byte_tuple_from_bytes(self.bytes(count)?)
            }
            op::NYBBLE_TUPLE => {
                let count = self.varint()? as usize;
                tuple::nybble_tuple_from(self.bytes(count)?)
            }
            op::TUPLE => {
                let count = self.varint()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.deserialize()?);
                }
                tuple::from_values(elements)
            }
            op::SET => {
                let count = self.varint()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.deserialize()?);
                }
                set::from_values(elements)?
            }
            op::MAP => {
                let count = self.varint()? as usize;
                let mut built = map::empty();
                for _ in 0..count {
                    let key = self.deserialize()?;
                    let value = self.deserialize()?;
                    built = map::put(&built, &key, &value)?;
                }
                built
            }
            op::ATOM => {
                let module = self.string()?;
                let name = self.string()?;
                let module = if module.is_empty() {
                    None
                } else {
                    Some(module.as_str())
                };
                self.runtime.atom(&name, module)
            }
            op::TYPE => {
                let tag = self.varint()? as u32;
                let flags = self.varint()? as u32;
                let count = self.varint()? as usize;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(self.deserialize()?);
                }
                rebuild_type(tag, flags, params)?
            }
            op::VARIABLE => {
                let inner = self.deserialize()?;
                let write_once = self.byte()? != 0;
                let rebuilt = if write_once {
                    variable::new_write_once(inner)
                } else {
                    variable::new(inner)
                };
                // Register the cell before reading its value: the value may
                // reference the variable itself.
                self.objects[slot] = rebuilt.clone();
                if self.byte()? != 0 {
                    let value = self.deserialize()?;
                    variable::set(&rebuilt, &value)?;
                }
                rebuilt
            }
            op::FUNCTION => {
                let code = self.deserialize()?;
                let count = self.varint()? as usize;
                let mut outers = Vec::with_capacity(count);
                for _ in 0..count {
                    outers.push(self.deserialize()?);
                }
                raw_function::new_function(code, outers)?
            }
            op::RAW_FUNCTION => self.deserialize_raw_function()?,
            op::CONTINUATION => {
                let caller = self.deserialize()?;
                let function = self.deserialize()?;
                let pc = self.varint()? as usize;
                let stack_pointer = self.varint()? as usize;
                let count = self.varint()? as usize;
                let mut slots = Vec::with_capacity(count);
                for _ in 0..count {
                    slots.push(self.deserialize()?);
                }
                continuation::new(caller, function, pc, stack_pointer, 0, 0, slots)
            }
            other => {
                return Err(VmError::with_detail(
                    ErrorKind::NotSupported,
                    format!("unknown serializer op {}", other),
                ));
            }
        })
    }

    fn deserialize_raw_function(&mut self) -> VmResult<AvailObject> {
        let stream_length = self.varint()? as usize;
        let stream = self.bytes(stream_length)?.to_vec();
        let literal_count = self.varint()? as usize;
        let mut literals = Vec::with_capacity(literal_count);
        for _ in 0..literal_count {
            literals.push(self.deserialize()?);
        }
        let outer_types = tuple::to_vec(&self.deserialize()?)?;
        let parameter_types = tuple::to_vec(&self.deserialize()?)?;
        let return_type = self.deserialize()?;
        let num_locals = self.varint()? as usize;
        let primitive = self.varint()? as u32;
        let mut builder = RawFunctionBuilder::new(parameter_types, return_type);
        for literal in literals {
            builder.literal(literal);
        }
        builder.locals(num_locals);
        builder.outers(outer_types);
        if primitive != 0 {
            builder.primitive(primitive);
        }
        for (_, decoded) in nybblecodes::decode_all(&stream)? {
            builder.op(decoded);
        }
        builder.build()
    }
}

/// Rebuilds a type object from its serialized tag, flags, and parameters.
fn rebuild_type(tag: u32, flags: u32, params: Vec<AvailObject>) -> VmResult<AvailObject> {
    use avail_data::types::TypeTag;
    let take2 = |mut p: Vec<AvailObject>| -> VmResult<(AvailObject, AvailObject)> {
        if p.len() != 2 {
            return Err(ErrorKind::NotSupported.into());
        }
        let second = p.pop().ok_or(ErrorKind::NotSupported)?;
        let first = p.pop().ok_or(ErrorKind::NotSupported)?;
        Ok((first, second))
    };
    let take1 = |mut p: Vec<AvailObject>| -> VmResult<AvailObject> {
        p.pop().ok_or_else(|| VmError::from(ErrorKind::NotSupported))
    };
    Ok(match tag {
        t if t == TypeTag::Bottom as u32 => types::bottom(),
        t if t == TypeTag::Any as u32 => types::any(),
        t if t == TypeTag::NilType as u32 => types::nil_type(),
        t if t == TypeTag::Number as u32 => types::number(),
        t if t == TypeTag::ExtendedInteger as u32 => types::extended_integers(),
        t if t == TypeTag::IntegerRange as u32 => {
            let (low, high) = take2(params)?;
            types::integer_range(low, flags & 1 != 0, high, flags & 2 != 0)
        }
        t if t == TypeTag::Character as u32 => types::character(),
        t if t == TypeTag::String as u32 => types::string_type(),
        t if t == TypeTag::Tuple as u32 => types::tuple_of(take1(params)?),
        t if t == TypeTag::Set as u32 => types::set_of(take1(params)?),
        t if t == TypeTag::Map as u32 => {
            let (key, value) = take2(params)?;
            types::map_of(key, value)
        }
        t if t == TypeTag::Atom as u32 => types::atom_type(),
        t if t == TypeTag::Boolean as u32 => types::boolean_type(),
        t if t == TypeTag::Function as u32 => {
            let (param_tuple, return_type) = take2(params)?;
            types::function_type(tuple::to_vec(&param_tuple)?, return_type)
        }
        t if t == TypeTag::Continuation as u32 => types::continuation_type(),
        t if t == TypeTag::Variable as u32 => types::variable_type(take1(params)?),
        t if t == TypeTag::Fiber as u32 => types::fiber_type(),
        t if t == TypeTag::Instance as u32 => types::instance_type(take1(params)?),
        t if t == TypeTag::Float as u32 => types::float_type(),
        t if t == TypeTag::Double as u32 => types::double_type(),
        _ => {
            return Err(VmError::with_detail(
                ErrorKind::NotSupported,
                format!("unknown type tag {}", tag),
            ));
        }
    })
}
