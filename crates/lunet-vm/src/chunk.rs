//! Lua 5.3 binary chunk serialization (dump) and deserialization (undump).
//!
//! The wire format is bit-compatible with the reference toolchain's luac
//! output on 64-bit systems: a fixed 33-byte header (signature, version
//! 0x53, format 0, conversion-check data, field sizes, an integer canary
//! 0x5678 and a float canary 370.5), then the main function. Chunks with a
//! 4-byte `size_t` are accepted as input; output always uses 8 bytes.

use crate::error::{Error, ErrorKind};
use lunet_compiler::opcode::{Instruction, OpCode};
use lunet_compiler::proto::{Constant, LocalVar, Proto, UpvalDesc};
use lunet_core::string::{Interner, StrId};

pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x53;
const LUAC_FORMAT: u8 = 0;
/// Detects transmission mangling of \r\n and friends.
const LUAC_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const SIZE_C_INT: u8 = 4;
const SIZE_SIZE_T: u8 = 8;
const SIZE_INSTRUCTION: u8 = 4;
const SIZE_LUA_INT: u8 = 8;
const SIZE_LUA_NUM: u8 = 8;
const LUAC_INT: i64 = 0x5678;
const LUAC_NUM: f64 = 370.5;

// Constant tags: primary type in the low nibble, variant in bit 4.
const TAG_NIL: u8 = 0x00;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_NUMFLT: u8 = 0x03;
const TAG_NUMINT: u8 = 0x03 | (1 << 4);
const TAG_SHRSTR: u8 = 0x04;
const TAG_LNGSTR: u8 = 0x04 | (1 << 4);

/// Longest string length encoded in the one-byte short form.
const SHORT_LEN_MAX: usize = 0xFE;

fn load_error(name: &str, msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::BinLoader, format!("{name}: {}", msg.into()))
}

// ─── Dumper ─────────────────────────────────────────────────────────────

/// Serialize a prototype tree. `strip` drops debug information.
pub fn dump(proto: &Proto, strings: &Interner, strip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    write_header(&mut out);
    out.push(proto.upvalues.len() as u8);
    write_function(&mut out, proto, strings, strip, None);
    out
}

fn write_header(out: &mut Vec<u8>) {
    out.extend_from_slice(LUA_SIGNATURE);
    out.push(LUAC_VERSION);
    out.push(LUAC_FORMAT);
    out.extend_from_slice(LUAC_DATA);
    out.push(SIZE_C_INT);
    out.push(SIZE_SIZE_T);
    out.push(SIZE_INSTRUCTION);
    out.push(SIZE_LUA_INT);
    out.push(SIZE_LUA_NUM);
    out.extend_from_slice(&LUAC_INT.to_le_bytes());
    out.extend_from_slice(&LUAC_NUM.to_le_bytes());
}

fn write_int(out: &mut Vec<u8>, n: i32) {
    out.extend_from_slice(&n.to_le_bytes());
}

/// Strings carry length-plus-one with a 0xFF escape to a full `size_t`;
/// an absent string is the single byte 0.
fn write_string(out: &mut Vec<u8>, s: Option<&[u8]>) {
    match s {
        None => out.push(0),
        Some(bytes) => {
            let size = bytes.len() + 1;
            if size <= SHORT_LEN_MAX {
                out.push(size as u8);
            } else {
                out.push(0xFF);
                out.extend_from_slice(&(size as u64).to_le_bytes());
            }
            out.extend_from_slice(bytes);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    proto: &Proto,
    strings: &Interner,
    strip: bool,
    parent_source: Option<StrId>,
) {
    // Source name, elided when the parent already carries it.
    if strip || proto.source == parent_source {
        write_string(out, None);
    } else {
        write_string(out, proto.source.map(|id| strings.get_bytes(id)));
    }

    write_int(out, proto.line_defined as i32);
    write_int(out, proto.last_line_defined as i32);
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack);

    write_int(out, proto.code.len() as i32);
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    write_int(out, proto.constants.len() as i32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(TAG_NIL),
            Constant::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.push(*b as u8);
            }
            Constant::Float(f) => {
                out.push(TAG_NUMFLT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Constant::Integer(i) => {
                out.push(TAG_NUMINT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Constant::String(id) => {
                let bytes = strings.get_bytes(*id);
                out.push(if bytes.len() <= 40 { TAG_SHRSTR } else { TAG_LNGSTR });
                write_string(out, Some(bytes));
            }
        }
    }

    write_int(out, proto.upvalues.len() as i32);
    for uv in &proto.upvalues {
        out.push(uv.in_stack as u8);
        out.push(uv.index);
    }

    write_int(out, proto.protos.len() as i32);
    for child in &proto.protos {
        write_function(out, child, strings, strip, proto.source);
    }

    // Debug block: line info, local variables, upvalue names.
    if strip {
        write_int(out, 0);
        write_int(out, 0);
        write_int(out, 0);
    } else {
        write_int(out, proto.line_info.len() as i32);
        for &line in &proto.line_info {
            write_int(out, line as i32);
        }
        write_int(out, proto.local_vars.len() as i32);
        for lv in &proto.local_vars {
            write_string(out, Some(strings.get_bytes(lv.name)));
            write_int(out, lv.start_pc as i32);
            write_int(out, lv.end_pc as i32);
        }
        write_int(out, proto.upvalues.len() as i32);
        for uv in &proto.upvalues {
            write_string(out, uv.name.map(|id| strings.get_bytes(id)));
        }
    }
}

// ─── Loader ─────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    name: &'a str,
    /// 4 or 8, from the header; affects the long-string length field.
    size_t_width: u8,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, Error> {
        let b = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| load_error(self.name, "truncated chunk"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(load_error(self.name, "truncated chunk"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32_le(&mut self) -> Result<u32, Error> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn int(&mut self) -> Result<i32, Error> {
        Ok(self.u32_le()? as i32)
    }

    fn i64_le(&mut self) -> Result<i64, Error> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64_le(&mut self) -> Result<f64, Error> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn size_t(&mut self) -> Result<usize, Error> {
        if self.size_t_width == 4 {
            Ok(self.u32_le()? as usize)
        } else {
            Ok(self.i64_le()? as usize)
        }
    }

    fn string(&mut self, strings: &mut Interner) -> Result<Option<StrId>, Error> {
        let first = self.byte()?;
        let size = match first {
            0 => return Ok(None),
            0xFF => self.size_t()?,
            b => b as usize,
        };
        let bytes = self.bytes(size - 1)?;
        Ok(Some(strings.intern(bytes)))
    }
}

/// Deserialize a binary chunk into a prototype tree, interning every
/// string into the given interner.
pub fn undump(data: &[u8], name: &str, strings: &mut Interner) -> Result<Proto, Error> {
    let mut r = Reader {
        data,
        pos: 0,
        name,
        size_t_width: SIZE_SIZE_T,
    };
    check_header(&mut r)?;
    let _main_upvals = r.byte()?;
    let mut proto = read_function(&mut r, strings, None)?;
    if proto.source.is_none() {
        proto.source = Some(strings.intern(name.as_bytes()));
    }
    Ok(proto)
}

fn check_header(r: &mut Reader) -> Result<(), Error> {
    if r.bytes(4)? != LUA_SIGNATURE {
        return Err(load_error(r.name, "not a binary chunk"));
    }
    if r.byte()? != LUAC_VERSION {
        return Err(load_error(r.name, "version mismatch"));
    }
    if r.byte()? != LUAC_FORMAT {
        return Err(load_error(r.name, "format mismatch"));
    }
    if r.bytes(6)? != LUAC_DATA {
        return Err(load_error(r.name, "corrupted chunk"));
    }
    if r.byte()? != SIZE_C_INT {
        return Err(load_error(r.name, "int size mismatch"));
    }
    let size_t_width = r.byte()?;
    if size_t_width != 4 && size_t_width != 8 {
        return Err(load_error(r.name, "size_t size mismatch"));
    }
    r.size_t_width = size_t_width;
    if r.byte()? != SIZE_INSTRUCTION {
        return Err(load_error(r.name, "instruction size mismatch"));
    }
    if r.byte()? != SIZE_LUA_INT {
        return Err(load_error(r.name, "integer size mismatch"));
    }
    if r.byte()? != SIZE_LUA_NUM {
        return Err(load_error(r.name, "float size mismatch"));
    }
    if r.i64_le()? != LUAC_INT {
        return Err(load_error(r.name, "endianness mismatch"));
    }
    if r.f64_le()? != LUAC_NUM {
        return Err(load_error(r.name, "float format mismatch"));
    }
    Ok(())
}

fn read_function(
    r: &mut Reader,
    strings: &mut Interner,
    parent_source: Option<StrId>,
) -> Result<Proto, Error> {
    let mut proto = Proto::new();

    proto.source = r.string(strings)?.or(parent_source);
    proto.line_defined = r.int()? as u32;
    proto.last_line_defined = r.int()? as u32;
    proto.num_params = r.byte()?;
    proto.is_vararg = r.byte()? != 0;
    proto.max_stack = r.byte()?;

    let code_len = r.int()? as usize;
    proto.code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        let word = Instruction(r.u32_le()?);
        if OpCode::from_u8(word.raw_opcode()).is_none() {
            return Err(load_error(r.name, format!("bad opcode {}", word.raw_opcode())));
        }
        proto.code.push(word);
    }

    let const_len = r.int()? as usize;
    proto.constants = Vec::with_capacity(const_len);
    for _ in 0..const_len {
        let k = match r.byte()? {
            TAG_NIL => Constant::Nil,
            TAG_BOOLEAN => Constant::Boolean(r.byte()? != 0),
            TAG_NUMFLT => Constant::Float(r.f64_le()?),
            TAG_NUMINT => Constant::Integer(r.i64_le()?),
            TAG_SHRSTR | TAG_LNGSTR => {
                let id = r
                    .string(strings)?
                    .ok_or_else(|| load_error(r.name, "empty string constant"))?;
                Constant::String(id)
            }
            tag => return Err(load_error(r.name, format!("bad constant tag {tag}"))),
        };
        proto.constants.push(k);
    }

    let upval_len = r.int()? as usize;
    proto.upvalues = Vec::with_capacity(upval_len);
    for _ in 0..upval_len {
        let in_stack = r.byte()? != 0;
        let index = r.byte()?;
        proto.upvalues.push(UpvalDesc {
            name: None,
            in_stack,
            index,
        });
    }

    let proto_len = r.int()? as usize;
    proto.protos = Vec::with_capacity(proto_len);
    for _ in 0..proto_len {
        proto.protos.push(read_function(r, strings, proto.source)?);
    }

    // Debug block.
    let line_len = r.int()? as usize;
    proto.line_info = Vec::with_capacity(line_len);
    for _ in 0..line_len {
        proto.line_info.push(r.int()? as u32);
    }

    let local_len = r.int()? as usize;
    proto.local_vars = Vec::with_capacity(local_len);
    for _ in 0..local_len {
        let name = r
            .string(strings)?
            .ok_or_else(|| load_error(r.name, "missing local name"))?;
        let start_pc = r.int()? as u32;
        let end_pc = r.int()? as u32;
        proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }

    let upname_len = r.int()? as usize;
    for i in 0..upname_len {
        let name = r.string(strings)?;
        if i < proto.upvalues.len() {
            proto.upvalues[i].name = name;
        }
    }

    Ok(proto)
}

/// Whether a chunk's first bytes are the binary signature.
pub fn looks_binary(data: &[u8]) -> bool {
    data.starts_with(LUA_SIGNATURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lunet_compiler::compile;

    fn protos_equal(a: &Proto, b: &Proto, strings: &Interner) -> bool {
        a.code == b.code
            && a.constants == b.constants
            && a.num_params == b.num_params
            && a.is_vararg == b.is_vararg
            && a.max_stack == b.max_stack
            && a.line_info == b.line_info
            && a.upvalues.len() == b.upvalues.len()
            && a.protos.len() == b.protos.len()
            && a.protos
                .iter()
                .zip(b.protos.iter())
                .all(|(x, y)| protos_equal(x, y, strings))
    }

    #[test]
    fn header_is_33_bytes() {
        let mut out = Vec::new();
        write_header(&mut out);
        assert_eq!(out.len(), 33);
        assert_eq!(&out[0..4], LUA_SIGNATURE);
        assert_eq!(out[4], 0x53);
    }

    #[test]
    fn roundtrip_simple_chunk() {
        let (proto, strings) = compile(b"local x = 1.5\nreturn x + 2", "=rt").unwrap();
        let blob = dump(&proto, &strings, false);
        let mut strings2 = Interner::new();
        let restored = undump(&blob, "=rt", &mut strings2).unwrap();
        // String ids differ between interners; compare structure.
        assert_eq!(restored.code, proto.code);
        assert_eq!(restored.num_params, proto.num_params);
        assert_eq!(restored.is_vararg, proto.is_vararg);
        assert_eq!(restored.line_info, proto.line_info);
        assert_eq!(restored.constants.len(), proto.constants.len());
    }

    #[test]
    fn roundtrip_nested_functions() {
        let src = b"local function outer(a)\n  return function() return a end\nend\nreturn outer";
        let (proto, strings) = compile(src, "=nest").unwrap();
        let blob = dump(&proto, &strings, false);
        let restored = undump(&blob, "=nest", &mut Interner::new()).unwrap();
        assert_eq!(restored.protos.len(), proto.protos.len());
        assert!(protos_equal(&restored, &proto, &strings));
    }

    #[test]
    fn roundtrip_preserves_string_content() {
        let (proto, strings) = compile(b"return 'hello world'", "=s").unwrap();
        let blob = dump(&proto, &strings, false);
        let mut strings2 = Interner::new();
        let restored = undump(&blob, "=s", &mut strings2).unwrap();
        let Constant::String(id) = restored
            .constants
            .iter()
            .find(|k| matches!(k, Constant::String(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(strings2.get_bytes(*id), b"hello world");
    }

    #[test]
    fn long_string_constant_uses_escape() {
        let long = "x".repeat(400);
        let src = format!("return '{long}'");
        let (proto, strings) = compile(src.as_bytes(), "=l").unwrap();
        let blob = dump(&proto, &strings, false);
        // The 0xFF escape must appear before the long payload.
        assert!(blob.windows(1).any(|w| w[0] == 0xFF));
        let restored = undump(&blob, "=l", &mut Interner::new()).unwrap();
        assert_eq!(restored.constants.len(), proto.constants.len());
    }

    #[test]
    fn strip_removes_debug_info() {
        let (proto, strings) = compile(b"local abc = 1\nreturn abc", "=d").unwrap();
        let full = dump(&proto, &strings, false);
        let stripped = dump(&proto, &strings, true);
        assert!(stripped.len() < full.len());
        let restored = undump(&stripped, "=d", &mut Interner::new()).unwrap();
        assert!(restored.line_info.is_empty());
        assert!(restored.local_vars.is_empty());
        assert_eq!(restored.code, proto.code);
    }

    #[test]
    fn rejects_bad_signature() {
        let err = undump(b"\x1bNot", "=x", &mut Interner::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BinLoader);
        assert!(err.to_string().contains("not a binary chunk"));
    }

    #[test]
    fn rejects_wrong_version() {
        let (proto, strings) = compile(b"return 1", "=v").unwrap();
        let mut blob = dump(&proto, &strings, false);
        blob[4] = 0x52;
        assert!(undump(&blob, "=v", &mut Interner::new())
            .unwrap_err()
            .to_string()
            .contains("version"));
    }

    #[test]
    fn rejects_truncation() {
        let (proto, strings) = compile(b"return 1", "=t").unwrap();
        let blob = dump(&proto, &strings, false);
        for cut in [10, 33, blob.len() - 1] {
            assert!(undump(&blob[..cut], "=t", &mut Interner::new()).is_err());
        }
    }

    #[test]
    fn accepts_four_byte_size_t() {
        // Build a chunk, then rewrite its size_t width to 4. Our strings
        // all use the short form, so only the header byte changes.
        let (proto, strings) = compile(b"return 'ok'", "=4", ).unwrap();
        let mut blob = dump(&proto, &strings, false);
        blob[13] = 4; // size_t field of the header
        let restored = undump(&blob, "=4", &mut Interner::new());
        assert!(restored.is_ok());
    }

    #[test]
    fn source_inherited_by_children() {
        let (proto, strings) = compile(b"local f = function() end", "=src").unwrap();
        let blob = dump(&proto, &strings, false);
        let mut strings2 = Interner::new();
        let restored = undump(&blob, "=src", &mut strings2).unwrap();
        let child_src = restored.protos[0].source.unwrap();
        assert_eq!(strings2.get_bytes(child_src), b"=src");
    }
}
