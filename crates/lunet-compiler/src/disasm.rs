/// Bytecode disassembler (luac -l style output).
use crate::opcode::{is_rk_const, rk_index, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunet_core::string::Interner;
use std::fmt::Write;

/// Disassemble a prototype and all nested prototypes.
pub fn disassemble(proto: &Proto, strings: &Interner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &Interner, level: usize) {
    let indent = "  ".repeat(level);

    let vararg = if proto.is_vararg { "+" } else { "" };
    let source = proto
        .source
        .map(|id| strings.get_lossy(id).into_owned())
        .unwrap_or_else(|| "?".to_string());
    writeln!(
        out,
        "{indent}function <{source}:{}> ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.line_defined,
        proto.num_params,
        proto.max_stack,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.line_at(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        write_instruction(out, *inst, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{i}\t").unwrap();
            match k {
                Constant::Nil => writeln!(out, "nil").unwrap(),
                Constant::Boolean(b) => writeln!(out, "{b}").unwrap(),
                Constant::Integer(n) => writeln!(out, "{n}").unwrap(),
                Constant::Float(f) => writeln!(out, "{f}").unwrap(),
                Constant::String(id) => {
                    writeln!(out, "\"{}\"", strings.get_lossy(*id)).unwrap()
                }
            }
        }
    }

    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            let name = up
                .name
                .map(|id| strings.get_lossy(id).into_owned())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{indent}\t{i}\t{name}\t{}\t{}",
                up.in_stack as u8, up.index
            )
            .unwrap();
        }
    }

    for child in &proto.protos {
        disassemble_proto(out, child, strings, level + 1);
    }
}

fn write_instruction(out: &mut String, inst: Instruction, proto: &Proto, strings: &Interner) {
    let op = inst.opcode();
    write!(out, "{:<10}", op.name()).unwrap();
    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "\t{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            let mut notes = Vec::new();
            for operand in [inst.b(), inst.c()] {
                if uses_rk(op) && is_rk_const(operand) {
                    notes.push(constant_note(proto, strings, rk_index(operand)));
                }
            }
            if !notes.is_empty() {
                write!(out, "\t; {}", notes.join(" ")).unwrap();
            }
        }
        InstructionFormat::IABx => {
            write!(out, "\t{} {}", inst.a(), inst.bx()).unwrap();
            if op == OpCode::LoadK {
                write!(out, "\t; {}", constant_note(proto, strings, inst.bx())).unwrap();
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "\t{} {}", inst.a(), inst.sbx()).unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, "\t{}", inst.ax_field()).unwrap();
        }
    }
}

fn uses_rk(op: OpCode) -> bool {
    use OpCode::*;
    matches!(
        op,
        GetTabUp
            | GetTable
            | SetTabUp
            | SetTable
            | Self_
            | Add
            | Sub
            | Mul
            | Mod
            | Pow
            | Div
            | IDiv
            | BAnd
            | BOr
            | BXor
            | Shl
            | Shr
            | Eq
            | Lt
            | Le
    )
}

fn constant_note(proto: &Proto, strings: &Interner, idx: u32) -> String {
    match proto.constants.get(idx as usize) {
        Some(Constant::String(id)) => format!("\"{}\"", strings.get_lossy(*id)),
        Some(Constant::Integer(i)) => i.to_string(),
        Some(Constant::Float(f)) => f.to_string(),
        Some(Constant::Boolean(b)) => b.to_string(),
        Some(Constant::Nil) => "nil".to_string(),
        None => format!("K{idx}?"),
    }
}
