//! lunet command-line driver: run scripts, list compiled bytecode, dump
//! binary chunks, or start a REPL.

use lunet_vm::State;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::process::exit;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match args.first().map(String::as_str) {
        None => repl(),
        Some("run") => with_path(&args, |path| run_file(path)),
        Some("list") => with_path(&args, |path| list_file(path)),
        Some("dump") => dump_file(&args),
        Some("-h") | Some("--help") => {
            usage();
            Ok(())
        }
        Some("-v") | Some("--version") => {
            println!("lunet {} -- Lua 5.3", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        // A bare path runs it.
        Some(path) => run_file(path),
    };

    if let Err(msg) = result {
        eprintln!("lunet: {msg}");
        exit(1);
    }
}

fn usage() {
    eprintln!("usage: lunet [run|list|dump] script.lua");
    eprintln!("       lunet            (interactive)");
    eprintln!("  run   execute a script (text or binary chunk)");
    eprintln!("  list  print the compiled bytecode listing");
    eprintln!("  dump  compile and write a binary chunk (script.luac)");
}

fn with_path<F>(args: &[String], f: F) -> Result<(), String>
where
    F: FnOnce(&str) -> Result<(), String>,
{
    match args.get(1) {
        Some(path) => f(path),
        None => {
            usage();
            Err("missing script path".into())
        }
    }
}

fn new_state() -> Result<State, String> {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).map_err(|e| e.to_string())?;
    Ok(l)
}

fn read_chunk(path: &str) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("cannot open {path}: {e}"))
}

fn run_file(path: &str) -> Result<(), String> {
    let source = read_chunk(path)?;
    let mut l = new_state()?;
    let name = format!("@{path}");
    l.load(&source, &name, "bt").map_err(|e| e.to_string())?;
    l.pcall(0, -1).map_err(|e| e.to_string())?;
    Ok(())
}

fn list_file(path: &str) -> Result<(), String> {
    let source = read_chunk(path)?;
    let name = format!("@{path}");
    let (proto, strings) =
        lunet_compiler::compile(&source, &name).map_err(|e| e.to_string())?;
    print!("{}", lunet_compiler::disasm::disassemble(&proto, &strings));
    Ok(())
}

fn dump_file(args: &[String]) -> Result<(), String> {
    let path = args.get(1).ok_or_else(|| {
        usage();
        "missing script path".to_string()
    })?;
    let out_path = match args.get(2).map(String::as_str) {
        Some("-o") => args
            .get(3)
            .cloned()
            .ok_or_else(|| "'-o' needs a file name".to_string())?,
        _ => format!("{}c", path),
    };
    let source = read_chunk(path)?;
    let mut l = new_state()?;
    let name = format!("@{path}");
    l.load(&source, &name, "t").map_err(|e| e.to_string())?;
    let blob = l.dump_function(-1, false).map_err(|e| e.to_string())?;
    std::fs::write(&out_path, blob).map_err(|e| format!("cannot write {out_path}: {e}"))?;
    eprintln!("wrote {out_path}");
    Ok(())
}

fn repl() -> Result<(), String> {
    println!("lunet {} -- Lua 5.3", env!("CARGO_PKG_VERSION"));
    let mut l = new_state()?;
    let mut editor = DefaultEditor::new().map_err(|e| e.to_string())?;

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Try expression form first so `1 + 2` echoes its value.
                let as_expr = format!("return {line}");
                let ran = match l.do_string(&as_expr, "=stdin") {
                    Ok(n) => {
                        print_results(&mut l, n);
                        true
                    }
                    Err(_) => false,
                };
                if !ran {
                    match l.do_string(&line, "=stdin") {
                        Ok(n) => print_results(&mut l, n),
                        Err(e) => eprintln!("lunet: {e}"),
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

fn print_results(l: &mut State, n: usize) {
    if n == 0 {
        return;
    }
    let mut parts = Vec::with_capacity(n);
    for i in 0..n {
        let idx = -(n as i64) + i as i64;
        match l.value_at(idx) {
            Ok(v) => match l.display_value(v) {
                Ok(s) => parts.push(s),
                Err(e) => parts.push(format!("<error: {e}>")),
            },
            Err(_) => parts.push("<gone>".into()),
        }
    }
    println!("{}", parts.join("\t"));
    l.pop(n);
}
