use parashade::frontend::compile_module;
use parashade::{meta, nasm, parx_vm};
use std::env;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

enum Mode {
    Run,
    Emit,
    EmitNasm(String),
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let mode = match parse_mode(&args) {
        Some(mode) => mode,
        None => {
            eprintln!("{}", usage());
            return ExitCode::from(1);
        }
    };

    let mut raw = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut raw) {
        eprintln!("Compile/Run error: failed to read stdin: {e}");
        return ExitCode::from(2);
    }
    let source = String::from_utf8_lossy(&raw);

    match run_mode(&mode, &source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("Compile/Run error: {msg}");
            ExitCode::from(2)
        }
    }
}

fn parse_mode(args: &[String]) -> Option<Mode> {
    match args {
        [a] if a == "--run" => Some(Mode::Run),
        [a] if a == "--emit" => Some(Mode::Emit),
        [a, outdir] if a == "--emit-nasm" => Some(Mode::EmitNasm(outdir.clone())),
        _ => None,
    }
}

fn run_mode(mode: &Mode, source: &str) -> Result<(), String> {
    let compiled = compile_module(source).map_err(|e| e.to_string())?;
    match mode {
        Mode::Run => {
            let ret =
                parx_vm::run(&compiled.code, compiled.symbols.len()).map_err(|e| e.to_string())?;
            println!("{ret}");
        }
        Mode::Emit => {
            println!("; PARASHADE v0.3 HEX IR ({} bytes)", compiled.code.len());
            println!("{}", hex_dump(&compiled.code));
            println!();
            println!("; METADATA");
            let doc = meta::build_metadata(
                &compiled.module,
                &compiled.symbols,
                &compiled.diagnostics,
            );
            let json = meta::metadata_json(&doc).map_err(|e| e.to_string())?;
            println!("{json}");
        }
        Mode::EmitNasm(outdir) => {
            nasm::write_artifacts(&compiled.instrs, compiled.symbols.len(), Path::new(outdir))
                .map_err(|e| e.to_string())?;
            println!("Wrote {}/{} and {}", outdir, nasm::ASM_FILE, nasm::BUILD_SCRIPT);
        }
    }
    Ok(())
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            if i % 16 == 0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn usage() -> String {
    [
        "Parashade v0.3 (reads source from stdin)",
        "  parashade --run                 compile and interpret",
        "  parashade --emit                print bytecode hex and metadata",
        "  parashade --emit-nasm <outdir>  write parashade_main.asm and build.bat",
    ]
    .join("\n")
}
