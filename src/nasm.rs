use crate::parx_format::{CmpOp, Instr};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

pub const ASM_FILE: &str = "parashade_main.asm";
pub const BUILD_SCRIPT: &str = "build.bat";

const BUILD_BAT: &str = r#"REM Build PE from NASM with MSVC LINK
@echo off
setlocal
if "%VSCMD_ARG_TGT_ARCH%"=="" (
  echo (Tip) Run from "x64 Native Tools Command Prompt for VS" so link.exe is on PATH.
)
if "%1"=="" ( set OUT=parashade.exe ) else ( set OUT=%1 )
echo Assembling...
nasm -f win64 parashade_main.asm -o parashade_main.obj || exit /b 1
echo Linking...
link /subsystem:console /entry:main parashade_main.obj kernel32.lib /out:%OUT% || exit /b 1
echo Done: %OUT%
"#;

// the machine stack mirrors the IR operand stack: every value-producing
// lowering ends in a push, every consumer pops
pub fn emit_nasm(instrs: &[Instr], local_count: usize) -> String {
    let uses_arrays = instrs
        .iter()
        .any(|i| matches!(i, Instr::ArrNew | Instr::ArrGet | Instr::ArrSet));

    let mut text = String::new();
    text.push_str("default rel\n");
    text.push_str("extern ExitProcess\n");
    if uses_arrays {
        text.push_str("extern GetProcessHeap\n");
        text.push_str("extern HeapAlloc\n");
    }
    text.push_str("section .text\n");
    text.push_str("global main\n");
    text.push_str("main:\n");
    text.push_str("    push rbp\n");
    text.push_str("    mov rbp, rsp\n");
    // locals + 32 bytes of shadow space, kept 16-aligned
    let reserve = (local_count * 8 + 32 + 15) & !15;
    let _ = writeln!(text, "    sub rsp, {}", reserve);
    if uses_arrays {
        text.push_str("    call GetProcessHeap\n");
        text.push_str("    mov rsi, rax\n");
    }

    // control-flow labels, one per distinct branch target
    let targets: BTreeSet<usize> = instrs
        .iter()
        .filter_map(|i| match i {
            Instr::JzAbs(t) | Instr::JmpAbs(t) => Some(*t),
            _ => None,
        })
        .collect();

    let mut arr_seq = 0usize;
    for (idx, instr) in instrs.iter().enumerate() {
        if targets.contains(&idx) {
            let _ = writeln!(text, ".bb{}:", idx);
        }
        emit_instr(&mut text, instr, &mut arr_seq);
    }
    if targets.contains(&instrs.len()) {
        let _ = writeln!(text, ".bb{}:", instrs.len());
    }

    text.push_str(".epilogue:\n");
    text.push_str("    mov ecx, eax\n");
    text.push_str("    call ExitProcess\n");
    text
}

fn emit_instr(text: &mut String, instr: &Instr, arr_seq: &mut usize) {
    match instr {
        Instr::PushImm64(v) => {
            let _ = writeln!(text, "    mov rax, 0x{:x}", v);
            text.push_str("    push rax\n");
        }
        Instr::Add => {
            text.push_str("    pop rbx\n");
            text.push_str("    pop rax\n");
            text.push_str("    add rax, rbx\n");
            text.push_str("    push rax\n");
        }
        Instr::Dup => {
            text.push_str("    pop rax\n");
            text.push_str("    push rax\n");
            text.push_str("    push rax\n");
        }
        Instr::StoreLocal(idx) => {
            text.push_str("    pop rax\n");
            let _ = writeln!(text, "    mov [rbp - {}], rax", local_offset(*idx));
        }
        Instr::LoadLocal(idx) => {
            let _ = writeln!(text, "    mov rax, [rbp - {}]", local_offset(*idx));
            text.push_str("    push rax\n");
        }
        Instr::Ret => {
            text.push_str("    pop rax\n");
            text.push_str("    jmp .epilogue\n");
        }
        Instr::Max => {
            text.push_str("    pop rbx\n");
            text.push_str("    pop rax\n");
            text.push_str("    cmp rax, rbx\n");
            text.push_str("    cmovl rax, rbx\n");
            text.push_str("    push rax\n");
        }
        Instr::Min => {
            text.push_str("    pop rbx\n");
            text.push_str("    pop rax\n");
            text.push_str("    cmp rax, rbx\n");
            text.push_str("    cmovg rax, rbx\n");
            text.push_str("    push rax\n");
        }
        Instr::Cmp(op) => {
            text.push_str("    pop rbx\n");
            text.push_str("    pop rax\n");
            text.push_str("    cmp rax, rbx\n");
            let _ = writeln!(text, "    set{} al", cc_suffix(*op));
            text.push_str("    movzx rax, al\n");
            text.push_str("    push rax\n");
        }
        Instr::ArrNew => {
            // HeapAlloc(heap, 0, len*8 + 8); length prefix at offset 0
            text.push_str("    pop rdi\n");
            text.push_str("    lea r8, [rdi*8 + 8]\n");
            text.push_str("    mov rcx, rsi\n");
            text.push_str("    xor edx, edx\n");
            text.push_str("    sub rsp, 32\n");
            text.push_str("    call HeapAlloc\n");
            text.push_str("    add rsp, 32\n");
            text.push_str("    mov [rax], rdi\n");
            text.push_str("    push rax\n");
        }
        Instr::ArrGet => {
            let n = *arr_seq;
            *arr_seq += 1;
            text.push_str("    pop rcx\n");
            text.push_str("    pop rax\n");
            text.push_str("    mov rdx, [rax]\n");
            text.push_str("    cmp rcx, rdx\n");
            let _ = writeln!(text, "    jae .ag{}_oob", n);
            text.push_str("    mov rax, [rax + 8 + rcx*8]\n");
            let _ = writeln!(text, "    jmp .ag{}_done", n);
            let _ = writeln!(text, ".ag{}_oob:", n);
            text.push_str("    xor eax, eax\n");
            let _ = writeln!(text, ".ag{}_done:", n);
            text.push_str("    push rax\n");
        }
        Instr::ArrSet => {
            let n = *arr_seq;
            *arr_seq += 1;
            text.push_str("    pop rdx\n");
            text.push_str("    pop rcx\n");
            text.push_str("    pop rax\n");
            text.push_str("    mov rbx, [rax]\n");
            text.push_str("    cmp rcx, rbx\n");
            let _ = writeln!(text, "    jae .as{}_skip", n);
            text.push_str("    mov [rax + 8 + rcx*8], rdx\n");
            let _ = writeln!(text, ".as{}_skip:", n);
            text.push_str("    push rax\n");
        }
        Instr::JzAbs(target) => {
            text.push_str("    pop rax\n");
            text.push_str("    test rax, rax\n");
            let _ = writeln!(text, "    jz .bb{}", target);
        }
        Instr::JmpAbs(target) => {
            let _ = writeln!(text, "    jmp .bb{}", target);
        }
    }
}

fn local_offset(index: u16) -> usize {
    (index as usize + 1) * 8
}

fn cc_suffix(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Gt => "g",
        CmpOp::Lt => "l",
        CmpOp::Eq => "e",
        CmpOp::Ne => "ne",
        CmpOp::Ge => "ge",
        CmpOp::Le => "le",
    }
}

pub fn write_artifacts(instrs: &[Instr], local_count: usize, outdir: &Path) -> io::Result<()> {
    fs::create_dir_all(outdir)?;
    fs::write(outdir.join(ASM_FILE), emit_nasm(instrs, local_count))?;
    fs::write(outdir.join(BUILD_SCRIPT), BUILD_BAT)?;
    Ok(())
}
