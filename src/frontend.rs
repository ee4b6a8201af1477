use crate::parx_format::{self, CmpOp, Instr};
use std::collections::HashMap;

pub const PARASHADE_EBNF: &str = r#"
Module     = "module" Ident ":" Scope ;
Scope      = "scope" "main" "range" Ident ":" { Stmt } "end" ;
Stmt       = LetStmt | ReturnStmt | IfStmt ;
LetStmt    = "let" [ "int" | "arr" ] Ident "=" Expr ;
ReturnStmt = "return" Expr ;
IfStmt     = "if" "(" Expr ")" ":" { Stmt } [ "else" ":" { Stmt } ] "end" ;
Expr       = Primary { "+" Primary } ;
Primary    = Number | Ident [ "(" [ Expr { "," Expr } ] ")" ] | "(" Expr ")" ;
Number     = dec-digits | ( "0x" | "0X" ) hex-digits ;   // '_' allowed in hex
"#;

// ---------------------------------------------------------------------------
// Long-form -> core normalizer
// ---------------------------------------------------------------------------

pub fn normalize_longform(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for raw_line in input.lines() {
        let line = match raw_line.find(';') {
            Some(sc) => &raw_line[..sc],
            None => raw_line,
        };
        // the declaration phrases end in a space and swallow it; the
        // single-word rules leave surrounding whitespace alone
        let mut text = replace_words(
            line,
            &["declare", "explicit", "integer", "named"],
            "let int ",
            true,
        );
        text = replace_words(&text, &["declare", "implicit", "named"], "let ", true);
        text = replace_words(&text, &["equals"], "=", false);
        text = replace_words(&text, &["end"], "", false);
        text = replace_words(&text, &["plus"], "+", false);
        out.push_str(text.trim());
        out.push('\n');
    }
    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// whole-word, case-sensitive; eat_trailing_ws requires and consumes the
// whitespace after the last word
fn replace_words(line: &str, words: &[&str], replacement: &str, eat_trailing_ws: bool) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0usize;
    let mut copied = 0usize;
    while i < bytes.len() {
        if let Some(end) = match_words(bytes, i, words, eat_trailing_ws) {
            // match boundaries are ASCII, so these are char boundaries
            out.push_str(&line[copied..i]);
            out.push_str(replacement);
            i = end;
            copied = end;
        } else {
            i += 1;
        }
    }
    out.push_str(&line[copied..]);
    out
}

fn match_words(bytes: &[u8], at: usize, words: &[&str], eat_trailing_ws: bool) -> Option<usize> {
    if at > 0 && is_word_byte(bytes[at - 1]) {
        return None;
    }
    let mut i = at;
    for (k, word) in words.iter().enumerate() {
        if k > 0 {
            let ws_start = i;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i == ws_start {
                return None;
            }
        }
        let w = word.as_bytes();
        if bytes.len() < i + w.len() || &bytes[i..i + w.len()] != w {
            return None;
        }
        i += w.len();
    }
    if eat_trailing_ws {
        let ws_start = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == ws_start {
            return None;
        }
    } else if i < bytes.len() && is_word_byte(bytes[i]) {
        return None;
    }
    Some(i)
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    Ident,
    Number,
    Colon,
    Equals,
    Plus,
    Comma,
    LParen,
    RParen,
    KwModule,
    KwScope,
    KwRange,
    KwLet,
    KwInt,
    KwArr,
    KwReturn,
    KwEnd,
    KwIf,
    KwElse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

pub fn lex(input: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut line_no = 0u32;
    for raw_line in input.lines() {
        line_no += 1;
        let line = match raw_line.find(';') {
            Some(sc) => &raw_line[..sc],
            None => raw_line,
        };
        let bytes = line.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let c = bytes[i];
            if c.is_ascii_whitespace() {
                i += 1;
                continue;
            }
            let punct = match c {
                b'(' => Some(TokenKind::LParen),
                b')' => Some(TokenKind::RParen),
                b',' => Some(TokenKind::Comma),
                b':' => Some(TokenKind::Colon),
                b'=' => Some(TokenKind::Equals),
                b'+' => Some(TokenKind::Plus),
                _ => None,
            };
            if let Some(kind) = punct {
                out.push(Token {
                    kind,
                    text: (c as char).to_string(),
                    line: line_no,
                });
                i += 1;
                continue;
            }
            if c.is_ascii_alphabetic() || c == b'_' {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                let word = line[start..i].to_ascii_lowercase();
                let kind = match word.as_str() {
                    "module" => TokenKind::KwModule,
                    "scope" => TokenKind::KwScope,
                    "range" => TokenKind::KwRange,
                    "let" => TokenKind::KwLet,
                    "int" => TokenKind::KwInt,
                    "arr" => TokenKind::KwArr,
                    "return" => TokenKind::KwReturn,
                    "end" => TokenKind::KwEnd,
                    "if" => TokenKind::KwIf,
                    "else" => TokenKind::KwElse,
                    _ => TokenKind::Ident,
                };
                out.push(Token {
                    kind,
                    text: word,
                    line: line_no,
                });
                continue;
            }
            if c.is_ascii_digit() {
                let start = i;
                i += 1;
                if c == b'0' && i < bytes.len() && (bytes[i] == b'x' || bytes[i] == b'X') {
                    i += 1;
                    while i < bytes.len() && (bytes[i].is_ascii_hexdigit() || bytes[i] == b'_') {
                        i += 1;
                    }
                } else {
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                out.push(Token {
                    kind: TokenKind::Number,
                    text: line[start..i].to_string(),
                    line: line_no,
                });
                continue;
            }
            // not part of any token class
            i += 1;
        }
    }
    out.push(Token {
        kind: TokenKind::Eof,
        text: String::new(),
        line: line_no.max(1),
    });
    out
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Num {
        value: u64,
        line: u32,
    },
    Var {
        name: String,
        line: u32,
    },
    Add {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: u32,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        line: u32,
    },
}

impl Expr {
    pub fn line(&self) -> u32 {
        match self {
            Expr::Num { line, .. }
            | Expr::Var { line, .. }
            | Expr::Add { line, .. }
            | Expr::Call { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclType {
    Implicit,
    Int,
    Arr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Let {
        name: String,
        decl: DeclType,
        init: Expr,
        line: u32,
    },
    Return {
        expr: Expr,
        line: u32,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        line: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub line: u32,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub main: Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub fn parse_module(input: &str) -> Result<Module, CompileError> {
    let tokens = lex(input);
    let mut p = Parser { tokens, idx: 0 };
    let module = p.parse_module()?;
    if !p.check(TokenKind::Eof) {
        return Err(CompileError::new(
            p.line(),
            "unexpected trailing tokens after module",
        ));
    }
    Ok(module)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn parse_module(&mut self) -> Result<Module, CompileError> {
        self.expect(TokenKind::KwModule, "expected 'module'")?;
        let name = self.expect_ident("module: expected identifier")?;
        self.expect(TokenKind::Colon, "expected ':' after module name")?;
        let main = self.parse_scope()?;
        Ok(Module { name, main })
    }

    // The normalizer deletes every literal `end`, so statement lists also
    // terminate at end-of-input; a surviving `end` keyword (core text fed in
    // directly) is consumed when present.
    fn parse_scope(&mut self) -> Result<Function, CompileError> {
        self.expect(TokenKind::KwScope, "expected 'scope'")?;
        let line = self.line();
        let name = self.expect_ident("scope: expected identifier")?;
        if name != "main" {
            return Err(CompileError::new(line, "only 'scope main' is supported"));
        }
        self.expect(TokenKind::KwRange, "expected 'range'")?;
        let _range = self.expect_ident("range: expected identifier")?;
        self.expect(TokenKind::Colon, "expected ':' after range name")?;
        let body = self.parse_stmts(&[TokenKind::KwEnd])?;
        self.eat(TokenKind::KwEnd);
        Ok(Function { name, line, body })
    }

    fn parse_stmts(&mut self, stops: &[TokenKind]) -> Result<Vec<Stmt>, CompileError> {
        let mut out = Vec::new();
        while !self.check(TokenKind::Eof) && !stops.iter().any(|k| self.check(*k)) {
            out.push(self.parse_stmt()?);
        }
        Ok(out)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        if self.eat(TokenKind::KwLet) {
            let decl = if self.eat(TokenKind::KwInt) {
                DeclType::Int
            } else if self.eat(TokenKind::KwArr) {
                DeclType::Arr
            } else {
                DeclType::Implicit
            };
            let name = self.expect_ident("let: expected name")?;
            self.expect(TokenKind::Equals, "expected '=' in let")?;
            let init = self.parse_expr()?;
            return Ok(Stmt::Let {
                name,
                decl,
                init,
                line,
            });
        }
        if self.eat(TokenKind::KwReturn) {
            let expr = self.parse_expr()?;
            return Ok(Stmt::Return { expr, line });
        }
        if self.eat(TokenKind::KwIf) {
            self.expect(TokenKind::LParen, "expected '(' after 'if'")?;
            let cond = self.parse_expr()?;
            self.expect(TokenKind::RParen, "expected ')' after condition")?;
            self.expect(TokenKind::Colon, "expected ':' after condition")?;
            let then_body = self.parse_stmts(&[TokenKind::KwElse, TokenKind::KwEnd])?;
            let else_body = if self.eat(TokenKind::KwElse) {
                self.expect(TokenKind::Colon, "expected ':' after 'else'")?;
                self.parse_stmts(&[TokenKind::KwEnd])?
            } else {
                Vec::new()
            };
            self.eat(TokenKind::KwEnd);
            return Ok(Stmt::If {
                cond,
                then_body,
                else_body,
                line,
            });
        }
        Err(CompileError::new(line, "unknown statement"))
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_primary()?;
        while self.eat(TokenKind::Plus) {
            let right = self.parse_primary()?;
            let line = left.line();
            left = Expr::Add {
                lhs: Box::new(left),
                rhs: Box::new(right),
                line,
            };
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        if self.check(TokenKind::Number) {
            let tok = self.advance();
            let value = parse_number(&tok.text).ok_or_else(|| {
                CompileError::new(tok.line, format!("invalid numeric literal '{}'", tok.text))
            })?;
            return Ok(Expr::Num {
                value,
                line: tok.line,
            });
        }
        if self.check(TokenKind::Ident) {
            let tok = self.advance();
            if self.eat(TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.check(TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(TokenKind::Comma) {
                            continue;
                        }
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "expected ')' after call arguments")?;
                return Ok(Expr::Call {
                    name: tok.text,
                    args,
                    line: tok.line,
                });
            }
            return Ok(Expr::Var {
                name: tok.text,
                line: tok.line,
            });
        }
        if self.eat(TokenKind::LParen) {
            let e = self.parse_expr()?;
            self.expect(TokenKind::RParen, "expected ')'")?;
            return Ok(e);
        }
        Err(CompileError::new(
            self.line(),
            "expected number, identifier, or '('",
        ))
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.tokens
            .get(self.idx)
            .map(|t| t.kind == kind)
            .unwrap_or(false)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, msg: &str) -> Result<(), CompileError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(CompileError::new(self.line(), msg))
        }
    }

    fn expect_ident(&mut self, msg: &str) -> Result<String, CompileError> {
        if self.check(TokenKind::Ident) {
            Ok(self.advance().text)
        } else {
            Err(CompileError::new(self.line(), msg))
        }
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.idx].clone();
        self.idx += 1;
        t
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.idx).map(|t| t.line).unwrap_or(1)
    }
}

fn parse_number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let digits: String = hex.chars().filter(|c| *c != '_').collect();
        u64::from_str_radix(&digits, 16).ok()
    } else {
        text.parse::<u64>().ok()
    }
}

// ---------------------------------------------------------------------------
// Locals, diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalType {
    Int,
    Arr,
}

impl LocalType {
    pub fn tag(self) -> &'static str {
        match self {
            LocalType::Int => "int",
            LocalType::Arr => "arr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    pub name: String,
    pub ty: LocalType,
    pub index: u16,
    pub line: u32,
    pub explicit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    locals: HashMap<String, Local>,
    next_index: u16,
}

impl SymbolTable {
    // returns (index, newly_declared); the first declaration wins
    pub fn declare(
        &mut self,
        name: &str,
        ty: LocalType,
        line: u32,
        explicit: bool,
    ) -> Result<(u16, bool), CompileError> {
        if let Some(local) = self.locals.get(name) {
            return Ok((local.index, false));
        }
        let index = self.next_index;
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or_else(|| CompileError::new(line, "too many locals"))?;
        self.locals.insert(
            name.to_string(),
            Local {
                name: name.to_string(),
                ty,
                index,
                line,
                explicit,
            },
        );
        Ok((index, true))
    }

    pub fn lookup(&self, name: &str) -> Option<&Local> {
        self.locals.get(name)
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn in_index_order(&self) -> Vec<&Local> {
        let mut out: Vec<&Local> = self.locals.values().collect();
        out.sort_by_key(|l| l.index);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub message: String,
    pub line: u32,
}

// ---------------------------------------------------------------------------
// Intrinsics and constant folding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Max,
    Min,
    EverExact,
    UtterlyInline,
    Cmp(CmpOp),
    ArrNew,
    ArrGet,
    ArrSet,
    ArrOf,
}

const INTRINSICS: &[(&str, Intrinsic)] = &[
    ("max", Intrinsic::Max),
    ("min", Intrinsic::Min),
    ("ever_exact", Intrinsic::EverExact),
    ("utterly_inline", Intrinsic::UtterlyInline),
    ("gt", Intrinsic::Cmp(CmpOp::Gt)),
    ("lt", Intrinsic::Cmp(CmpOp::Lt)),
    ("ge", Intrinsic::Cmp(CmpOp::Ge)),
    ("le", Intrinsic::Cmp(CmpOp::Le)),
    ("eq", Intrinsic::Cmp(CmpOp::Eq)),
    ("ne", Intrinsic::Cmp(CmpOp::Ne)),
    ("arr_new", Intrinsic::ArrNew),
    ("arr_get", Intrinsic::ArrGet),
    ("arr_set", Intrinsic::ArrSet),
    ("arr_of", Intrinsic::ArrOf),
];

pub fn intrinsic_of(name: &str) -> Option<Intrinsic> {
    INTRINSICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, intr)| *intr)
}

// folds in the VM's value domain (64-bit signed, wrapping add) so a folded
// expression and an executed one agree; variables and arrays never fold
pub fn fold_const(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Num { value, .. } => Some(*value as i64),
        Expr::Var { .. } => None,
        Expr::Add { lhs, rhs, .. } => {
            let a = fold_const(lhs)?;
            let b = fold_const(rhs)?;
            Some(a.wrapping_add(b))
        }
        Expr::Call { name, args, .. } => match intrinsic_of(name)? {
            Intrinsic::Max if args.len() == 2 => {
                let a = fold_const(&args[0])?;
                let b = fold_const(&args[1])?;
                Some(a.max(b))
            }
            Intrinsic::Min if args.len() == 2 => {
                let a = fold_const(&args[0])?;
                let b = fold_const(&args[1])?;
                Some(a.min(b))
            }
            Intrinsic::EverExact | Intrinsic::UtterlyInline if args.len() == 1 => {
                fold_const(&args[0])
            }
            Intrinsic::Cmp(op) if args.len() == 2 => {
                let a = fold_const(&args[0])?;
                let b = fold_const(&args[1])?;
                Some(if op.eval(a, b) { 1 } else { 0 })
            }
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// IR emitter
// ---------------------------------------------------------------------------

pub struct Emitter<'a> {
    instrs: Vec<Instr>,
    symbols: &'a mut SymbolTable,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl<'a> Emitter<'a> {
    pub fn new(symbols: &'a mut SymbolTable, diagnostics: &'a mut Vec<Diagnostic>) -> Self {
        Self {
            instrs: Vec::new(),
            symbols,
            diagnostics,
        }
    }

    pub fn lower_function(&mut self, func: &Function) -> Result<(), CompileError> {
        for stmt in &func.body {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    pub fn into_instrs(self) -> Vec<Instr> {
        self.instrs
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let {
                name,
                decl,
                init,
                line,
            } => {
                let ty = match decl {
                    DeclType::Int => LocalType::Int,
                    DeclType::Arr => LocalType::Arr,
                    DeclType::Implicit => infer_init_type(init),
                };
                let explicit = !matches!(decl, DeclType::Implicit);
                let (index, newly) = self.symbols.declare(name, ty, *line, explicit)?;
                if newly && !explicit {
                    self.diagnostics.push(Diagnostic {
                        code: "W001",
                        message: format!("implicit {} type inferred for '{}'", ty.tag(), name),
                        line: *line,
                    });
                }
                self.lower_expr(init)?;
                self.instrs.push(Instr::StoreLocal(index));
            }
            Stmt::Return { expr, .. } => {
                self.lower_expr(expr)?;
                self.instrs.push(Instr::Ret);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                self.lower_expr(cond)?;
                let jz_at = self.instrs.len();
                self.instrs.push(Instr::JzAbs(0));
                for s in then_body {
                    self.lower_stmt(s)?;
                }
                let jmp_at = self.instrs.len();
                self.instrs.push(Instr::JmpAbs(0));
                let else_start = self.instrs.len();
                self.instrs[jz_at] = Instr::JzAbs(else_start);
                for s in else_body {
                    self.lower_stmt(s)?;
                }
                let join = self.instrs.len();
                self.instrs[jmp_at] = Instr::JmpAbs(join);
            }
        }
        Ok(())
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Num { value, .. } => {
                self.instrs.push(Instr::PushImm64(*value));
            }
            Expr::Var { name, line } => {
                let local = self.symbols.lookup(name).ok_or_else(|| {
                    CompileError::new(*line, format!("use of undeclared '{}'", name))
                })?;
                self.instrs.push(Instr::LoadLocal(local.index));
            }
            Expr::Add { lhs, rhs, .. } => {
                if let Some(v) = fold_const(expr) {
                    self.instrs.push(Instr::PushImm64(v as u64));
                } else {
                    self.lower_expr(lhs)?;
                    self.lower_expr(rhs)?;
                    self.instrs.push(Instr::Add);
                }
            }
            Expr::Call { name, args, line } => {
                let Some(intr) = intrinsic_of(name) else {
                    return Err(CompileError::new(*line, format!("unknown call '{}'", name)));
                };
                self.lower_call(expr, intr, name, args, *line)?;
            }
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        call: &Expr,
        intr: Intrinsic,
        name: &str,
        args: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        match intr {
            Intrinsic::Max | Intrinsic::Min => {
                check_arity(args, 2, "max/min need 2 args", line)?;
                if let Some(v) = fold_const(call) {
                    self.fold_note(format!("fold:{}", name), line);
                    self.instrs.push(Instr::PushImm64(v as u64));
                } else {
                    self.lower_expr(&args[0])?;
                    self.lower_expr(&args[1])?;
                    self.instrs.push(if matches!(intr, Intrinsic::Max) {
                        Instr::Max
                    } else {
                        Instr::Min
                    });
                }
            }
            Intrinsic::EverExact => {
                check_arity(args, 1, "ever_exact needs 1 arg", line)?;
                if let Some(v) = fold_const(&args[0]) {
                    self.fold_note("fold:ever_exact".to_string(), line);
                    self.instrs.push(Instr::PushImm64(v as u64));
                } else {
                    self.lower_expr(&args[0])?;
                }
            }
            Intrinsic::UtterlyInline => {
                check_arity(args, 1, "utterly_inline needs 1 arg", line)?;
                self.fold_note("hint:inline".to_string(), line);
                self.lower_expr(&args[0])?;
            }
            Intrinsic::Cmp(op) => {
                check_arity(args, 2, "comparisons need 2 args", line)?;
                if let Some(v) = fold_const(call) {
                    self.instrs.push(Instr::PushImm64(v as u64));
                } else {
                    self.lower_expr(&args[0])?;
                    self.lower_expr(&args[1])?;
                    self.instrs.push(Instr::Cmp(op));
                }
            }
            Intrinsic::ArrNew => {
                check_arity(args, 1, "arr_new needs 1 arg", line)?;
                self.lower_expr(&args[0])?;
                self.instrs.push(Instr::ArrNew);
            }
            Intrinsic::ArrGet => {
                check_arity(args, 2, "arr_get needs 2 args", line)?;
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.instrs.push(Instr::ArrGet);
            }
            Intrinsic::ArrSet => {
                check_arity(args, 3, "arr_set needs 3 args", line)?;
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.lower_expr(&args[2])?;
                self.instrs.push(Instr::ArrSet);
            }
            Intrinsic::ArrOf => {
                self.instrs.push(Instr::PushImm64(args.len() as u64));
                self.instrs.push(Instr::ArrNew);
                for (i, element) in args.iter().enumerate() {
                    self.instrs.push(Instr::Dup);
                    self.instrs.push(Instr::PushImm64(i as u64));
                    self.lower_expr(element)?;
                    self.instrs.push(Instr::ArrSet);
                }
            }
        }
        Ok(())
    }

    fn fold_note(&mut self, message: String, line: u32) {
        self.diagnostics.push(Diagnostic {
            code: "W100",
            message,
            line,
        });
    }
}

fn check_arity(args: &[Expr], want: usize, msg: &str, line: u32) -> Result<(), CompileError> {
    if args.len() != want {
        return Err(CompileError::new(line, msg));
    }
    Ok(())
}

fn infer_init_type(init: &Expr) -> LocalType {
    if let Expr::Call { name, .. } = init {
        if matches!(
            intrinsic_of(name),
            Some(Intrinsic::ArrNew | Intrinsic::ArrSet | Intrinsic::ArrOf)
        ) {
            return LocalType::Arr;
        }
    }
    LocalType::Int
}

// ---------------------------------------------------------------------------
// Pipeline entry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Compilation {
    pub module: String,
    pub instrs: Vec<Instr>,
    pub code: Vec<u8>,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn compile_module(source: &str) -> Result<Compilation, CompileError> {
    let normalized = normalize_longform(source);
    let module = parse_module(&normalized)?;
    let mut symbols = SymbolTable::default();
    let mut diagnostics = Vec::new();
    let mut emitter = Emitter::new(&mut symbols, &mut diagnostics);
    emitter.lower_function(&module.main)?;
    let instrs = emitter.into_instrs();
    let code = parx_format::finalize(&instrs)
        .map_err(|e| CompileError::new(module.main.line, e.to_string()))?;
    Ok(Compilation {
        module: module.name,
        instrs,
        code,
        symbols,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parx_format::byte_offsets;

    #[test]
    fn normalizer_rewrites_longform_declarations() {
        let src = "declare explicit integer named total equals 0x20 plus 0x11 end";
        assert_eq!(normalize_longform(src), "let int total = 0x20 + 0x11\n");
    }

    #[test]
    fn normalizer_handles_implicit_declarations_and_comments() {
        let src = "declare implicit named y equals x plus 0x10 end ; trailing note\n";
        assert_eq!(normalize_longform(src), "let y = x + 0x10\n");
    }

    #[test]
    fn normalizer_preserves_line_count() {
        let src = "module Demo:\nscope main range app:\n; only a comment\nreturn 1\nend\n";
        let norm = normalize_longform(src);
        assert_eq!(norm.lines().count(), src.lines().count());
    }

    #[test]
    fn normalizer_is_idempotent_on_core_text() {
        let core = normalize_longform(
            "module Demo: scope main range app: declare implicit named y equals 1 end return y end",
        );
        assert_eq!(normalize_longform(&core), core);
    }

    #[test]
    fn normalizer_leaves_words_containing_keywords_alone() {
        let norm = normalize_longform("let append = legend + 1\n");
        assert_eq!(norm, "let append = legend + 1\n");
    }

    #[test]
    fn lexer_handles_hex_underscores_and_case() {
        let toks = lex("let X = 0xFF_a1 + 0X10");
        let kinds: Vec<TokenKind> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::KwLet,
                TokenKind::Ident,
                TokenKind::Equals,
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Eof,
            ]
        );
        assert_eq!(toks[1].text, "x");
        assert_eq!(toks[3].text, "0xFF_a1");
        assert_eq!(parse_number("0xFF_a1"), Some(0xffa1));
        assert_eq!(parse_number("0X10"), Some(16));
        assert_eq!(parse_number("42"), Some(42));
    }

    #[test]
    fn lexer_records_one_based_lines_and_drops_unknown_bytes() {
        let toks = lex("module demo:\nreturn @ 7");
        assert_eq!(toks[0].line, 1);
        let ret = toks.iter().find(|t| t.kind == TokenKind::KwReturn).unwrap();
        assert_eq!(ret.line, 2);
        // '@' vanished; the number after it survived
        assert!(toks
            .iter()
            .any(|t| t.kind == TokenKind::Number && t.text == "7"));
    }

    #[test]
    fn parser_builds_module_and_if_shape() {
        let m = parse_module(
            "module demo: scope main range app: let int x = 5 if (gt(x, 3)): return 1 else: return 0 end end",
        )
        .expect("parse");
        assert_eq!(m.name, "demo");
        assert_eq!(m.main.name, "main");
        assert_eq!(m.main.body.len(), 2);
        match &m.main.body[1] {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn parser_accepts_eof_as_block_terminator() {
        // post-normalization text never contains 'end'
        let m = parse_module("module demo: scope main range app: return 1").expect("parse");
        assert_eq!(m.main.body.len(), 1);
    }

    #[test]
    fn parser_requires_scope_main() {
        let err = parse_module("module demo: scope other range app: return 1 end").unwrap_err();
        assert!(err.message.contains("scope main"));
    }

    #[test]
    fn parser_rejects_missing_equals() {
        let err = parse_module("module demo: scope main range app: let x 5 end").unwrap_err();
        assert!(err.message.contains("'='"));
    }

    #[test]
    fn symbol_indices_are_dense_in_declaration_order() {
        let mut symbols = SymbolTable::default();
        let mut diags = Vec::new();
        let m = parse_module(
            "module demo: scope main range app: let a = 1 let b = 2 let a = 3 let c = 4 return c",
        )
        .expect("parse");
        let mut emitter = Emitter::new(&mut symbols, &mut diags);
        emitter.lower_function(&m.main).expect("lower");
        let locals = symbols.in_index_order();
        let names: Vec<&str> = locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(locals[0].index, 0);
        assert_eq!(locals[1].index, 1);
        assert_eq!(locals[2].index, 2);
        // the redeclaration of 'a' stays silent: one warning per local
        assert_eq!(diags.iter().filter(|d| d.code == "W001").count(), 3);
    }

    #[test]
    fn implicit_array_declaration_infers_arr_and_warns() {
        let c = compile_module("module demo: scope main range app: let a = arr_new(2) return 0 end")
            .expect("compile");
        let local = c.symbols.lookup("a").expect("local");
        assert_eq!(local.ty, LocalType::Arr);
        assert!(!local.explicit);
        let w = &c.diagnostics[0];
        assert_eq!(w.code, "W001");
        assert_eq!(w.message, "implicit arr type inferred for 'a'");
    }

    #[test]
    fn fold_const_covers_superlatives_and_comparisons() {
        let parse_ret = |src: &str| -> Expr {
            let m = parse_module(&format!("module d: scope main range r: return {}", src))
                .expect("parse");
            match &m.main.body[0] {
                Stmt::Return { expr, .. } => expr.clone(),
                other => panic!("expected return, got {:?}", other),
            }
        };
        assert_eq!(fold_const(&parse_ret("1 + 2 + 3")), Some(6));
        assert_eq!(fold_const(&parse_ret("max(0x20, 0x11)")), Some(0x20));
        assert_eq!(fold_const(&parse_ret("min(0x20, 0x11)")), Some(0x11));
        assert_eq!(fold_const(&parse_ret("ever_exact(7)")), Some(7));
        assert_eq!(fold_const(&parse_ret("utterly_inline(7 + 1)")), Some(8));
        assert_eq!(fold_const(&parse_ret("gt(4, 3)")), Some(1));
        assert_eq!(fold_const(&parse_ret("le(4, 3)")), Some(0));
        assert_eq!(fold_const(&parse_ret("eq(3, 3)")), Some(1));
        assert_eq!(fold_const(&parse_ret("ne(3, 3)")), Some(0));
        assert_eq!(fold_const(&parse_ret("x")), None);
        assert_eq!(fold_const(&parse_ret("max(x, 1)")), None);
        assert_eq!(fold_const(&parse_ret("arr_new(1)")), None);
        // wrong arity never folds; it is a lowering error instead
        assert_eq!(fold_const(&parse_ret("max(1, 2, 3)")), None);
    }

    #[test]
    fn folded_max_emits_single_push_and_w100() {
        let c = compile_module("module demo: scope main range app: return max(0x20, 0x11) end")
            .expect("compile");
        assert_eq!(c.instrs, vec![Instr::PushImm64(0x20), Instr::Ret]);
        assert_eq!(c.code.len(), 10);
        let folds: Vec<&Diagnostic> = c.diagnostics.iter().filter(|d| d.code == "W100").collect();
        assert_eq!(folds.len(), 1);
        assert_eq!(folds[0].message, "fold:max");
    }

    #[test]
    fn constant_add_folds_to_single_push_without_diagnostic() {
        let c = compile_module("module demo: scope main range app: return 0x20 + 0x11 end")
            .expect("compile");
        assert_eq!(c.instrs, vec![Instr::PushImm64(0x31), Instr::Ret]);
        assert!(c.diagnostics.is_empty());
    }

    #[test]
    fn utterly_inline_emits_argument_and_hint() {
        let c = compile_module(
            "module demo: scope main range app: let x = 1 return utterly_inline(x) end",
        )
        .expect("compile");
        assert!(c.instrs.contains(&Instr::LoadLocal(0)));
        assert!(c
            .diagnostics
            .iter()
            .any(|d| d.code == "W100" && d.message == "hint:inline"));
    }

    #[test]
    fn conditional_lowering_places_branch_targets() {
        let c = compile_module(
            "module demo: scope main range app: let int x = 5 if (gt(x, 3)): return 1 else: return 0 end end",
        )
        .expect("compile");
        let jz: Vec<(usize, usize)> = c
            .instrs
            .iter()
            .enumerate()
            .filter_map(|(i, ins)| match ins {
                Instr::JzAbs(t) => Some((i, *t)),
                _ => None,
            })
            .collect();
        let jmp: Vec<(usize, usize)> = c
            .instrs
            .iter()
            .enumerate()
            .filter_map(|(i, ins)| match ins {
                Instr::JmpAbs(t) => Some((i, *t)),
                _ => None,
            })
            .collect();
        assert_eq!(jz.len(), 1);
        assert_eq!(jmp.len(), 1);
        let (jmp_at, jmp_target) = jmp[0];
        let (jz_at, jz_target) = jz[0];
        // JZ lands immediately after the JMP, on the first else instruction
        assert_eq!(jz_target, jmp_at + 1);
        assert_eq!(jmp_target, c.instrs.len());
        // finalized JZ payload equals the byte offset of the else branch
        let offsets = byte_offsets(&c.instrs);
        let jz_byte_at = offsets[jz_at];
        let payload = u32::from_le_bytes([
            c.code[jz_byte_at + 1],
            c.code[jz_byte_at + 2],
            c.code[jz_byte_at + 3],
            c.code[jz_byte_at + 4],
        ]);
        assert_eq!(payload as usize, offsets[jz_target]);
    }

    #[test]
    fn empty_else_points_both_branches_at_join() {
        let c = compile_module(
            "module demo: scope main range app: let int x = 1 if (eq(x, 1)): let y = 2 end return x end",
        )
        .expect("compile");
        let mut jz_target = None;
        let mut jmp_target = None;
        for ins in &c.instrs {
            match ins {
                Instr::JzAbs(t) => jz_target = Some(*t),
                Instr::JmpAbs(t) => jmp_target = Some(*t),
                _ => {}
            }
        }
        assert_eq!(jz_target, jmp_target);
    }

    #[test]
    fn arr_of_expands_to_dup_set_chain() {
        let c = compile_module(
            "module demo: scope main range app: let arr a = arr_of(10, 20) return 0 end",
        )
        .expect("compile");
        let expected_prefix = vec![
            Instr::PushImm64(2),
            Instr::ArrNew,
            Instr::Dup,
            Instr::PushImm64(0),
            Instr::PushImm64(10),
            Instr::ArrSet,
            Instr::Dup,
            Instr::PushImm64(1),
            Instr::PushImm64(20),
            Instr::ArrSet,
            Instr::StoreLocal(0),
        ];
        assert_eq!(&c.instrs[..expected_prefix.len()], &expected_prefix[..]);
    }

    #[test]
    fn undeclared_name_is_fatal_at_emission() {
        let err = compile_module("module demo: scope main range app: return y end").unwrap_err();
        assert_eq!(err.message, "use of undeclared 'y'");
    }

    #[test]
    fn unknown_call_and_bad_arity_are_fatal() {
        let err = compile_module("module demo: scope main range app: return frobnicate(1) end")
            .unwrap_err();
        assert_eq!(err.message, "unknown call 'frobnicate'");
        let err =
            compile_module("module demo: scope main range app: return max(1) end").unwrap_err();
        assert_eq!(err.message, "max/min need 2 args");
        let err = compile_module("module demo: scope main range app: return arr_get(1) end")
            .unwrap_err();
        assert_eq!(err.message, "arr_get needs 2 args");
    }

    #[test]
    fn finalized_length_is_sum_of_encoded_sizes() {
        let c = compile_module(
            "module demo: scope main range app: let int x = 0x2a let y = x + 0x10 return y end",
        )
        .expect("compile");
        let total: usize = c.instrs.iter().map(|i| i.encoded_size()).sum();
        assert_eq!(c.code.len(), total);
    }
}
