use parashade::frontend::compile_module;
use parashade::meta::build_metadata;
use parashade::parx_format::{read_parx, write_parx, ParxSymbol, VERSION};
use parashade::parx_vm::run;

fn check_golden(source: &str, expected: &[u8]) {
    let c = compile_module(source).expect("compile");
    if c.code != expected {
        panic!("{}", format_diff(expected, &c.code));
    }
}

fn format_diff(expected: &[u8], got: &[u8]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "golden mismatch: expected {} bytes, got {} bytes\n",
        expected.len(),
        got.len()
    ));
    let n = expected.len().min(got.len());
    let mut mismatches = 0usize;
    for i in 0..n {
        if expected[i] != got[i] {
            out.push_str(&format!(
                "  @{:04x}: expected {:02x}, got {:02x}\n",
                i, expected[i], got[i]
            ));
            mismatches += 1;
            if mismatches >= 32 {
                out.push_str("  ... more mismatches omitted\n");
                break;
            }
        }
    }
    if expected.len() != got.len() {
        let tail = if expected.len() > got.len() {
            &expected[n..]
        } else {
            &got[n..]
        };
        let shown = tail
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>();
        out.push_str(&format!("  tail at {:04x}: {}\n", n, shown.join(" ")));
    }
    out
}

#[test]
fn golden_hex_addition() {
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x01, 0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 42
        0x10, 0x00, 0x00,                                     // STORE_LOCAL 0
        0x11, 0x00, 0x00,                                     // LOAD_LOCAL 0
        0x01, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 16
        0x02,                                                 // ADD
        0x10, 0x01, 0x00,                                     // STORE_LOCAL 1
        0x11, 0x01, 0x00,                                     // LOAD_LOCAL 1
        0x21,                                                 // RET
    ];
    check_golden(
        "module Demo: scope main range app: let int x = 0x2A let y = x + 0x10 return y end",
        expected,
    );
}

#[test]
fn golden_folded_max() {
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 32
        0x21,                                                 // RET
    ];
    check_golden(
        "module Demo: scope main range app: return max(0x20, 0x11) end",
        expected,
    );
}

#[test]
fn golden_conditional_branch() {
    #[rustfmt::skip]
    let expected: &[u8] = &[
        0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 5
        0x10, 0x00, 0x00,                                     // STORE_LOCAL 0
        0x11, 0x00, 0x00,                                     // LOAD_LOCAL 0
        0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 3
        0x32,                                                 // CMP_GT
        0x70, 0x2d, 0x00, 0x00, 0x00,                         // JZ_ABS -> else @45
        0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 1
        0x21,                                                 // RET
        0x71, 0x37, 0x00, 0x00, 0x00,                         // JMP_ABS -> join @55
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // PUSH_IMM64 0
        0x21,                                                 // RET
    ];
    check_golden(
        "module Demo: scope main range app: let int x = 5 if (gt(x, 3)): return 1 else: return 0 end end",
        expected,
    );
}

#[test]
fn end_to_end_scenarios_interpret_as_specified() {
    let cases: &[(&str, i64)] = &[
        (
            "module Demo: scope main range app: let int x = 0x2A let y = x + 0x10 return y end",
            58,
        ),
        (
            "module Demo: scope main range app: return max(0x20, 0x11) end",
            32,
        ),
        (
            "module Demo: scope main range app: let int x = 5 if (gt(x, 3)): return 1 else: return 0 end end",
            1,
        ),
        (
            "module Demo: scope main range app: let arr a = arr_of(10, 20, 30) return arr_get(a, 1) end",
            20,
        ),
        (
            "module Demo: scope main range app: let arr a = arr_new(2) return arr_get(a, 5) end",
            0,
        ),
        (
            "module Demo: scope main range app: declare explicit integer named total equals 0x20 plus 0x11 end return total end",
            49,
        ),
    ];
    for (source, expected) in cases {
        let c = compile_module(source).expect("compile");
        let got = run(&c.code, c.symbols.len()).expect("run");
        assert_eq!(got, *expected, "source: {source}");
    }
}

#[test]
fn metadata_for_hex_addition_scenario() {
    let c = compile_module(
        "module Demo: scope main range app: let int x = 0x2A let y = x + 0x10 return y end",
    )
    .expect("compile");
    let doc = build_metadata(&c.module, &c.symbols, &c.diagnostics);
    let locals = &doc.functions[0].locals;
    assert_eq!(
        locals
            .iter()
            .map(|l| (l.name.as_str(), l.ty.as_str(), l.index, l.explicit))
            .collect::<Vec<_>>(),
        vec![("x", "int", 0, true), ("y", "int", 1, false)]
    );
    assert_eq!(doc.warnings.len(), 1);
    assert_eq!(doc.warnings[0].code, "W001");
}

#[test]
fn parx_container_carries_the_finalized_code() {
    let c = compile_module(
        "module Demo: scope main range app: let int x = 1 return x end",
    )
    .expect("compile");
    let symbols: Vec<ParxSymbol> = c
        .symbols
        .in_index_order()
        .into_iter()
        .map(|l| ParxSymbol {
            name: l.name.clone(),
            is_array: l.ty.tag() == "arr",
            index: l.index,
            line: l.line,
            explicit: l.explicit,
        })
        .collect();
    let ranges = vec!["app".to_string()];
    let bytes = write_parx(&c.code, &[], &symbols, &ranges).expect("write");
    assert_eq!(&bytes[0..4], b"PARX");
    let module = read_parx(&bytes).expect("read");
    assert_eq!(module.version, VERSION);
    assert_eq!(module.code, c.code);
    assert_eq!(module.symbols.len(), 1);
    assert_eq!(module.symbols[0].name, "x");
}
