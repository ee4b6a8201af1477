use crate::frontend::{Diagnostic, SymbolTable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDocument {
    pub module: String,
    pub functions: Vec<MetaFunction>,
    pub warnings: Vec<MetaWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFunction {
    pub name: String,
    pub locals: Vec<MetaLocal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLocal {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub index: u16,
    pub line: u32,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaWarning {
    pub code: String,
    pub line: u32,
    pub msg: String,
}

pub fn build_metadata(
    module: &str,
    symbols: &SymbolTable,
    diagnostics: &[Diagnostic],
) -> MetaDocument {
    let locals = symbols
        .in_index_order()
        .into_iter()
        .map(|local| MetaLocal {
            name: local.name.clone(),
            ty: local.ty.tag().to_string(),
            index: local.index,
            line: local.line,
            explicit: local.explicit,
        })
        .collect();
    let warnings = diagnostics
        .iter()
        .map(|d| MetaWarning {
            code: d.code.to_string(),
            line: d.line,
            msg: d.message.clone(),
        })
        .collect();
    MetaDocument {
        module: module.to_string(),
        functions: vec![MetaFunction {
            name: "main".to_string(),
            locals,
        }],
        warnings,
    }
}

pub fn metadata_json(doc: &MetaDocument) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(doc)
}
