//! Metadata extractors: opaque `text -> { imports, symbols, docstrings }`
//! capabilities keyed by file extension. Kept deliberately shallow — this
//! core treats language-specific analysis as a pluggable, non-authoritative
//! enrichment, not a structural parser.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    pub imports: Vec<String>,
    pub symbols: Vec<String>,
    pub docstrings: Vec<String>,
}

pub type ExtractorFn = fn(&str) -> ExtractedMetadata;

fn extract_rust(text: &str) -> ExtractedMetadata {
    let mut imports = Vec::new();
    let mut symbols = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("use ") {
            imports.push(rest.trim_end_matches(';').to_string());
        } else if let Some(rest) = trimmed.strip_prefix("pub fn ").or_else(|| trimmed.strip_prefix("fn ")) {
            if let Some(name) = rest.split(['(', '<']).next() {
                symbols.push(name.trim().to_string());
            }
        } else if let Some(rest) = trimmed
            .strip_prefix("pub struct ")
            .or_else(|| trimmed.strip_prefix("struct "))
        {
            if let Some(name) = rest.split(['{', '(', '<']).next() {
                symbols.push(name.trim().to_string());
            }
        }
    }
    ExtractedMetadata {
        imports,
        symbols,
        docstrings: Vec::new(),
    }
}

fn extract_python(text: &str) -> ExtractedMetadata {
    let mut imports = Vec::new();
    let mut symbols = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            imports.push(trimmed.to_string());
        } else if let Some(rest) = trimmed.strip_prefix("def ") {
            if let Some(name) = rest.split('(').next() {
                symbols.push(name.trim().to_string());
            }
        } else if let Some(rest) = trimmed.strip_prefix("class ") {
            if let Some(name) = rest.split(['(', ':']).next() {
                symbols.push(name.trim().to_string());
            }
        }
    }
    ExtractedMetadata {
        imports,
        symbols,
        docstrings: Vec::new(),
    }
}

fn extract_javascript(text: &str) -> ExtractedMetadata {
    let mut imports = Vec::new();
    let mut symbols = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("import ") || trimmed.contains("require(") {
            imports.push(trimmed.to_string());
        } else if let Some(rest) = trimmed
            .strip_prefix("export function ")
            .or_else(|| trimmed.strip_prefix("function "))
        {
            if let Some(name) = rest.split('(').next() {
                symbols.push(name.trim().to_string());
            }
        }
    }
    ExtractedMetadata {
        imports,
        symbols,
        docstrings: Vec::new(),
    }
}

fn registry() -> &'static HashMap<&'static str, ExtractorFn> {
    static REGISTRY: OnceLock<HashMap<&'static str, ExtractorFn>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<&'static str, ExtractorFn> = HashMap::new();
        m.insert("rs", extract_rust as ExtractorFn);
        m.insert("py", extract_python as ExtractorFn);
        m.insert("js", extract_javascript as ExtractorFn);
        m.insert("ts", extract_javascript as ExtractorFn);
        m.insert("jsx", extract_javascript as ExtractorFn);
        m.insert("tsx", extract_javascript as ExtractorFn);
        m
    })
}

/// Extracts lightweight metadata for `relative_path` based on its extension,
/// or `None` when no extractor is registered for it — absence is never an
/// error, just a signal the chunk carries no enrichment.
pub fn extract(relative_path: &str, text: &str) -> Option<ExtractedMetadata> {
    let ext = std::path::Path::new(relative_path)
        .extension()
        .and_then(|e| e.to_str())?;
    let extractor = registry().get(ext)?;
    Some(extractor(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rust_functions_and_uses() {
        let text = "use std::fmt;\npub fn hello() {}\nstruct Thing { a: i32 }\n";
        let meta = extract("src/lib.rs", text).unwrap();
        assert_eq!(meta.imports, vec!["std::fmt".to_string()]);
        assert!(meta.symbols.contains(&"hello".to_string()));
        assert!(meta.symbols.contains(&"Thing".to_string()));
    }

    #[test]
    fn unregistered_extension_returns_none() {
        assert!(extract("data.csv", "a,b,c\n1,2,3").is_none());
    }
}
