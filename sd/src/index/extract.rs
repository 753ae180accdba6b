//! Regex-based symbol extraction
//!
//! Line-oriented heuristics for the languages agents touch most. Spans are
//! approximate (a symbol ends where the next one starts); kinds, names, and
//! nesting are what the store queries need to be accurate.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use memstore::{NewSymbol, NewSymbolRef};

/// Extracted definitions and references for one file
#[derive(Debug, Default)]
pub struct Extraction {
    pub symbols: Vec<NewSymbol>,
    pub refs: Vec<NewSymbolRef>,
}

static RUST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(pub(?:\([^)]*\))?\s+)?(fn|struct|enum|trait|mod|const|static|type)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

static RUST_IMPL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*impl(?:\s*<[^>]+>)?\s+(?:[A-Za-z_][A-Za-z0-9_:<>]*\s+for\s+)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

static RUST_RETURN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"->\s*([^{]+)").expect("valid regex"));

static PY_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));

static JS_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+([A-Za-z_$][\w$]*)").expect("valid regex")
});

static JS_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?class\s+([A-Za-z_$][\w$]*)").expect("valid regex"));

static JS_ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?\(").expect("valid regex")
});

/// Extract symbols from file content by extension
pub fn extract(path: &Path, content: &str) -> Extraction {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mut extraction = match ext {
        "rs" => extract_rust(content),
        "py" => extract_python(content),
        "js" | "ts" | "jsx" | "tsx" => extract_js(content),
        _ => Extraction::default(),
    };

    fixup_line_ends(&mut extraction.symbols, content.split('\n').count() as i64);
    collect_call_refs(path, content, &mut extraction);
    extraction
}

/// A symbol's span runs until the next top-level-or-sibling definition
fn fixup_line_ends(symbols: &mut [NewSymbol], last_line: i64) {
    let starts: Vec<i64> = symbols.iter().map(|s| s.line_start).collect();
    for (i, symbol) in symbols.iter_mut().enumerate() {
        let end = starts
            .iter()
            .skip(i + 1)
            .find(|s| **s > symbol.line_start)
            .map(|s| s - 1)
            .unwrap_or(last_line);
        symbol.line_end = end.max(symbol.line_start);
    }
}

/// Same-file call references to extracted functions and methods
fn collect_call_refs(path: &Path, content: &str, extraction: &mut Extraction) {
    let callables: Vec<(usize, &str, i64)> = extraction
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == "function" || s.kind == "method")
        .map(|(i, s)| (i, s.name.as_str(), s.line_start))
        .collect();

    let path_str = path.display().to_string();
    for (line_no, line) in content.split('\n').enumerate() {
        let line_no = line_no as i64 + 1;
        for (index, name, def_line) in &callables {
            if line_no == *def_line {
                continue;
            }
            if let Some(col) = line.find(&format!("{name}(")) {
                extraction.refs.push(NewSymbolRef {
                    symbol_index: *index,
                    file_path: path_str.clone(),
                    line: line_no,
                    column: col as i64,
                    snippet: Some(line.trim().to_string()),
                    kind: "call".to_string(),
                });
            }
        }
        if extraction.refs.len() >= 50 {
            break;
        }
    }
}

fn doc_comment(lines: &[&str], def_line: usize, marker: &str) -> Option<String> {
    let mut docs = Vec::new();
    for line in lines[..def_line].iter().rev() {
        let trimmed = line.trim();
        if let Some(text) = trimmed.strip_prefix(marker) {
            docs.push(text.trim().to_string());
        } else {
            break;
        }
    }
    if docs.is_empty() {
        None
    } else {
        docs.reverse();
        Some(docs.join("\n"))
    }
}

fn extract_rust(content: &str) -> Extraction {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut symbols: Vec<NewSymbol> = Vec::new();

    // (type name, symbol index if defined in this file, brace depth at entry)
    let mut current_impl: Option<(String, Option<usize>, i32)> = None;
    let mut depth = 0i32;

    for (i, line) in lines.iter().enumerate() {
        let line_no = i as i64 + 1;

        if current_impl.is_none()
            && let Some(caps) = RUST_IMPL.captures(line)
        {
            let name = caps[1].to_string();
            let parent_index = symbols
                .iter()
                .position(|s| s.name == name && (s.kind == "struct" || s.kind == "enum" || s.kind == "trait"));
            current_impl = Some((name, parent_index, depth));
        } else if let Some(caps) = RUST_ITEM.captures(line) {
            let visibility = caps.get(2).map(|m| m.as_str().trim().to_string());
            let keyword = &caps[3];
            let name = caps[4].to_string();

            let kind = match keyword {
                "fn" if current_impl.is_some() => "method",
                "fn" => "function",
                "struct" => "struct",
                "enum" => "enum",
                "trait" => "trait",
                "mod" => "module",
                "const" | "static" => "const",
                "type" => "type",
                _ => "other",
            };

            let (full_name, parent_index) = match (&current_impl, kind) {
                (Some((impl_name, parent, _)), "method") => (format!("{impl_name}::{name}"), *parent),
                _ => (name.clone(), None),
            };

            let is_static = kind == "method" && !line.contains("self");
            let return_type = RUST_RETURN
                .captures(line)
                .map(|c| c[1].trim().trim_end_matches(';').trim().to_string());

            symbols.push(NewSymbol {
                name,
                full_name,
                kind: kind.to_string(),
                line_start: line_no,
                line_end: line_no,
                column_start: (line.len() - line.trim_start().len()) as i64,
                signature: Some(line.trim().trim_end_matches('{').trim().to_string()),
                documentation: doc_comment(&lines, i, "///"),
                parent_index,
                visibility,
                is_static,
                return_type,
            });
        }

        depth += line.matches('{').count() as i32 - line.matches('}').count() as i32;
        if let Some((_, _, entry_depth)) = &current_impl
            && depth <= *entry_depth
        {
            current_impl = None;
        }
    }

    Extraction {
        symbols,
        refs: Vec::new(),
    }
}

fn extract_python(content: &str) -> Extraction {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut symbols: Vec<NewSymbol> = Vec::new();

    // (class name, symbol index, indent)
    let mut current_class: Option<(String, usize, usize)> = None;

    for (i, line) in lines.iter().enumerate() {
        let line_no = i as i64 + 1;
        let Some(caps) = PY_ITEM.captures(line) else {
            continue;
        };

        let indent = caps[1].len();
        let keyword = &caps[2];
        let name = caps[3].to_string();

        if let Some((_, _, class_indent)) = &current_class
            && indent <= *class_indent
        {
            current_class = None;
        }

        let (kind, full_name, parent_index) = match (keyword, &current_class) {
            ("class", _) => ("class", name.clone(), None),
            ("def", Some((class_name, class_index, _))) if indent > 0 => {
                ("method", format!("{class_name}.{name}"), Some(*class_index))
            }
            ("def", _) => ("function", name.clone(), None),
            _ => ("other", name.clone(), None),
        };

        let visibility = if name.starts_with('_') { "private" } else { "public" };

        symbols.push(NewSymbol {
            name: name.clone(),
            full_name,
            kind: kind.to_string(),
            line_start: line_no,
            line_end: line_no,
            column_start: indent as i64,
            signature: Some(line.trim().trim_end_matches(':').to_string()),
            documentation: None,
            parent_index,
            visibility: Some(visibility.to_string()),
            is_static: false,
            return_type: None,
        });

        if keyword == "class" {
            current_class = Some((name, symbols.len() - 1, indent));
        }
    }

    Extraction {
        symbols,
        refs: Vec::new(),
    }
}

fn extract_js(content: &str) -> Extraction {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut symbols: Vec<NewSymbol> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let line_no = i as i64 + 1;

        let (name, kind) = if let Some(caps) = JS_FUNCTION.captures(line) {
            (caps[1].to_string(), "function")
        } else if let Some(caps) = JS_CLASS.captures(line) {
            (caps[1].to_string(), "class")
        } else if let Some(caps) = JS_ARROW.captures(line) {
            (caps[1].to_string(), "function")
        } else {
            continue;
        };

        symbols.push(NewSymbol {
            name: name.clone(),
            full_name: name,
            kind: kind.to_string(),
            line_start: line_no,
            line_end: line_no,
            column_start: (line.len() - line.trim_start().len()) as i64,
            signature: Some(line.trim().trim_end_matches('{').trim().to_string()),
            documentation: None,
            parent_index: None,
            visibility: None,
            is_static: false,
            return_type: None,
        });
    }

    Extraction {
        symbols,
        refs: Vec::new(),
    }
}
