use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use tree_sitter::{Language, Parser, Query, QueryCursor, StreamingIterator};

use crate::config::ChunkingConfig;

/// One retrieval unit cut out of a file. Lines are 1-based inclusive;
/// `symbol` is the declared name for structural chunks and empty for line
/// windows. `content` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub start_line: u32,
    pub end_line: u32,
    pub symbol: String,
    pub content: String,
}

/// Split a file into an ordered sequence of chunks.
///
/// Structural strategy first: a grammar-driven query extracts named
/// definitions, nested ones as their own chunks (a class yields one chunk
/// for the class and one per method; the overlap is tolerated). Any parse
/// or query failure, or a grammar that finds nothing, falls back to sliding
/// line windows.
pub fn chunk_file(
    path: &str,
    lang: &str,
    text: &str,
    windows: &ChunkingConfig,
) -> Vec<ChunkCandidate> {
    if let Some(driver) = driver_for_lang(lang) {
        match structural_chunks(driver, path, text) {
            Ok(chunks) if !chunks.is_empty() => return chunks,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("structural chunking failed for {path}: {e}");
            }
        }
    }
    line_window_chunks(text, windows)
}

// ── Structural strategy ─────────────────────────────────────────────────

/// A tree-sitter grammar plus the definition queries run against it. Every
/// query captures `@name` (the declared identifier) and `@def` (the whole
/// definition node).
struct GrammarDriver {
    lang_tags: &'static [&'static str],
    language: fn(path: &str) -> Language,
    definition_queries: &'static [&'static str],
}

fn ext_lower(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

static DRIVERS: OnceLock<Vec<GrammarDriver>> = OnceLock::new();

fn drivers() -> &'static [GrammarDriver] {
    DRIVERS.get_or_init(|| {
        let mut drivers = vec![
            GrammarDriver {
                lang_tags: &["rs"],
                language: |_| tree_sitter_rust::language(),
                definition_queries: &[
                    r#"(function_item name: (identifier) @name) @def"#,
                    r#"(struct_item name: (type_identifier) @name) @def"#,
                    r#"(enum_item name: (type_identifier) @name) @def"#,
                    r#"(trait_item name: (type_identifier) @name) @def"#,
                    r#"(mod_item name: (identifier) @name) @def"#,
                    r#"(type_item name: (type_identifier) @name) @def"#,
                ],
            },
            GrammarDriver {
                lang_tags: &["py"],
                language: |_| tree_sitter_python::language(),
                definition_queries: &[
                    r#"(function_definition name: (identifier) @name) @def"#,
                    r#"(class_definition name: (identifier) @name) @def"#,
                ],
            },
            GrammarDriver {
                lang_tags: &["ts", "js"],
                language: |path| {
                    // JS shares the TypeScript grammar; tsx/jsx need the JSX
                    // variant.
                    let ext = ext_lower(path);
                    if ext == "tsx" || ext == "jsx" {
                        tree_sitter_typescript::language_tsx()
                    } else {
                        tree_sitter_typescript::language_typescript()
                    }
                },
                definition_queries: &[
                    r#"(function_declaration name: (identifier) @name) @def"#,
                    r#"(class_declaration name: (type_identifier) @name) @def"#,
                    r#"(method_definition name: (property_identifier) @name) @def"#,
                    r#"(interface_declaration name: (type_identifier) @name) @def"#,
                    r#"(enum_declaration name: (identifier) @name) @def"#,
                    r#"(type_alias_declaration name: (type_identifier) @name) @def"#,
                    // Arrow functions bound to a name, exported or not; the
                    // whole declaration is the chunk so the binding survives.
                    r#"(lexical_declaration (variable_declarator name: (identifier) @name value: (arrow_function))) @def"#,
                ],
            },
        ];

        #[cfg(feature = "lang-go")]
        drivers.push(GrammarDriver {
            lang_tags: &["go"],
            language: |_| tree_sitter_go::language(),
            definition_queries: &[
                r#"(function_declaration name: (identifier) @name) @def"#,
                r#"(method_declaration name: (field_identifier) @name) @def"#,
                r#"(type_declaration (type_spec name: (type_identifier) @name)) @def"#,
            ],
        });

        #[cfg(feature = "lang-java")]
        drivers.push(GrammarDriver {
            lang_tags: &["java"],
            language: |_| tree_sitter_java::language(),
            definition_queries: &[
                r#"(class_declaration name: (identifier) @name) @def"#,
                r#"(interface_declaration name: (identifier) @name) @def"#,
                r#"(enum_declaration name: (identifier) @name) @def"#,
                r#"(method_declaration name: (identifier) @name) @def"#,
            ],
        });

        drivers
    })
}

fn driver_for_lang(lang: &str) -> Option<&'static GrammarDriver> {
    if lang.is_empty() {
        return None;
    }
    drivers().iter().find(|d| d.lang_tags.contains(&lang))
}

fn structural_chunks(
    driver: &GrammarDriver,
    path: &str,
    text: &str,
) -> Result<Vec<ChunkCandidate>, String> {
    let language = (driver.language)(path);
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| format!("set_language: {e}"))?;
    let tree = parser.parse(text, None).ok_or("parse returned no tree")?;
    let root = tree.root_node();
    let source = text.as_bytes();
    let lines: Vec<&str> = text.lines().collect();

    let mut out: Vec<ChunkCandidate> = Vec::new();
    let mut seen: HashSet<(u32, u32, String)> = HashSet::new();

    for query_src in driver.definition_queries {
        let query =
            Query::new(&language, query_src).map_err(|e| format!("query compile: {e}"))?;
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&query, root, source);
        while let Some(m) = matches.next() {
            let mut name: Option<String> = None;
            let mut def: Option<(u32, u32)> = None;

            for cap in m.captures {
                let cap_name = query.capture_names()[cap.index as usize];
                match cap_name {
                    "name" => {
                        name = std::str::from_utf8(&source[cap.node.start_byte()..cap.node.end_byte()])
                            .ok()
                            .map(|s| s.trim().to_string());
                    }
                    "def" => {
                        def = Some((
                            cap.node.start_position().row as u32 + 1,
                            cap.node.end_position().row as u32 + 1,
                        ));
                    }
                    _ => {}
                }
            }

            let (Some(symbol), Some((start_line, end_line))) = (name, def) else {
                continue;
            };
            if symbol.is_empty() || start_line > end_line {
                continue;
            }
            if !seen.insert((start_line, end_line, symbol.clone())) {
                continue;
            }

            let content = slice_lines(&lines, start_line, end_line);
            if content.is_empty() {
                continue;
            }
            out.push(ChunkCandidate {
                start_line,
                end_line,
                symbol,
                content,
            });
        }
    }

    // Ordered sequence: by position, outermost definition first on ties.
    out.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then(b.end_line.cmp(&a.end_line))
            .then(a.symbol.cmp(&b.symbol))
    });
    Ok(out)
}

fn slice_lines(lines: &[&str], start_line: u32, end_line: u32) -> String {
    let s = (start_line as usize).saturating_sub(1);
    let e = (end_line as usize).min(lines.len());
    if s >= e {
        return String::new();
    }
    lines[s..e].join("\n")
}

// ── Line-window fallback ────────────────────────────────────────────────

fn line_window_chunks(text: &str, windows: &ChunkingConfig) -> Vec<ChunkCandidate> {
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    if total == 0 {
        return vec![];
    }

    let window = windows.window_lines.max(1);
    let stride = windows.stride_lines.clamp(1, window);

    let mut out = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + window).min(total);
        let content = lines[start..end].join("\n");
        if !content.is_empty() {
            out.push(ChunkCandidate {
                start_line: start as u32 + 1,
                end_line: end as u32,
                symbol: String::new(),
                content,
            });
        }
        if end == total {
            break;
        }
        start += stride;
    }
    out
}
