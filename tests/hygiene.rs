//! Hygiene: antipattern budgets over the production source tree.
//!
//! Each pattern has a budget (ideally zero). Adding an occurrence means
//! removing another first; budgets only shrink.

use std::fs;
use std::path::Path;

// Panics.
const MAX_UNWRAP: usize = 0;
const MAX_EXPECT: usize = 0;
const MAX_PANIC: usize = 0;
const MAX_UNREACHABLE: usize = 0;
const MAX_TODO: usize = 0;
const MAX_UNIMPLEMENTED: usize = 0;

// Silent loss.
const MAX_SILENT_DISCARD: usize = 0;
// engine: bad history rows are logged with inspect_err, then skipped.
const MAX_DOT_OK: usize = 1;

const MAX_ALLOW_DEAD_CODE: usize = 0;

struct SourceFile {
    path: String,
    content: String,
}

/// Production `.rs` files under `src/`, excluding `_test.rs` siblings.
fn source_files() -> Vec<SourceFile> {
    let mut files = Vec::new();
    collect_rs_files(Path::new("src"), &mut files);
    assert!(!files.is_empty(), "no sources found; run from the crate root");
    files
}

fn collect_rs_files(dir: &Path, out: &mut Vec<SourceFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, out);
            continue;
        }
        let path_str = path.to_string_lossy().to_string();
        if !path_str.ends_with(".rs") || path_str.ends_with("_test.rs") {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&path) {
            out.push(SourceFile { path: path_str, content });
        }
    }
}

fn assert_budget(pattern: &str, max: usize) {
    let hits: Vec<(String, usize)> = source_files()
        .into_iter()
        .filter_map(|file| {
            let count = file.content.lines().filter(|line| line.contains(pattern)).count();
            (count > 0).then_some((file.path, count))
        })
        .collect();
    let count: usize = hits.iter().map(|(_, c)| c).sum();
    let listing = hits.iter().map(|(path, c)| format!("  {path}: {c}")).collect::<Vec<_>>().join("\n");
    assert!(count <= max, "`{pattern}` budget exceeded: found {count}, max {max}.\n{listing}");
}

#[test]
fn panic_budgets() {
    assert_budget(".unwrap()", MAX_UNWRAP);
    assert_budget(".expect(", MAX_EXPECT);
    assert_budget("panic!(", MAX_PANIC);
    assert_budget("unreachable!(", MAX_UNREACHABLE);
    assert_budget("todo!(", MAX_TODO);
    assert_budget("unimplemented!(", MAX_UNIMPLEMENTED);
}

#[test]
fn silent_discard_budget() {
    assert_budget("let _ =", MAX_SILENT_DISCARD);
}

#[test]
fn dot_ok_budget() {
    assert_budget(".ok()", MAX_DOT_OK);
}

#[test]
fn allow_dead_code_budget() {
    assert_budget("#[allow(dead_code)]", MAX_ALLOW_DEAD_CODE);
}
