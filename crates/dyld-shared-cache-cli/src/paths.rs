//! `.paths` scan-file reading.
//!
//! Grounded on `parsePathsFile` in `update_dyld_shared_cache.cpp`: one
//! install path per line, `#` starts a comment, blank lines are ignored,
//! trailing whitespace is trimmed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Skipped unconditionally, per the original tool's hard-coded
/// `rdar://problem/8305479` workaround for the IOKit dylib that was bound
/// against a different IOKit than found at runtime.
const SKIPPED_LEGACY_PATH: &str = "/System/Library/Frameworks/IOKit.framework/IOKit";

/// Parses one `.paths` file, returning the install paths it lists in order.
pub fn read_paths_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read paths file '{}'", path.display()))?;
    Ok(parse_paths(&text))
}

fn parse_paths(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == SKIPPED_LEGACY_PATH {
            continue;
        }
        out.push(line.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_blanks_and_the_legacy_path() {
        let text = "\
# a comment
/usr/lib/libSystem.B.dylib

/System/Library/Frameworks/IOKit.framework/IOKit
  /usr/lib/libobjc.A.dylib
";
        let paths = parse_paths(text);
        assert_eq!(paths, vec!["/usr/lib/libSystem.B.dylib", "/usr/lib/libobjc.A.dylib"]);
    }
}
