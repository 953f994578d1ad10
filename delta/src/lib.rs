//! Per-sandbox copy-on-write overlay over an immutable source tree.
//!
//! `<delta_dir>` mirrors `<source_dir>`: a present entry shadows its source
//! counterpart, and a sibling marker file named `.wh.<basename>` ("whiteout")
//! hides a same-named source entry from the merged view. Everything here is
//! a pure path/filesystem operation — no permission checks, no knowledge of
//! sandboxes or mounts.

mod store;

pub use store::ChangeKind;
pub use store::DeltaStore;
pub use store::DirEntry;
pub use store::EntryKind;
pub use store::Origin;
pub use store::Resolution;

const WHITEOUT_PREFIX: &str = ".wh.";

fn whiteout_name(basename: &str) -> String {
    format!("{WHITEOUT_PREFIX}{basename}")
}

fn strip_whiteout_prefix(name: &str) -> Option<&str> {
    name.strip_prefix(WHITEOUT_PREFIX)
}

/// Splits a sandbox-relative path (e.g. `/a/b`) into its path components,
/// ignoring a leading slash and any empty segments from doubled separators.
fn components(relpath: &str) -> Vec<&str> {
    relpath.split('/').filter(|s| !s.is_empty()).collect()
}

fn basename(relpath: &str) -> &str {
    components(relpath).last().copied().unwrap_or("")
}

fn parent_relpath(relpath: &str) -> String {
    let comps = components(relpath);
    if comps.is_empty() {
        return String::new();
    }
    comps[..comps.len() - 1].join("/")
}
