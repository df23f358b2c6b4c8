// Lightweight path display wrapper that renders with forward slashes, so log
// lines and reports look the same on every platform.
pub(crate) struct DisplayPath<'a>(pub(crate) &'a std::path::Path);

impl<'a> std::fmt::Display for DisplayPath<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.to_string_lossy();
        f.write_str(&normalize_path(&s))
    }
}

pub(crate) fn display_path(p: &std::path::Path) -> DisplayPath<'_> {
    DisplayPath(p)
}

/// Backslashes become forward slashes and repeated slashes collapse.
/// Dot segments are left alone.
pub fn normalize_path(p: &str) -> String {
    let mut s = p.replace('\\', "/");
    while s.contains("//") {
        s = s.replace("//", "/");
    }
    s
}
