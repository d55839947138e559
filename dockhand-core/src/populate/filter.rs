//! Install output filtering.
//!
//! Pure presentation layer over helper container output. Dependency
//! managers print a lot of noise (progress spinners, tree dumps, funding
//! banners); this filter forwards only the lines that tell the user what
//! is actually happening and never influences install semantics.

/// Prefixes and fragments that are always suppressed.
const NOISE_FRAGMENTS: &[&str] = &[
    "npm warn",
    "npm notice",
    "npm fund",
    "packages are looking for funding",
    "run `npm fund`",
    "deprecated",
    "<-",
    "progress:",
    "fetching packages",
    "[1/4]",
    "[2/4]",
    "[3/4]",
    "[4/4]",
    "info no lockfile found",
    "info visit",
    "done in",
    "lockfile is up to date",
    "already up to date",
];

/// Fragments that mark genuinely useful progress lines.
const PROGRESS_FRAGMENTS: &[&str] = &[
    "added ",
    "removed ",
    "changed ",
    "up to date in",
    "installing",
    "building",
    "rebuilt",
    "node-gyp",
    "packages installed",
    "error",
    "err!",
];

/// Stateful line filter for dependency-manager output.
#[derive(Debug, Default)]
pub struct InstallLineFilter {
    /// Suppress the rest of a multi-line npm tree dump.
    in_tree_dump: bool,
}

impl InstallLineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a raw output line reaches the progress callback.
    /// Returns the line to forward, trimmed, or None to suppress it.
    pub fn filter(&mut self, raw: &str) -> Option<String> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        // npm prints dependency trees starting with box-drawing characters.
        if line.starts_with('├') || line.starts_with('└') || line.starts_with('│') {
            self.in_tree_dump = true;
            return None;
        }
        if self.in_tree_dump {
            if line.starts_with('─') || line.starts_with('+') {
                return None;
            }
            self.in_tree_dump = false;
        }

        let lower = line.to_lowercase();

        // Errors always pass, even when a noise fragment also matches.
        if lower.contains("error") || lower.contains("err!") {
            return Some(line.to_string());
        }
        if NOISE_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
            return None;
        }
        if PROGRESS_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
            return Some(line.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lines_pass() {
        let mut filter = InstallLineFilter::new();
        assert_eq!(
            filter.filter("added 312 packages in 12s"),
            Some("added 312 packages in 12s".to_string())
        );
        assert_eq!(
            filter.filter("  building fresh packages..."),
            Some("building fresh packages...".to_string())
        );
        assert_eq!(filter.filter("node-gyp rebuild"), Some("node-gyp rebuild".to_string()));
    }

    #[test]
    fn test_noise_is_suppressed() {
        let mut filter = InstallLineFilter::new();
        assert_eq!(filter.filter("npm warn old lockfile"), None);
        assert_eq!(filter.filter("npm notice New minor version of npm available"), None);
        assert_eq!(filter.filter("42 packages are looking for funding"), None);
        assert_eq!(filter.filter("[2/4] Fetching packages..."), None);
        assert_eq!(filter.filter(""), None);
        assert_eq!(filter.filter("   "), None);
    }

    #[test]
    fn test_tree_dump_is_suppressed() {
        let mut filter = InstallLineFilter::new();
        assert_eq!(filter.filter("├── express@4.19.2"), None);
        assert_eq!(filter.filter("│   └── body-parser@1.20.2"), None);
        assert_eq!(filter.filter("└── sqlite3@5.1.7"), None);
        // Filter recovers once the dump ends.
        assert_eq!(
            filter.filter("added 12 packages in 3s"),
            Some("added 12 packages in 3s".to_string())
        );
    }

    #[test]
    fn test_errors_always_pass() {
        let mut filter = InstallLineFilter::new();
        assert_eq!(
            filter.filter("npm ERR! code EACCES"),
            Some("npm ERR! code EACCES".to_string())
        );
        // Even when an error line contains a noise fragment.
        assert_eq!(
            filter.filter("npm warn deprecated ... error in peer"),
            Some("npm warn deprecated ... error in peer".to_string())
        );
    }
}
