use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MAX_FILENAME_CHARS: usize = 255;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_invalid_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || (c as u32) < 0x20
}

/// Make a title or file name safe to use as a single path component on
/// common filesystems.
///
/// Invalid characters become `_`, leading/trailing dots and spaces are
/// stripped, Windows device names get a `_` prefix, and names longer than
/// 255 characters are shortened while keeping the extension.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_invalid_char(c) { '_' } else { c })
        .collect();
    let mut sanitized = replaced.trim_matches(|c| c == '.' || c == ' ').to_string();

    let stem_upper = sanitized
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem_upper.as_str()) {
        sanitized.insert(0, '_');
    }

    if sanitized.chars().count() > MAX_FILENAME_CHARS {
        let (stem, ext) = match sanitized.rfind('.') {
            Some(pos) if pos > 0 => sanitized.split_at(pos),
            _ => (sanitized.as_str(), ""),
        };
        let keep = MAX_FILENAME_CHARS.saturating_sub(ext.chars().count());
        sanitized = stem.chars().take(keep).chain(ext.chars()).collect();
    }

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return "unnamed".to_string();
    }
    sanitized
}

/// Local directory for a gallery: `output_dir` joined with the gallery's
/// relative (already sanitized) path.
pub fn gallery_dir(output_dir: &Path, relative_path: &Path) -> PathBuf {
    output_dir.join(relative_path)
}

/// Claims local paths for one gallery so no two photos share a file.
///
/// Names are compared case-insensitively, since `IMG_1.JPG` and `img_1.jpg`
/// are the same file on common desktop filesystems. A taken name gets the
/// photo id appended to its stem.
#[derive(Debug, Default)]
pub struct UniquePaths {
    taken: HashSet<String>,
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// `path` with `_<suffix>` inserted before the extension.
fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    };
    path.with_file_name(name)
}

impl UniquePaths {
    /// `path` itself if still free, else the first free `stem_<id>` variant.
    pub fn claim(&mut self, path: PathBuf, id: u64) -> PathBuf {
        if self.taken.insert(path_key(&path)) {
            return path;
        }
        let mut n = 0u32;
        loop {
            let suffix = if n == 0 { id.to_string() } else { format!("{id}_{n}") };
            let candidate = with_stem_suffix(&path, &suffix);
            if self.taken.insert(path_key(&candidate)) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Hidden files (dot-prefixed) are ignored when counting gallery contents.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_sanitize_strips_dots_and_spaces() {
        assert_eq!(sanitize_filename("  .hidden name. "), "hidden name");
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("com1.txt"), "_com1.txt");
        assert_eq!(sanitize_filename("CONSOLE.txt"), "CONSOLE.txt");
    }

    #[test]
    fn test_sanitize_empty_becomes_unnamed() {
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename(".."), "unnamed");
        assert_eq!(sanitize_filename(" . "), "unnamed");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let long = format!("{}.jpeg", "x".repeat(300));
        let out = sanitize_filename(&long);
        assert_eq!(out.chars().count(), 255);
        assert!(out.ends_with(".jpeg"));
    }

    #[test]
    fn test_sanitize_keeps_unicode() {
        assert_eq!(sanitize_filename("Café – été.jpg"), "Café – été.jpg");
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(Path::new("/tmp/.DS_Store")));
        assert!(!is_hidden(Path::new("/tmp/IMG_1.jpg")));
    }

    #[test]
    fn test_unique_paths_suffixes_duplicates() {
        let mut paths = UniquePaths::default();
        let dir = Path::new("/out/G");
        assert_eq!(paths.claim(dir.join("IMG_1.jpg"), 1), dir.join("IMG_1.jpg"));
        assert_eq!(paths.claim(dir.join("IMG_1.jpg"), 2), dir.join("IMG_1_2.jpg"));
        assert_eq!(paths.claim(dir.join("img_1.JPG"), 3), dir.join("img_1_3.JPG"));
        assert_eq!(paths.claim(dir.join("README"), 4), dir.join("README"));
        assert_eq!(paths.claim(dir.join("README"), 5), dir.join("README_5"));
    }

    #[test]
    fn test_unique_paths_avoids_real_names() {
        let mut paths = UniquePaths::default();
        let dir = Path::new("/out/G");
        paths.claim(dir.join("a.jpg"), 1);
        paths.claim(dir.join("a_7.jpg"), 2);
        assert_eq!(paths.claim(dir.join("a.jpg"), 7), dir.join("a_7_1.jpg"));
    }

    #[test]
    fn test_gallery_dir_joins() {
        let p = gallery_dir(Path::new("/out"), Path::new("Group/Gallery"));
        assert_eq!(p, PathBuf::from("/out/Group/Gallery"));
    }
}
