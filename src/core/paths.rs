//! Path helpers for result folders.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Resolve a result folder to an absolute, normalized path.
///
/// Existing folders are canonicalized; folders that do not exist yet (a
/// plan's root before its first test) are normalized syntactically against
/// the current directory.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

/// Path of `path` relative to `root` when it lies inside it, for links in
/// generated index pages. Paths outside `root` are returned unchanged.
pub fn relative_within(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
}

/// Whether `tag` can name a child folder of a collection: exactly one
/// normal path component.
pub fn is_valid_tag(tag: &str) -> bool {
    let mut components = Path::new(tag).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn normalizes_missing_result_folder() {
        let input = Path::new("/nonexistent-mtb/results/../plots/rtt-10");
        assert!(std::fs::canonicalize(input).is_err());
        assert_eq!(
            resolve_absolute_path(input),
            PathBuf::from("/nonexistent-mtb/plots/rtt-10")
        );
    }

    #[test]
    fn relative_within_strips_root() {
        let root = Path::new("/results/run");
        assert_eq!(
            relative_within(root, Path::new("/results/run/rtt-10/test")),
            PathBuf::from("rtt-10/test")
        );
        assert_eq!(
            relative_within(root, Path::new("/elsewhere/test")),
            PathBuf::from("/elsewhere/test")
        );
    }

    #[test]
    fn tags_must_be_single_components() {
        assert!(is_valid_tag("rtt-10"));
        assert!(is_valid_tag("sched-pie"));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag("a/b"));
        assert!(!is_valid_tag(".."));
        assert!(!is_valid_tag("/abs"));
    }
}
