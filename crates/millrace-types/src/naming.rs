//! Output-file routing rule.
//!
//! The basename a script gives an output file decides which downstream
//! steps consume it: strip the final extension, then take the prefix
//! before the first `_`. This is the whole routing mechanism, kept as a
//! pure function so neither the filesystem layer nor the scheduler grows
//! opinions about it.

/// Derive the logical resource name from an output basename.
///
/// `downloaded_001.txt` → `downloaded`, `report.csv` → `report`,
/// `raw` → `raw`.
#[must_use]
pub fn logical_name(basename: &str) -> String {
    let stem = match basename.rfind('.') {
        Some(idx) => &basename[..idx],
        None => basename,
    };
    match stem.find('_') {
        Some(idx) => stem[..idx].to_string(),
        None => stem.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::logical_name;

    #[test]
    fn prefix_before_first_underscore() {
        assert_eq!(logical_name("foo_123.txt"), "foo");
    }

    #[test]
    fn plain_extension_stripped() {
        assert_eq!(logical_name("foo.txt"), "foo");
    }

    #[test]
    fn bare_name_unchanged() {
        assert_eq!(logical_name("foo"), "foo");
    }

    #[test]
    fn only_first_underscore_counts() {
        assert_eq!(logical_name("foo_bar_baz.x"), "foo");
    }

    #[test]
    fn underscore_without_extension() {
        assert_eq!(logical_name("chunk_07"), "chunk");
    }

    #[test]
    fn only_final_extension_is_stripped() {
        assert_eq!(logical_name("archive.tar.gz"), "archive.tar");
    }
}
