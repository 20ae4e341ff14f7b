//! The `tags` metadata key and its cleaning policy.

/// Metadata key under which the tag stage stores comma-separated tags.
pub const TAGS_KEY: &str = "tags";

/// Joins tags into the metadata value format.
pub fn join_tags<S: AsRef<str>>(tags: &[S]) -> String {
    tags.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalises a comma-separated tag value: trims, lowercases, sorts,
/// deduplicates and drops empty tags.
///
/// ```rust
/// use scanflow::tags::clean_tags;
///
/// assert_eq!(clean_tags(" Invoice, acme ,,ACME"), ["acme", "invoice"]);
/// ```
pub fn clean_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = raw
        .split(',')
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_list() {
        assert_eq!(clean_tags("a,b,c"), ["a", "b", "c"]);
    }

    #[test]
    fn test_whitespace_case_duplicates_and_empties() {
        assert_eq!(clean_tags("  C , a,B,,b ,  ,A"), ["a", "b", "c"]);
    }

    #[test]
    fn test_empty_value() {
        assert!(clean_tags("").is_empty());
        assert!(clean_tags(" , ,").is_empty());
    }

    #[test]
    fn test_join() {
        assert_eq!(join_tags(&["x", "y"]), "x,y");
        assert_eq!(join_tags::<String>(&[]), "");
    }
}
