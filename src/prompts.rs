//! Instructions sent to the language model by the guessers.
//!
//! The reply formats requested here are what [`crate::guess`] parses: the
//! file name in quotes, the tags as a parenthesised comma-separated list.
//! Change both together.

/// Instruction template for guessing a file name. `{language}` is replaced
/// with [`crate::config::LlmConfig::language`].
pub const FILE_NAME_INSTRUCTIONS: &str = "Please guess the file name based on the text. \
Put the file name in single quotes. The file name should be good for sorting and begin \
with the document date as YYYY-MM-DD. Use hyphens instead of spaces. \
Write the file name in {language}.";

/// Instruction template for guessing document tags.
pub const TAG_INSTRUCTIONS: &str = "Please guess tags for this letter based on the text. \
Put the tags in a comma-separated list enclosed in parentheses. The tags are used to \
organise documents in Paperless. Provide them in {language}.";

pub fn file_name_instructions(language: &str) -> String {
    FILE_NAME_INSTRUCTIONS.replace("{language}", language)
}

pub fn tag_instructions(language: &str) -> String {
    TAG_INSTRUCTIONS.replace("{language}", language)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_is_substituted() {
        let s = file_name_instructions("German");
        assert!(s.contains("in German."));
        assert!(!s.contains("{language}"));
        assert!(tag_instructions("German").ends_with("Provide them in German."));
    }

    #[test]
    fn test_reply_formats_are_requested() {
        assert!(FILE_NAME_INSTRUCTIONS.contains("single quotes"));
        assert!(TAG_INSTRUCTIONS.contains("parentheses"));
    }
}
