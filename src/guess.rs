//! File name and tag guessing on top of a [`Completion`] backend.
//!
//! Each guess retries a fixed number of times with a fixed delay. A reply
//! that cannot be parsed or fails validation counts as a failed attempt,
//! the same as a transport error.

use crate::archive::METADATA_PREFIX;
use crate::config::LlmConfig;
use crate::error::{LlmError, StageError};
use crate::llm::Completion;
use crate::prompts::{file_name_instructions, tag_instructions};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Longest accepted file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("valid regex"));
static PARENTHESISED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^)]+)\)").expect("valid regex"));

#[async_trait]
pub trait NameGuesser: Send + Sync {
    /// A file name ending in `.pdf`, derived from the document text.
    async fn guess_name(&self, text: &str) -> Result<String, StageError>;
}

#[async_trait]
pub trait TagGuesser: Send + Sync {
    /// At least one tag for the document text.
    async fn guess_tags(&self, text: &str) -> Result<Vec<String>, StageError>;
}

/// Retry budget shared by both guessers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    async fn run<T, F, Fut>(&self, what: &'static str, mut attempt: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, String>> + Send,
        T: Send,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();
        for n in 0..attempts {
            if n > 0 {
                tokio::time::sleep(self.delay).await;
            }
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(what, attempt = n + 1, of = attempts, error = %e, "Guess attempt failed");
                    last_error = e;
                }
            }
        }
        Err(StageError::GuessExhausted {
            what,
            attempts,
            last_error,
        })
    }
}

/// Cuts `text` to at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Extracts and validates a file name from a model reply.
///
/// Takes the first quoted string, strips `.txt`/`.csv`, appends `.pdf` when
/// missing, and rejects empty, overlong, whitespace-containing names, names
/// with path separators and names in the reserved metadata namespace. The
/// length limit applies to the final name.
pub fn parse_file_name(reply: &str) -> Result<String, String> {
    let name = QUOTED
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| "no quoted file name in reply".to_string())?;

    if name.is_empty() {
        return Err("file name is empty".into());
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("file name '{name}' contains whitespace"));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(format!("file name '{name}' is not a plain file name"));
    }
    if name.starts_with(METADATA_PREFIX) {
        return Err(format!("file name '{name}' uses the reserved '{METADATA_PREFIX}' prefix"));
    }

    let stem = name
        .strip_suffix(".txt")
        .or_else(|| name.strip_suffix(".csv"))
        .unwrap_or(name);
    if stem.is_empty() {
        return Err("file name is empty".into());
    }
    let name = if stem.ends_with(".pdf") {
        stem.to_string()
    } else {
        format!("{stem}.pdf")
    };
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(format!("file name is longer than {MAX_FILE_NAME_LEN} bytes"));
    }
    Ok(name)
}

/// Extracts tags from the first parenthesised list in a model reply.
pub fn parse_tags(reply: &str) -> Result<Vec<String>, String> {
    let list = PARENTHESISED
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| "no parenthesised tag list in reply".to_string())?;

    let tags: Vec<String> = list
        .split(',')
        .map(|tag| tag.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();
    if tags.is_empty() {
        return Err("tag list is empty".into());
    }
    Ok(tags)
}

/// Guesses file names with a language model.
pub struct LlmNameGuesser {
    completion: Arc<dyn Completion>,
    instructions: String,
    retry: RetryPolicy,
    max_input_chars: usize,
}

impl LlmNameGuesser {
    pub fn new(completion: Arc<dyn Completion>, config: &LlmConfig) -> Self {
        Self {
            completion,
            instructions: file_name_instructions(&config.language),
            retry: RetryPolicy::from_config(config),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl NameGuesser for LlmNameGuesser {
    async fn guess_name(&self, text: &str) -> Result<String, StageError> {
        let input = truncate_chars(text, self.max_input_chars);
        let completion = &self.completion;
        let instructions = self.instructions.as_str();
        self.retry
            .run("file name", || async move {
                let reply = completion
                    .complete(instructions, input)
                    .await
                    .map_err(|e: LlmError| e.to_string())?;
                parse_file_name(&reply)
            })
            .await
    }
}

/// Guesses document tags with a language model.
pub struct LlmTagGuesser {
    completion: Arc<dyn Completion>,
    instructions: String,
    retry: RetryPolicy,
    max_input_chars: usize,
}

impl LlmTagGuesser {
    pub fn new(completion: Arc<dyn Completion>, config: &LlmConfig) -> Self {
        Self {
            completion,
            instructions: tag_instructions(&config.language),
            retry: RetryPolicy::from_config(config),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl TagGuesser for LlmTagGuesser {
    async fn guess_tags(&self, text: &str) -> Result<Vec<String>, StageError> {
        let input = truncate_chars(text, self.max_input_chars);
        let completion = &self.completion;
        let instructions = self.instructions.as_str();
        self.retry
            .run("tags", || async move {
                let reply = completion
                    .complete(instructions, input)
                    .await
                    .map_err(|e: LlmError| e.to_string())?;
                parse_tags(&reply)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        seen_inputs: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(|e| LlmError::Http(e.into())))
                        .collect(),
                ),
                seen_inputs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Completion for Scripted {
        async fn complete(&self, _instructions: &str, input: &str) -> Result<String, LlmError> {
            self.seen_inputs.lock().unwrap().push(input.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Http("script exhausted".into())))
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_parse_file_name_variants() {
        assert_eq!(
            parse_file_name("Sure: '2024-03-01-Invoice-Acme.pdf'").unwrap(),
            "2024-03-01-Invoice-Acme.pdf"
        );
        assert_eq!(
            parse_file_name(r#"The name is "2024-03-01-Letter""#).unwrap(),
            "2024-03-01-Letter.pdf"
        );
        assert_eq!(parse_file_name("'notes.txt'").unwrap(), "notes.pdf");
        assert_eq!(parse_file_name("'table.csv'").unwrap(), "table.pdf");
    }

    #[test]
    fn test_parse_file_name_rejections() {
        assert!(parse_file_name("no quotes at all").is_err());
        assert!(parse_file_name("'has space.pdf'").is_err());
        assert!(parse_file_name("'../escape.pdf'").is_err());
        assert!(parse_file_name("'a/b.pdf'").is_err());
        assert!(parse_file_name("'.txt'").is_err());
        let long = format!("'{}'", "a".repeat(MAX_FILE_NAME_LEN + 1));
        assert!(parse_file_name(&long).is_err());
        assert!(parse_file_name("'.metadata.report.pdf'").is_err());
        assert!(parse_file_name("'.metadata.x'").is_err());
    }

    #[test]
    fn test_parse_file_name_limit_counts_the_extension() {
        let fits = format!("'{}'", "a".repeat(MAX_FILE_NAME_LEN - 4));
        assert_eq!(parse_file_name(&fits).unwrap().len(), MAX_FILE_NAME_LEN);

        let too_long = format!("'{}'", "a".repeat(MAX_FILE_NAME_LEN - 3));
        assert!(parse_file_name(&too_long).is_err());

        let already_pdf = format!("'{}.pdf'", "a".repeat(MAX_FILE_NAME_LEN - 4));
        assert_eq!(parse_file_name(&already_pdf).unwrap().len(), MAX_FILE_NAME_LEN);

        let txt = format!("'{}.txt'", "a".repeat(MAX_FILE_NAME_LEN - 3));
        assert!(parse_file_name(&txt).is_err());
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags("Tags: (Invoice, 'Acme', \"Tax\" , )").unwrap(),
            ["Invoice", "Acme", "Tax"]
        );
        assert!(parse_tags("Invoice, Acme").is_err());
        assert!(parse_tags("( , )").is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("äöü", 2), "äö");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_name_guesser_retries_until_valid() {
        let script = Scripted::new(vec![
            Err("timeout"),
            Ok("'has spaces in it'"),
            Ok("'2024-01-01-Receipt'"),
        ]);
        let guesser = LlmNameGuesser::new(script.clone(), &LlmConfig::default()).with_retry(fast());
        assert_eq!(
            guesser.guess_name("receipt text").await.unwrap(),
            "2024-01-01-Receipt.pdf"
        );
        assert_eq!(script.seen_inputs.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_name_guesser_exhausts_budget() {
        let script = Scripted::new(vec![
            Ok("nothing"),
            Ok("nothing"),
            Ok("nothing"),
            Ok("'late.pdf'"),
        ]);
        let guesser =
            LlmNameGuesser::new(script.clone(), &LlmConfig::default()).with_retry(fast());
        let err = guesser.guess_name("text").await.unwrap_err();
        assert!(matches!(err, StageError::GuessExhausted { attempts: 3, .. }));
        assert_eq!(script.seen_inputs.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_tag_guesser_truncates_input() {
        let script = Scripted::new(vec![Ok("(a, b)")]);
        let config = LlmConfig {
            max_input_chars: 4,
            ..LlmConfig::default()
        };
        let guesser = LlmTagGuesser::new(script.clone(), &config).with_retry(fast());
        assert_eq!(guesser.guess_tags("abcdefgh").await.unwrap(), ["a", "b"]);
        assert_eq!(script.seen_inputs.lock().unwrap()[0], "abcd");
    }
}
