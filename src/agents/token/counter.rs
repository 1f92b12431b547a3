//! Token estimation

use crate::agents::llm::TokenUsage;

/// Approximate token counter used when the upstream reports no usage
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    /// Approximate chars per token
    chars_per_token: f32,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }

    /// Count tokens in text (approximate)
    pub fn count(&self, text: &str) -> u64 {
        (text.chars().count() as f32 / self.chars_per_token).ceil() as u64
    }

    /// Usage for one turn: the upstream's figures when reported, otherwise
    /// an estimate over the prompt and the produced text.
    pub fn usage_for(
        &self,
        reported: Option<TokenUsage>,
        prompt: &str,
        completion: &str,
    ) -> TokenUsage {
        match reported {
            Some(usage) if usage.total_tokens > 0 => usage,
            _ => TokenUsage::new(self.count(prompt), self.count(completion)),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_rounds_up() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcdefgh"), 2);
        assert_eq!(counter.count("abcdefghi"), 3);
    }

    #[test]
    fn test_count_uses_chars_not_bytes() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count("ééééé"), 2);
    }

    #[test]
    fn test_reported_usage_wins() {
        let counter = TokenCounter::new();
        let usage = counter.usage_for(Some(TokenUsage::new(10, 5)), "x", "y");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_estimate_when_not_reported() {
        let counter = TokenCounter::new();
        let usage = counter.usage_for(None, "abcdefgh", "ab");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 3);

        // Zero reported usage is treated as missing
        let usage = counter.usage_for(Some(TokenUsage::new(0, 0)), "abcd", "");
        assert_eq!(usage.total_tokens, 1);
    }
}
