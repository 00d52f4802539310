use std::sync::LazyLock;

use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model};

static FALLBACK_ENCODING: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("embedded cl100k encoding"));

/// Count tokens for `text` with the model's native encoding, falling back to
/// a generic encoding for models tiktoken does not know.
pub fn count_tokens(text: &str, model: &str) -> usize {
    match get_bpe_from_model(model) {
        Ok(bpe) => bpe.encode_with_special_tokens(text).len(),
        Err(_) => FALLBACK_ENCODING.encode_with_special_tokens(text).len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_nonzero_for_text() {
        assert!(count_tokens("hello world", "gpt-4o") > 0);
    }

    #[test]
    fn unknown_model_falls_back() {
        let known = count_tokens("the same sentence", "gpt-4");
        let unknown = count_tokens("the same sentence", "totally-unknown-model");
        assert!(unknown > 0);
        // Both encodings tokenize plain ASCII similarly.
        assert!(known > 0);
    }

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(count_tokens("", "gpt-4o"), 0);
    }
}
