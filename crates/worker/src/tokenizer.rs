//! Tokenizer boundary
//!
//! Tokenization is owned by the model collaborator and loaded once at
//! startup; the scheduler only needs prompt token counts.

use ringbatch_common::{RingBatchError, Result, TokenId};

/// Text to token conversion
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> Result<String>;
}

/// Byte-level tokenizer: one token per UTF-8 byte
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let bytes = tokens
            .iter()
            .map(|&token| {
                u8::try_from(token).map_err(|_| {
                    RingBatchError::invalid_request(format!(
                        "token {} is outside the byte vocabulary",
                        token
                    ))
                })
            })
            .collect::<Result<Vec<u8>>>()?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer() {
        let tokenizer = ByteTokenizer;
        let tokens = tokenizer.encode("this is a test").unwrap();

        assert_eq!(tokens.len(), 14);
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "this is a test");
    }

    #[test]
    fn test_decode_out_of_vocabulary() {
        assert!(ByteTokenizer.decode(&[104, 300]).is_err());
    }
}
