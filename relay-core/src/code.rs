use rand::Rng;

use crate::error::{CoreError, CoreResult};

/// Canonical word list shipped with the binary. Exactly 256 entries; both
/// endpoints must carry an identical copy for codes to parse everywhere.
const WORDLIST_RAW: &str = include_str!("../wordlist.txt");

/// A human-speakable transfer code of the form `7-guitar-palace`.
///
/// The code identifies the pending session on the rendezvous server and
/// doubles as the key-exchange password, so it is never sent anywhere in
/// the clear except inside the WebSocket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCode {
    pub digit: u8,
    pub word1: String,
    pub word2: String,
}

impl TransferCode {
    /// Generate a fresh random code.
    pub fn generate() -> Self {
        let words = words();
        let mut rng = rand::thread_rng();
        Self {
            digit: rng.gen_range(0..10),
            word1: words[rng.gen_range(0..words.len())].to_string(),
            word2: words[rng.gen_range(0..words.len())].to_string(),
        }
    }

    /// Parse and validate a code string like `7-guitar-palace`.
    pub fn parse(code: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = code.trim().splitn(3, '-').collect();
        if parts.len() != 3 {
            return Err(CoreError::InvalidCode(
                "expected format: digit-word-word".into(),
            ));
        }

        let digit: u8 = parts[0]
            .parse()
            .map_err(|_| CoreError::InvalidCode("first part must be a digit 0-9".into()))?;
        if digit > 9 {
            return Err(CoreError::InvalidCode("digit must be 0-9".into()));
        }

        let words = words();
        let word1 = parts[1].to_lowercase();
        let word2 = parts[2].to_lowercase();
        for w in [&word1, &word2] {
            if !words.contains(&w.as_str()) {
                return Err(CoreError::InvalidCode(format!("unknown word: '{w}'")));
            }
        }

        Ok(Self { digit, word1, word2 })
    }
}

impl std::fmt::Display for TransferCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.digit, self.word1, self.word2)
    }
}

fn words() -> Vec<&'static str> {
    WORDLIST_RAW
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}
