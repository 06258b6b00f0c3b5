use rand::{rngs::OsRng, Rng};

/// URL-safe symbols with the visually ambiguous `0 1 i l o` removed.
pub const ALPHABET: &[u8] = b"23456789abcdefghjkmnpqrstuvwxyz";

/// 26 symbols from a 31-symbol alphabet: ~128.8 bits of entropy.
pub const SHORT_ID_LEN: usize = 26;

/// How many fresh IDs the orchestrator mints before giving up on a create.
pub const MAX_ID_ATTEMPTS: u32 = 5;

/// Mint a new random short ID. Each symbol is drawn independently and
/// uniformly from the OS CSPRNG; nothing is derived from time or counters.
pub fn new_short_id() -> String {
    let mut rng = OsRng;
    (0..SHORT_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Cheap shape check so obviously bogus IDs never reach the store.
pub fn is_well_formed(id: &str) -> bool {
    id.len() == SHORT_ID_LEN && id.bytes().all(|b| ALPHABET.contains(&b))
}
