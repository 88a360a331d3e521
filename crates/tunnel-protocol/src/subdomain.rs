//! TunnelId syntax and random-label minting.
//!
//! A `TunnelId` is the short DNS label that selects one tunnel from the
//! public side (`<TunnelId>.<baseDomain>`). Both a relay-minted label and
//! an externally-requested preferred label must satisfy [`is_valid`];
//! relay-minted labels additionally always come out of [`generate`].

/// Length bounds for a requested subdomain label (spec §3).
pub const MIN_LEN: usize = 3;
pub const MAX_LEN: usize = 63;

/// Length of a relay-minted label.
const GENERATED_LEN: usize = 8;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Validates a candidate subdomain label against spec §3's syntax:
/// length 3..=63, lowercase ASCII letters/digits/hyphen, must start and
/// end with a letter or digit.
pub fn is_valid(label: &str) -> bool {
    let len = label.len();
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return false;
    }
    if !label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return false;
    }
    let first = label.as_bytes()[0];
    let last = label.as_bytes()[len - 1];
    is_alnum(first) && is_alnum(last)
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Generates one candidate 8-character lowercase-alphanumeric label.
///
/// This does not check for collisions; callers loop, calling `generate`
/// until `taken` returns `false`, per spec §4.2 — a probabilistic bound
/// that is acceptable for an 8-character alphanumeric space.
pub fn generate(mut rand_u32: impl FnMut() -> u32) -> String {
    let mut out = String::with_capacity(GENERATED_LEN);
    for _ in 0..GENERATED_LEN {
        let idx = (rand_u32() as usize) % ALPHABET.len();
        out.push(ALPHABET[idx] as char);
    }
    out
}

/// Generates a fresh label using the OS RNG, retrying while `taken`
/// reports a collision.
pub fn generate_unused(mut taken: impl FnMut(&str) -> bool) -> String {
    loop {
        let candidate = generate(rand::random::<u32>);
        if !taken(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_min_and_max_length() {
        assert!(is_valid(&"a".repeat(MIN_LEN)));
        assert!(is_valid(&"a".repeat(MAX_LEN)));
    }

    #[test]
    fn rejects_one_below_and_above_bounds() {
        assert!(!is_valid(&"a".repeat(MIN_LEN - 1)));
        assert!(!is_valid(&"a".repeat(MAX_LEN + 1)));
    }

    #[test]
    fn rejects_leading_or_trailing_hyphen() {
        assert!(!is_valid("-abc"));
        assert!(!is_valid("abc-"));
    }

    #[test]
    fn accepts_interior_hyphen() {
        assert!(is_valid("my-app"));
    }

    #[test]
    fn rejects_uppercase() {
        assert!(!is_valid("MyApp1"));
    }

    #[test]
    fn rejects_other_characters() {
        assert!(!is_valid("my_app"));
        assert!(!is_valid("my.app"));
    }

    #[test]
    fn generated_labels_are_eight_lowercase_alphanumerics() {
        let mut counter = 0u32;
        let label = generate(|| {
            counter = counter.wrapping_add(7919);
            counter
        });
        assert_eq!(label.len(), GENERATED_LEN);
        assert!(label.bytes().all(|b| is_alnum(b)));
        assert!(is_valid(&label));
    }

    #[test]
    fn generate_unused_retries_on_collision() {
        let mut calls = 0;
        let label = generate_unused(|_candidate| {
            calls += 1;
            calls < 3
        });
        assert_eq!(calls, 3);
        assert!(is_valid(&label));
    }
}
