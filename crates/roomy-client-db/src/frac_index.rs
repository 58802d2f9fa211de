//! Fractional index keys.
//!
//! Keys are digit strings over `0-9A-Za-z` (ASCII order, so plain
//! lexicographic comparison sorts them) naming fractions in `(0, 1)`.
//! [`key_between`] produces a key strictly between any two existing
//! keys without renumbering neighbors, which is what lets a `move`
//! event reposition one entity with a single-row update.
//!
//! Ulids are valid lower bounds: Crockford base32 is a subset of this
//! alphabet, so `pred.sort_idx ?? pred.id` plugs in directly.

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = ALPHABET.len();

fn digit_value(c: u8) -> usize {
    ALPHABET.iter().position(|&d| d == c).unwrap_or(0)
}

/// A key strictly between `lower` and `upper` (`None` = unbounded).
///
/// Callers must pass `lower < upper`; equal or inverted bounds are a
/// caller bug and get a best-effort key derived from `lower`.
pub fn key_between(lower: Option<&str>, upper: Option<&str>) -> String {
    let lower = lower.unwrap_or("");
    let upper = upper.unwrap_or("");
    if !upper.is_empty() && upper <= lower {
        // Degenerate bounds; extend lower rather than emit an unordered key
        return midpoint(lower.as_bytes(), b"");
    }
    midpoint(lower.as_bytes(), upper.as_bytes())
}

/// `a < result < b` where `b` empty means "infinity".
fn midpoint(a: &[u8], b: &[u8]) -> String {
    if !b.is_empty() {
        // Shared prefix stays; the midpoint happens after it. `a` is
        // padded with the zero digit while scanning, so a key never gets
        // a trailing zero digit (which nothing could sort before).
        let mut common = 0;
        while common < b.len()
            && a.get(common).copied().unwrap_or(ALPHABET[0]) == b[common]
        {
            common += 1;
        }
        if 0 < common {
            let mut out = String::from_utf8(b[..common].to_vec()).expect("Alphabet is ascii");
            let a_rest = if common < a.len() { &a[common..] } else { b"" };
            out.push_str(&midpoint(a_rest, &b[common..]));
            return out;
        }
    }

    let digit_a = a.first().map(|&c| digit_value(c)).unwrap_or(0);
    let digit_b = if b.is_empty() {
        BASE
    } else {
        digit_value(b[0])
    };

    if 1 < digit_b - digit_a {
        let mid = (digit_a + digit_b) / 2;
        return (ALPHABET[mid] as char).to_string();
    }

    // Consecutive leading digits
    if 1 < b.len() {
        // b's first digit alone already lands strictly between
        return (b[0] as char).to_string();
    }
    let mut out = (ALPHABET[digit_a] as char).to_string();
    out.push_str(&midpoint(if a.is_empty() { b"" } else { &a[1..] }, b""));
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn assert_between(lower: Option<&str>, upper: Option<&str>) -> String {
        let key = key_between(lower, upper);
        if let Some(lower) = lower {
            assert!(
                lower < key.as_str(),
                "expected {lower:?} < {key:?} (upper {upper:?})"
            );
        }
        if let Some(upper) = upper {
            assert!(
                key.as_str() < upper,
                "expected {key:?} < {upper:?} (lower {lower:?})"
            );
        }
        key
    }

    #[test]
    fn unbounded_midpoint() {
        assert_eq!(key_between(None, None), "V");
    }

    #[test]
    fn simple_bounds() {
        assert_between(Some("A"), Some("Z"));
        assert_between(Some("A"), None);
        assert_between(None, Some("A"));
        assert_between(Some("AA"), Some("AB"));
        assert_between(Some("A"), Some("AV"));
        assert_between(Some("Az"), Some("B"));
    }

    #[test]
    fn consecutive_digits() {
        assert_between(Some("A"), Some("B"));
        assert_between(Some("y"), Some("z"));
        assert_between(Some("0"), Some("1"));
    }

    #[test]
    fn prefix_bounds() {
        assert_between(Some("1"), Some("11"));
        assert_between(Some("V"), Some("V0V"));
    }

    #[test]
    fn ulid_lower_bounds() {
        let lower = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let key = assert_between(Some(lower), None);
        let key2 = assert_between(Some(lower), Some(&key));
        assert_between(Some(&key2), Some(&key));
    }

    #[test]
    fn deterministic() {
        assert_eq!(key_between(Some("G"), Some("Q")), key_between(Some("G"), Some("Q")));
    }

    #[test]
    fn dense_insertion_stays_ordered() {
        // Repeatedly bisect the same gap; every new key lands in order
        let mut lower = "A".to_owned();
        let upper = "B".to_owned();
        for _ in 0..100 {
            let key = assert_between(Some(&lower), Some(&upper));
            lower = key;
        }
        let mut upper = "B".to_owned();
        let lower = "A".to_owned();
        for _ in 0..100 {
            let key = assert_between(Some(&lower), Some(&upper));
            upper = key;
        }
    }

    #[test]
    fn append_chain_stays_short_enough() {
        // Appending at the end must not grow keys linearly
        let mut last = key_between(None, None);
        for _ in 0..200 {
            last = assert_between(Some(&last), None);
        }
        assert!(last.len() < 40, "append chain key grew to {}", last.len());
    }

    fn key_strategy() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            proptest::sample::select(ALPHABET.to_vec()),
            1..8,
        )
        .prop_map(|digits| String::from_utf8(digits).expect("ascii"))
    }

    proptest! {
        #[test]
        fn between_any_ordered_pair(a in key_strategy(), b in key_strategy()) {
            prop_assume!(a != b);
            let (lower, upper) = if a < b { (a, b) } else { (b, a) };
            // Generated keys never end in the zero digit; only such keys
            // ever become upper bounds.
            prop_assume!(!upper.ends_with('0'));
            let key = key_between(Some(&lower), Some(&upper));
            prop_assert!(lower.as_str() < key.as_str());
            prop_assert!(key.as_str() < upper.as_str());
        }

        #[test]
        fn above_any_key(a in key_strategy()) {
            let key = key_between(Some(&a), None);
            prop_assert!(a.as_str() < key.as_str());
        }

        #[test]
        fn below_any_key(a in key_strategy()) {
            prop_assume!(a.chars().any(|c| c != '0') && !a.ends_with('0'));
            let key = key_between(None, Some(&a));
            prop_assert!(key.as_str() < a.as_str());
        }
    }
}
