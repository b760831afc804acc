//! High-entropy substring heuristic (spec.md §4.H, opt-in). A plain
//! sliding-window Shannon-entropy scan: a single pass over the input,
//! O(1) work per character via an incremental histogram, so the whole
//! scan is O(n) regardless of how the input is shaped.

const WINDOW: usize = 32;
const ENTROPY_THRESHOLD_BITS: f64 = 4.0;

fn is_alphabet_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'_' | b'-')
}

fn shannon_entropy_bits(counts: &[u32; 256], window_len: f64) -> f64 {
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / window_len;
            -p * p.log2()
        })
        .sum()
}

/// True if any `WINDOW`-char run of contiguous "high-alphabet" characters
/// (alphanumeric plus base64/URL-safe punctuation) has Shannon entropy at
/// or above `ENTROPY_THRESHOLD_BITS`. Non-alphabet characters reset the
/// window, matching the "contiguous substring" framing.
pub fn has_high_entropy_run(text: &str) -> bool {
    let mut counts = [0u32; 256];
    let mut window: std::collections::VecDeque<u8> = std::collections::VecDeque::with_capacity(WINDOW);

    for &b in text.as_bytes() {
        if is_alphabet_char(b) {
            if window.len() == WINDOW {
                if let Some(old) = window.pop_front() {
                    counts[old as usize] -= 1;
                }
            }
            window.push_back(b);
            counts[b as usize] += 1;
            if window.len() == WINDOW && shannon_entropy_bits(&counts, WINDOW as f64) >= ENTROPY_THRESHOLD_BITS {
                return true;
            }
        } else {
            window.clear();
            counts = [0u32; 256];
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_a_random_looking_base64_blob() {
        let blob = "Kj3xQ9fZp2Lm8Rt5Yw1Vb7Nc4Gh6Ds0Ae";
        assert!(has_high_entropy_run(blob));
    }

    #[test]
    fn does_not_flag_low_entropy_repeated_text() {
        let text = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert!(!has_high_entropy_run(text));
    }

    #[test]
    fn does_not_flag_ordinary_prose() {
        let text = "the quick brown fox jumps over the lazy dog several times in a row";
        assert!(!has_high_entropy_run(text));
    }

    #[test]
    fn resets_window_across_punctuation_boundaries() {
        let text = "short. more short. even more short text here.";
        assert!(!has_high_entropy_run(text));
    }
}
