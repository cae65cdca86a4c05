/// Shannon entropy of `s` in bits per byte.
///
/// Pattern rules carry an entropy floor to separate generated credentials
/// (typically > 3.5) from placeholders like `changeme` or `XXXX`.
#[must_use]
pub fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for byte in s.bytes() {
        freq[byte as usize] += 1;
    }

    let len = s.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = f64::from(count) / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::shannon_entropy;

    #[test]
    fn empty_and_uniform_strings_have_zero_entropy() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaaaaaa"), 0.0);
    }

    #[test]
    fn two_symbol_alternation_is_one_bit() {
        let entropy = shannon_entropy("abababab");
        assert!((entropy - 1.0).abs() < 0.001);
    }

    #[test]
    fn generated_tokens_clear_typical_rule_floors() {
        assert!(shannon_entropy("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY") > 4.0);
        assert!(shannon_entropy("I6gHcCmvAbCdEf01XyZ9") > 3.5);
    }

    #[test]
    fn placeholders_stay_below_typical_floors() {
        assert!(shannon_entropy("ghp_XXXXXXXXXXXXXXXXXXXXXXXXXXXX") < 2.5);
    }
}
