/// Largest tool output handed back to the model.
pub const MAX_OUTPUT_CHARS: usize = 50_000;

/// Cut `output` to `max_chars` characters, appending a marker with the original length.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let head: String = output.chars().take(max_chars).collect();
    format!("{head}\n\n[Output truncated: {total} total characters]")
}

/// Element refs are written `e12` or `@e12`; keep the bare form.
pub fn normalize_ref(r: &str) -> &str {
    r.trim().trim_start_matches('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("abc", 10), "abc");
        assert_eq!(truncate_output("", 0), "");
    }

    #[test]
    fn long_output_marked() {
        let s = "x".repeat(12);
        assert_eq!(
            truncate_output(&s, 5),
            "xxxxx\n\n[Output truncated: 12 total characters]"
        );
    }

    #[test]
    fn counts_characters_not_bytes() {
        let s = "é".repeat(4);
        assert_eq!(truncate_output(&s, 4), s);
        assert!(truncate_output(&s, 2).starts_with("éé\n"));
    }

    #[test]
    fn refs_are_normalized() {
        assert_eq!(normalize_ref("@e1"), "e1");
        assert_eq!(normalize_ref(" e2 "), "e2");
    }
}
