//! Output truncation that keeps JSON consumers working.

/// Preview size cap inside the truncation envelope.
const PREVIEW_CAP: usize = 200;

/// Bound `output` to roughly `max` bytes.
///
/// Valid JSON is wrapped in an envelope
/// `{"_truncated": true, "_preview": …, "_bytes": …}` whose preview is
/// about a third of the budget, so downstream template references still
/// see parseable JSON. Anything else is cut at a char boundary with a
/// trailing marker.
pub fn truncate_output(output: &str, max: usize) -> String {
    if max == 0 || output.len() <= max {
        return output.to_string();
    }

    if serde_json::from_str::<serde_json::Value>(output).is_ok() {
        let preview_len = (max / 3).min(PREVIEW_CAP);
        let preview = &output[..floor_char_boundary(output, preview_len)];
        return serde_json::json!({
            "_truncated": true,
            "_preview": preview,
            "_bytes": output.len(),
        })
        .to_string();
    }

    let cut = floor_char_boundary(output, max);
    format!("{}\n... (truncated)", &output[..cut])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("hello", 100), "hello");
        assert_eq!(truncate_output("hello", 0), "hello");
    }

    #[test]
    fn plain_text_gets_marker() {
        let long = "x".repeat(500);
        let out = truncate_output(&long, 100);
        assert!(out.starts_with(&"x".repeat(100)));
        assert!(out.ends_with("... (truncated)"));
    }

    #[test]
    fn json_gets_envelope() {
        let value = serde_json::json!({"key": "a".repeat(280)});
        let raw = value.to_string();
        assert!(raw.len() > 280);

        let out = truncate_output(&raw, 60);
        let envelope: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(envelope["_truncated"], true);
        assert_eq!(envelope["_bytes"].as_u64().unwrap() as usize, raw.len());
        assert!(envelope["_preview"].as_str().unwrap().len() <= 20);
        // The envelope itself stays within about twice the budget.
        assert!(out.len() <= 120, "envelope is {} bytes", out.len());
    }

    #[test]
    fn preview_capped_at_200() {
        let raw = serde_json::json!({"k": "b".repeat(10_000)}).to_string();
        let out = truncate_output(&raw, 6_000);
        let envelope: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(envelope["_preview"].as_str().unwrap().len(), 200);
    }

    #[test]
    fn multibyte_output_cut_on_char_boundary() {
        let long = "é".repeat(300);
        let out = truncate_output(&long, 101);
        assert!(out.ends_with("... (truncated)"));
        // Must not panic and must remain valid UTF-8 (é is 2 bytes).
        assert!(out.starts_with("é"));
    }
}
