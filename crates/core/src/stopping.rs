//! Stop-string detection over a rolling window of generated text.
//!
//! The model tends to close reports with boilerplate (terminator lines,
//! disclaimers) in unpredictable casing and punctuation, so matching runs in
//! two passes: literal substring search, then a normalized search over the
//! lowercased alphanumeric projection of the window.

const WINDOW_BYTES: usize = 128;

/// Literal fragments that end generation the moment they appear.
const STOP_STRINGS: &[&str] = &[
    "<end_of_turn>",
    "<eos>",
    "---END OF REPORT---",
    "--- END OF REPORT ---",
    "End of Report",
    "end of report",
    // markers the model emits right before trailing disclaimers
    "Generated by KintaMed",
    "Disclaimer:",
    "DISCLAIMER:",
    "Note: This AI",
    "Note: This report",
    "NOTE: This",
    "*This report is",
    "This is not medical advice",
    "Confidentiality Notice",
];

/// Matched against the window with case, spacing and punctuation stripped.
const NORMALIZED_STOPS: &[&str] = &["endofreport", "generatedbykintamed"];

/// Rolling matcher fed every emitted fragment.
#[derive(Debug, Default)]
pub struct StopMatcher {
    buffer: String,
}

impl StopMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded fragment and report whether generation should stop.
    pub fn observe(&mut self, fragment: &str) -> bool {
        self.buffer.push_str(fragment);
        self.trim_window();

        if STOP_STRINGS.iter().any(|stop| self.buffer.contains(stop)) {
            tracing::info!("stop string matched in output window");
            return true;
        }

        let normalized: String = self
            .buffer
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if NORMALIZED_STOPS
            .iter()
            .any(|stop| normalized.contains(stop))
        {
            tracing::info!("normalized stop string matched in output window");
            return true;
        }
        false
    }

    fn trim_window(&mut self) {
        if self.buffer.len() <= WINDOW_BYTES * 2 {
            return;
        }
        let mut cut = self.buffer.len() - WINDOW_BYTES;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_does_not_stop() {
        let mut matcher = StopMatcher::new();
        assert!(!matcher.observe("The cardiac silhouette is "));
        assert!(!matcher.observe("within normal limits."));
    }

    #[test]
    fn literal_stop_split_across_fragments() {
        let mut matcher = StopMatcher::new();
        assert!(!matcher.observe("...findings above. End of"));
        assert!(matcher.observe(" Report"));
    }

    #[test]
    fn control_token_text_stops() {
        let mut matcher = StopMatcher::new();
        assert!(matcher.observe("<end_of_turn>"));
    }

    #[test]
    fn normalized_match_survives_punctuation_and_case() {
        let mut matcher = StopMatcher::new();
        assert!(matcher.observe("— E N D ... of ... R-e-p-o-r-t —"));

        let mut matcher = StopMatcher::new();
        assert!(matcher.observe("generated BY kinta_med"));
    }

    #[test]
    fn disclaimer_preamble_stops() {
        let mut matcher = StopMatcher::new();
        assert!(matcher.observe("Disclaimer: this output"));
    }

    #[test]
    fn window_stays_bounded_and_forgets_old_text() {
        let mut matcher = StopMatcher::new();
        assert!(!matcher.observe("End of"));
        // push enough unrelated text that the dangling prefix scrolls away
        for _ in 0..64 {
            assert!(!matcher.observe("abcdefgh"));
        }
        assert!(!matcher.observe(" Report"));
        assert!(matcher.buffer.len() <= WINDOW_BYTES * 2 + 8);
    }

    #[test]
    fn trimming_respects_utf8_boundaries() {
        let mut matcher = StopMatcher::new();
        for _ in 0..200 {
            assert!(!matcher.observe("é"));
        }
        assert!(matcher.buffer.is_char_boundary(0));
    }
}
