//! Stop markers and streaming detection.
//!
//! Engines do not always honour the stop list, and a marker can arrive split
//! over several fragments. The scanner holds back any tail that could still
//! grow into a marker and cuts the stream at the first complete one.

/// End-of-turn / end-of-text markers across the common tokenizer families.
pub const STOP_MARKERS: &[&str] = &[
    "</s>",
    "<|end|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|EOT|>",
    "<|END_OF_TURN_TOKEN|>",
    "<|end_of_turn|>",
    "<|endoftext|>",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    /// Text that is safe to show.
    pub emit: String,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct StopScanner {
    markers: Vec<String>,
    pending: String,
    matched: Option<String>,
}

impl StopScanner {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> Self {
        Self {
            markers: markers
                .iter()
                .map(|m| m.as_ref().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            pending: String::new(),
            matched: None,
        }
    }

    /// Feed one fragment. After a marker is seen every further call is a no-op.
    pub fn push(&mut self, fragment: &str) -> ScanStep {
        if self.matched.is_some() {
            return ScanStep {
                emit: String::new(),
                stopped: true,
            };
        }
        self.pending.push_str(fragment);

        let hit = self
            .markers
            .iter()
            .filter_map(|m| self.pending.find(m.as_str()).map(|idx| (idx, m)))
            .min_by_key(|(idx, _)| *idx)
            .map(|(idx, m)| (idx, m.clone()));

        if let Some((idx, marker)) = hit {
            let emit = self.pending[..idx].to_string();
            self.pending.clear();
            self.matched = Some(marker);
            return ScanStep {
                emit,
                stopped: true,
            };
        }

        let split = self.pending.len() - self.held_back_len();
        let emit: String = self.pending.drain(..split).collect();
        ScanStep {
            emit,
            stopped: false,
        }
    }

    /// Flush whatever was held back. Called once the engine is done.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// The marker that ended the stream, if any.
    pub fn matched(&self) -> Option<&str> {
        self.matched.as_deref()
    }

    /// Length of the longest suffix of `pending` that is a strict prefix of a marker.
    fn held_back_len(&self) -> usize {
        for (idx, _) in self.pending.char_indices() {
            let suffix = &self.pending[idx..];
            if self
                .markers
                .iter()
                .any(|m| m.len() > suffix.len() && m.starts_with(suffix))
            {
                return suffix.len();
            }
        }
        0
    }
}

impl Default for StopScanner {
    fn default() -> Self {
        Self::new(STOP_MARKERS)
    }
}
