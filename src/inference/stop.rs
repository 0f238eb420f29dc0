//! Stop sequence detection over streamed fragments
//!
//! Generated text arrives a token at a time, so a stop sequence may be split
//! across several fragments. The filter withholds any trailing text that could
//! still grow into a stop sequence and releases it once it can't.

/// Two-state filter: armed until a stop sequence is seen, then stopped
#[derive(Debug, Clone, Default)]
pub struct StopMarkerFilter {
    stops: Vec<String>,
    /// Withheld text: the longest suffix that is a proper prefix of a stop
    pending: String,
    stopped: bool,
    matched: Option<usize>,
}

impl StopMarkerFilter {
    pub fn new<I, S>(stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stops: stops
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
            pending: String::new(),
            stopped: false,
            matched: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The stop sequence that ended the stream, if any
    pub fn matched(&self) -> Option<&str> {
        self.matched.map(|i| self.stops[i].as_str())
    }

    /// Text currently held back as a possible stop prefix
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Feeds one fragment. Returns the text that is safe to emit and whether
    /// a stop sequence has been reached.
    pub fn process(&mut self, fragment: &str) -> (String, bool) {
        if self.stopped {
            return (String::new(), true);
        }
        if self.stops.is_empty() {
            return (fragment.to_string(), false);
        }

        self.pending.push_str(fragment);

        if let Some((at, index)) = self.first_stop() {
            let emit = self.pending[..at].to_string();
            self.pending.clear();
            self.stopped = true;
            self.matched = Some(index);
            tracing::trace!(stop = %self.stops[index], "Stop sequence reached");
            return (emit, true);
        }

        let hold = self.partial_len();
        let emit = self.pending[..self.pending.len() - hold].to_string();
        self.pending.drain(..self.pending.len() - hold);
        (emit, false)
    }

    /// Releases withheld text at end of stream. Yields nothing once stopped.
    pub fn flush(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }

    /// Earliest stop occurrence; on equal positions the first configured wins.
    fn first_stop(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (index, stop) in self.stops.iter().enumerate() {
            if let Some(at) = self.pending.find(stop.as_str()) {
                if best.map_or(true, |(best_at, _)| at < best_at) {
                    best = Some((at, index));
                }
            }
        }
        best
    }

    /// Longest suffix of `pending` that is a non-empty proper prefix of any stop.
    fn partial_len(&self) -> usize {
        let text = self.pending.as_bytes();
        let mut longest = 0;
        for stop in &self.stops {
            let stop = stop.as_bytes();
            let max = (stop.len() - 1).min(text.len());
            for len in (longest + 1..=max).rev() {
                if text.ends_with(&stop[..len]) && self.pending.is_char_boundary(text.len() - len) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }
}
