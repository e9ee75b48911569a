//! Readiness detection from sandbox output.
//!
//! A sandbox is ready once its output contains a marker line a configured
//! number of times. There is no active polling: the output stream is the
//! only signal.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, trace};

use crate::error::RuntimeError;
use crate::runtime::RuntimeResult;

/// What to wait for in a sandbox's output.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pattern: Regex,
    occurrences: usize,
    timeout: Duration,
}

impl ReadinessProbe {
    /// Creates a probe matching `pattern` once within `timeout`.
    pub fn new(pattern: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            occurrences: 1,
            timeout,
        })
    }

    /// Requires the marker to appear `occurrences` times.
    ///
    /// Postgres prints its ready line once for the init server and once for
    /// the real one, so the database probe waits for two.
    pub fn with_occurrences(mut self, occurrences: usize) -> Self {
        self.occurrences = occurrences.max(1);
        self
    }

    /// Returns the pattern source.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Returns the required number of occurrences.
    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    /// Returns the timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Consumes `output` until the marker has been seen often enough.
    ///
    /// Fails with [`RuntimeError::Timeout`] if the deadline passes first, or
    /// [`RuntimeError::StreamEnded`] if the sandbox stops writing (exits)
    /// before that.
    pub async fn wait(
        &self,
        container_id: &str,
        output: BoxStream<'_, RuntimeResult<String>>,
    ) -> RuntimeResult<()> {
        match tokio::time::timeout(self.timeout, self.scan(container_id, output)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::timeout(
                format!("readiness marker {:?} from {}", self.pattern(), container_id),
                self.timeout.as_secs(),
            )),
        }
    }

    async fn scan(
        &self,
        container_id: &str,
        mut output: BoxStream<'_, RuntimeResult<String>>,
    ) -> RuntimeResult<()> {
        let mut lines = LineBuffer::default();
        let mut seen = 0;

        while let Some(chunk) = output.next().await {
            for line in lines.push(&chunk?) {
                trace!(container = %container_id, line = %line, "Sandbox output");
                if self.pattern.is_match(&line) {
                    seen += 1;
                    debug!(
                        container = %container_id,
                        seen,
                        needed = self.occurrences,
                        "Readiness marker observed"
                    );
                    if seen >= self.occurrences {
                        return Ok(());
                    }
                }
            }
        }

        // A marker on the final, unterminated line still counts.
        if let Some(line) = lines.finish() {
            if self.pattern.is_match(&line) && seen + 1 >= self.occurrences {
                return Ok(());
            }
        }

        Err(RuntimeError::StreamEnded {
            container_id: container_id.to_string(),
            pattern: self.pattern().to_string(),
        })
    }
}

/// Reassembles arbitrary output chunks into whole lines.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        (!self.partial.is_empty()).then_some(self.partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(items: &[&str]) -> BoxStream<'static, RuntimeResult<String>> {
        let owned: Vec<RuntimeResult<String>> = items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(owned).boxed()
    }

    fn open_ended(items: &[&str]) -> BoxStream<'static, RuntimeResult<String>> {
        let owned: Vec<RuntimeResult<String>> = items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(owned).chain(stream::pending()).boxed()
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push("INFO: Server sta").is_empty());
        assert_eq!(
            buffer.push("rting on port 3000\r\nnext"),
            vec!["INFO: Server starting on port 3000"]
        );
        assert_eq!(buffer.finish(), Some("next".to_string()));
    }

    #[tokio::test]
    async fn test_marker_across_chunks() {
        let probe =
            ReadinessProbe::new("INFO: Server starting on port", Duration::from_secs(5)).unwrap();
        let output = open_ended(&["booting\nINFO: Server ", "starting on port 3000\n"]);
        probe.wait("svc", output).await.unwrap();
    }

    #[tokio::test]
    async fn test_occurrences_required() {
        let probe = ReadinessProbe::new(
            "database system is ready to accept connections",
            Duration::from_secs(5),
        )
        .unwrap()
        .with_occurrences(2);

        let once = chunks(&["LOG:  database system is ready to accept connections\n"]);
        let err = probe.wait("db", once).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StreamEnded { .. }));

        let twice = open_ended(&[
            "LOG:  database system is ready to accept connections\n",
            "LOG:  database system was shut down\n",
            "LOG:  database system is ready to accept connections\n",
        ]);
        probe.wait("db", twice).await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_last_line_counts() {
        let probe = ReadinessProbe::new("ready", Duration::from_secs(5)).unwrap();
        probe.wait("svc", chunks(&["ready"])).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_marker_never_appears() {
        let probe = ReadinessProbe::new("ready", Duration::from_secs(100)).unwrap();
        let err = probe
            .wait("svc", open_ended(&["still booting\n"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { secs: 100, .. }));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let probe = ReadinessProbe::new("ready", Duration::from_secs(5)).unwrap();
        let output = stream::iter(vec![Err(RuntimeError::api(404, "no such container"))]).boxed();
        let err = probe.wait("svc", output).await.unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn test_occurrences_at_least_one() {
        let probe = ReadinessProbe::new("x", Duration::from_secs(1))
            .unwrap()
            .with_occurrences(0);
        assert_eq!(probe.occurrences(), 1);
    }
}
