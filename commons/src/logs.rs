//! Scoped progress logging.
//!
//! Long-running phases log a begin line up front and an end line (with
//! elapsed time) when the scope closes, so interleaved per-image progress
//! stays attributable to its phase.

use std::time::Instant;

use log::info;

/// A logging scope for one long-running phase.
pub struct Process {
    topic: String,
    started: Instant,
    failed: bool,
}

/// Open a logging scope for `topic`.
pub fn process(topic: impl Into<String>) -> Process {
    let topic = topic.into();
    info!("┌ {}", topic);
    Process {
        topic,
        started: Instant::now(),
        failed: false,
    }
}

impl Process {
    /// Mark the scope as failed; the closing line says so.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Run a fallible future inside this scope, recording its outcome.
    pub async fn run<T, F>(mut self, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let result = fut.await;
        if result.is_err() {
            self.fail();
        }
        result
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if self.failed {
            info!("└ {} failed after {:.1?}", self.topic, elapsed);
        } else {
            info!("└ {} ({:.1?})", self.topic, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_reports_the_result() {
        let ok: anyhow::Result<u32> = process("noop").run(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: anyhow::Result<()> = process("boom")
            .run(async { Err(anyhow::anyhow!("nope")) })
            .await;
        assert!(err.is_err());
    }
}
