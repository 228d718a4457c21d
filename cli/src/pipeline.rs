//! Pipeline that writes resolved blocks as JSON lines.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use chainingest_core::{Block, ForkStep, IngestError, Pipeline};

/// Lines held before they are written out without waiting for a drain.
const FLUSH_THRESHOLD: usize = 1_000;

#[derive(Serialize)]
struct Record<'a> {
    step: ForkStep,
    number: u64,
    id: &'a str,
    parent_id: &'a str,
    lib_num: u64,
    timestamp: String,
}

pub struct JsonLinesPipeline {
    out: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<Vec<String>>,
}

impl JsonLinesPipeline {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn flush_pending(&self) -> Result<usize, IngestError> {
        let lines: Vec<String> = self.pending.lock().unwrap().drain(..).collect();
        let mut out = self.out.lock().unwrap();
        for line in &lines {
            writeln!(out, "{line}").map_err(|e| IngestError::Pipeline(e.to_string()))?;
        }
        out.flush().map_err(|e| IngestError::Pipeline(e.to_string()))?;
        Ok(lines.len())
    }
}

#[async_trait]
impl Pipeline for JsonLinesPipeline {
    async fn bootstrap(&self, start_block_num: u64) -> Result<(), IngestError> {
        info!(start = start_block_num, "writing blocks to stdout");
        Ok(())
    }

    fn set_catch_up_mode(&self) {
        debug!("pipeline in catch-up mode");
    }

    fn set_live_mode(&self) {
        info!("pipeline switched to live mode");
    }

    async fn process_block(&self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        let record = Record {
            step,
            number: block.number,
            id: &block.id,
            parent_id: &block.parent_id,
            lib_num: block.lib_num,
            timestamp: block.timestamp.to_rfc3339(),
        };
        let line = serde_json::to_string(&record).map_err(|e| IngestError::Pipeline(e.to_string()))?;

        let full = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(line);
            pending.len() >= FLUSH_THRESHOLD
        };
        if full {
            self.flush_pending()?;
        }
        Ok(())
    }

    async fn wait_on_uploads(&self) -> Result<(), IngestError> {
        let written = self.flush_pending()?;
        debug!(lines = written, "output flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn block(n: u64) -> Arc<Block> {
        let raw = format!(
            r#"{{"number":{n},"id":"b{n}","parent_id":"b{}","parent_num":{},"lib_num":{},
                "timestamp":"2024-01-01T00:00:00Z","protocol":"evm"}}"#,
            n - 1,
            n - 1,
            n - 1
        );
        Arc::new(serde_json::from_str(&raw).unwrap())
    }

    #[tokio::test]
    async fn lines_are_written_on_drain() {
        let buf = SharedBuf::default();
        let pipeline = JsonLinesPipeline::new(Box::new(buf.clone()));
        pipeline.process_block(block(5), ForkStep::New).await.unwrap();
        pipeline.process_block(block(5), ForkStep::Irreversible).await.unwrap();
        assert!(buf.0.lock().unwrap().is_empty());

        pipeline.wait_on_uploads().await.unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["step"], "New");
        assert_eq!(first["id"], "b5");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["step"], "Irreversible");
    }
}
