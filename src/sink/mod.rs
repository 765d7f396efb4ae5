//! Graphite sink writer.
//!
//! One TCP connection per flush, never pooled. The whole delivery (dial,
//! write, close) runs under the flush deadline; a delivery that misses the
//! deadline is an error reported to the aggregator, which has already reset
//! its state for the next period.

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// Line-protocol writer for a Carbon-compatible receiver.
pub struct GraphiteSink {
    addr: String,
}

impl GraphiteSink {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }

    /// Delivers one flush payload, writing the entire buffer in one call.
    pub async fn deliver(&self, payload: &[u8], deadline: Instant) -> Result<()> {
        let delivery = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("dialing {}", self.addr))?;

            stream.write_all(payload).await.context("writing stats")?;
            stream
                .shutdown()
                .await
                .context("closing sink connection")?;

            Ok(())
        };

        match timeout_at(deadline, delivery).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("write deadline exceeded for {}", self.addr)),
        }
    }
}
