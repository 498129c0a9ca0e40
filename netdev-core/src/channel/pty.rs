//! Line-oriented CLI channel over a [`DeviceChannel`].

use std::time::Duration;

use log::trace;
use regex::bytes::Regex;

use super::buffer::PatternBuffer;
use crate::error::{ChannelError, Result};
use crate::transport::DeviceChannel;

/// Interactive CLI channel: writes lines and reads until a pattern shows up
/// at the end of the output.
pub struct CliChannel {
    inner: Box<dyn DeviceChannel>,
    buffer: PatternBuffer,
}

impl CliChannel {
    pub fn new(inner: Box<dyn DeviceChannel>, search_depth: usize) -> Self {
        Self {
            inner,
            buffer: PatternBuffer::new(search_depth),
        }
    }

    /// Send a line terminated by `\n`, discarding anything left unread.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.buffer.clear();
        trace!("> {:?}", line);
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.inner.write(&data).await
    }

    /// Write raw bytes, keeping any buffered output.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await
    }

    /// Read until `pattern` matches the tail of the output.
    ///
    /// Paging markers matching `paging` are removed from the output and
    /// answered with a space so the device keeps printing. On timeout the
    /// bytes read so far stay available through [`take_pending`](Self::take_pending).
    pub async fn read_until(
        &mut self,
        pattern: &Regex,
        paging: Option<&Regex>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(paging) = paging {
                if self.buffer.remove_tail_match(paging) {
                    trace!("paging marker answered");
                    self.inner.write(b" ").await?;
                }
            }

            if self.buffer.tail_contains(pattern) {
                return Ok(self.buffer.take());
            }

            let chunk = tokio::time::timeout_at(deadline, self.inner.read())
                .await
                .map_err(|_| ChannelError::PatternTimeout(timeout))??;

            match chunk {
                Some(data) => {
                    trace!("< {} bytes", data.len());
                    self.buffer.extend(&data);
                }
                None => return Err(ChannelError::Closed.into()),
            }
        }
    }

    /// Output read since the last completed read (after a timeout).
    pub fn take_pending(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
