use std::io::{self, BufRead, Write};

use pipecat_broker::adapter::Broker;
use pipecat_core::{BrokerError, OutboundMessage, QueueRef};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish a message: {0}")]
    Broker(#[from] BrokerError),
    #[error("failed to echo published line: {0}")]
    Status(#[source] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub lines_published: u64,
    pub bytes_published: u64,
    /// Set when input reading stopped on an error rather than end-of-stream.
    pub read_error: Option<String>,
}

/// Strips one trailing `\n` or `\r\n`.
fn trim_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

fn echo_line(status: &mut dyn Write, line: &[u8]) -> io::Result<()> {
    status.write_all(line)?;
    status.write_all(b"\n")?;
    status.flush()
}

/// Publishes every input line to `queue`, echoing each once it is accepted.
///
/// Lines go out one at a time in input order. A publish failure aborts the
/// run; an input read failure is reported on `diagnostics` and ends it
/// normally.
pub fn run_publisher<B, R>(
    broker: &mut B,
    queue: &QueueRef,
    content_type: &str,
    mut input: R,
    status: &mut dyn Write,
    diagnostics: &mut dyn Write,
) -> Result<PublishStats, PublishError>
where
    B: Broker,
    R: BufRead,
{
    let mut stats = PublishStats::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        match input.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("input read failed after {} lines: {err}", stats.lines_published);
                let _ = writeln!(diagnostics, "Reading standard input: {err}");
                stats.read_error = Some(err.to_string());
                break;
            }
        }
        trim_line_ending(&mut line);

        let message =
            OutboundMessage::text_line(queue, line.clone()).with_content_type(content_type);
        broker.publish(&message)?;
        stats.lines_published += 1;
        stats.bytes_published += line.len() as u64;

        echo_line(status, &line).map_err(PublishError::Status)?;
    }
    debug!(
        "publisher finished: lines={}, bytes={}",
        stats.lines_published, stats.bytes_published
    );
    Ok(stats)
}
