//! Bridge from the `log` facade to connected viewers.

use flexi_logger::writers::LogWriter;
use flexi_logger::DeferredNow;
use log::{LevelFilter, Record};

use crate::broadcast::Broadcaster;

/// Forwards the message of every record at or above `max_level` to the broadcaster.
pub struct BroadcastLogWriter {
    broadcaster: Broadcaster,
    max_level: LevelFilter,
}

impl BroadcastLogWriter {
    pub fn new(broadcaster: Broadcaster, max_level: LevelFilter) -> Self {
        Self {
            broadcaster,
            max_level,
        }
    }
}

impl LogWriter for BroadcastLogWriter {
    fn write(&self, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
        if record.level() <= self.max_level {
            self.broadcaster.publish_log(record.args().to_string());
        }
        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn max_log_level(&self) -> LevelFilter {
        self.max_level
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;
    use crate::broadcast::StreamEvent;

    fn write(writer: &BroadcastLogWriter, level: Level, message: &str) {
        writer
            .write(
                &mut DeferredNow::new(),
                &Record::builder()
                    .level(level)
                    .args(format_args!("{message}"))
                    .build(),
            )
            .unwrap();
    }

    #[test]
    fn forwards_messages_at_or_above_level() {
        let broadcaster = Broadcaster::new();
        let mut subscription = broadcaster.attach();
        let writer = BroadcastLogWriter::new(broadcaster, LevelFilter::Info);

        write(&writer, Level::Debug, "hidden");
        write(&writer, Level::Info, "3 items remaining");
        write(&writer, Level::Error, "failed");

        let lines: Vec<String> = std::iter::from_fn(|| subscription.try_recv())
            .map(|event| match event {
                StreamEvent::Log(line) => line.to_string(),
                StreamEvent::Artifact(_) => panic!("unexpected artifact"),
            })
            .collect();
        assert_eq!(lines, ["3 items remaining", "failed"]);
    }
}
