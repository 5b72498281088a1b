//! Console observer: prints relay events and feeds the traffic log.

use std::io::Write;

use chrono::Local;
use tapwire_core::{RelayEvent, Side};

use crate::error::Result;
use crate::hexdump;
use crate::traffic_log::TrafficLog;

/// Renders [`RelayEvent`]s to a writer.
pub struct Console<W: Write> {
    out: W,
    traffic: Option<TrafficLog>,
    show_trace: bool,
}

impl<W: Write> Console<W> {
    /// Creates a console that prints every notification.
    pub fn new(out: W) -> Self {
        Self {
            out,
            traffic: None,
            show_trace: true,
        }
    }

    /// Also records data chunks to a traffic log.
    pub fn with_traffic_log(mut self, log: TrafficLog) -> Self {
        self.traffic = Some(log);
        self
    }

    /// Hides informational notifications.
    pub fn quiet(mut self) -> Self {
        self.show_trace = false;
        self
    }

    /// Prints one event.
    pub fn handle(&mut self, event: &RelayEvent) -> Result<()> {
        match event {
            RelayEvent::LocalData(data) => self.data(Side::Local, data)?,
            RelayEvent::RemoteData(data) => self.data(Side::Remote, data)?,
            RelayEvent::LocalConnected(c) => self.state(Side::Local, *c)?,
            RelayEvent::RemoteConnected(c) => self.state(Side::Remote, *c)?,
            RelayEvent::Notification(n) => {
                if self.show_trace || n.is_error() {
                    writeln!(self.out, "{}", n)?;
                }
            }
        }
        Ok(())
    }

    /// Records written to the traffic log, if one is open.
    pub fn traffic_records(&self) -> Option<u64> {
        self.traffic.as_ref().map(TrafficLog::records)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn data(&mut self, side: Side, data: &[u8]) -> Result<()> {
        let direction = match side {
            Side::Local => "Local -> Remote",
            Side::Remote => "Remote -> Local",
        };
        writeln!(self.out, "{} ({} Bytes)", direction, data.len())?;
        write!(self.out, "{}", hexdump::format_dump(data, Local::now()))?;

        if let Some(log) = self.traffic.as_mut() {
            if let Err(e) = log.record(side, data) {
                tracing::warn!("Traffic log write failed, disabling it: {}", e);
                self.traffic = None;
            }
        }
        Ok(())
    }

    fn state(&mut self, side: Side, connected: bool) -> Result<()> {
        let label = if connected { "connected" } else { "disconnected" };
        writeln!(self.out, "{} {}", side, label)?;
        Ok(())
    }
}
