use crate::application::read_models::AgentSnapshot;
use crate::error::Result;
use std::io::Write;

/// Writes agent snapshots as CSV, one row per agent with a header row.
pub struct SnapshotWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_agents<I>(&mut self, agents: I) -> Result<()>
    where
        I: IntoIterator<Item = AgentSnapshot>,
    {
        for agent in agents {
            self.writer.serialize(agent)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
