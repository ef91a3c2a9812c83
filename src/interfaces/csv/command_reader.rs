use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Register,
    Order,
    Confirm,
    Withdraw,
    Settle,
    Refund,
    Referral,
    Qualify,
    Sweep,
}

/// One row of a command file.
///
/// Columns are `command, agent, reference, amount, detail`; which of them a
/// command needs depends on the command. Empty or missing trailing columns
/// read as `None`.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct CommandRecord {
    pub command: CommandKind,
    pub agent: Option<String>,
    pub reference: Option<String>,
    pub amount: Option<Decimal>,
    pub detail: Option<String>,
}

impl CommandRecord {
    pub fn agent(&self) -> Result<&str> {
        required(self.agent.as_deref(), "agent", self.command)
    }

    pub fn reference(&self) -> Result<&str> {
        required(self.reference.as_deref(), "reference", self.command)
    }

    pub fn amount(&self) -> Result<Decimal> {
        self.amount.ok_or_else(|| {
            LedgerError::ValidationError(format!("{:?} needs an amount", self.command))
        })
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref().filter(|d| !d.is_empty())
    }
}

fn required<'a>(value: Option<&'a str>, column: &str, command: CommandKind) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LedgerError::ValidationError(format!("{command:?} needs a {column}")))
}

/// Reads commands from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over
/// `Result<CommandRecord>`. Whitespace is trimmed and short rows are
/// accepted.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and deserializes commands, one row at a time.
    pub fn commands(self) -> impl Iterator<Item = Result<CommandRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
