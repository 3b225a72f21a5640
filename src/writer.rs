//! Database writer: owns the single PostgreSQL connection, batches ROWs
//! into transactions under the three-axis commit policy, and recovers from
//! connection loss by replaying the pending list.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use postgres::types::ToSql;
use postgres::{Client, NoTls, Statement};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::queue::{MessageQueue, PopOutcome};
use crate::row::RowTuple;
use crate::signals::{block_termination_signals_in_current_thread, request_termination};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Transaction,
    Error,
}

pub struct Writer {
    connection_url: String,
    retry_interval: Duration,
    max_failed_reconnections: u32,
    max_inserts: usize,
    max_duration: Duration,
    idle_timeout: Duration,
    tables: Vec<Arc<Table>>,

    client: Option<Client>,
    statements: HashMap<String, Statement>,
    state: State,
    /// ROWs sent to the database since the last COMMIT, kept for replay on
    /// reconnect.
    pending: Vec<Arc<RowTuple>>,
    inserts_since_begin: usize,
    began_at: Instant,
    last_row_at: Instant,
    failed_reconnections: u32,

    incoming: Arc<MessageQueue<Arc<RowTuple>, ()>>,
}

impl Writer {
    pub fn new(
        db: &DatabaseConfig,
        tables: Vec<Arc<Table>>,
        incoming: Arc<MessageQueue<Arc<RowTuple>, ()>>,
    ) -> Self {
        Self {
            connection_url: db.connection_url.clone(),
            retry_interval: Duration::from_millis(db.retry_interval_ms),
            max_failed_reconnections: db.max_failed_reconnections,
            max_inserts: db.transaction.max_inserts,
            max_duration: Duration::from_millis(db.transaction.max_duration_ms),
            idle_timeout: Duration::from_millis(db.transaction.idle_timeout_ms),
            tables,
            client: None,
            statements: HashMap::new(),
            state: State::Connected,
            pending: Vec::new(),
            inserts_since_begin: 0,
            began_at: Instant::now(),
            last_row_at: Instant::now(),
            failed_reconnections: 0,
            incoming,
        }
    }

    /// Dials the database and prepares one statement per table. A failure
    /// here is fatal to start-up.
    pub fn connect(&mut self) -> Result<()> {
        let (client, statements) = dial_and_prepare(&self.connection_url, &self.tables)?;
        self.client = Some(client);
        self.statements = statements;
        self.state = State::Connected;
        Ok(())
    }

    /// Runs until the parser closes the incoming queue, then finalises any
    /// open transaction before returning.
    pub fn run(&mut self) -> Result<()> {
        block_termination_signals_in_current_thread()?;
        loop {
            let outcome = match self.state {
                State::Transaction => self.incoming.pop_timeout(self.next_deadline()),
                _ => match self.incoming.pop() {
                    Some((row, tag)) => PopOutcome::Message(row, tag),
                    None => PopOutcome::Closed,
                },
            };
            match outcome {
                PopOutcome::Message(row, ()) => {
                    if let Err(err) = self.handle_row(row) {
                        log::error!(target: "log2pg::writer", "giving up: {err}");
                        request_termination();
                        return Err(err);
                    }
                }
                PopOutcome::Timeout => {
                    if self.state == State::Transaction {
                        if let Err(err) = self.commit() {
                            log::error!(target: "log2pg::writer", "giving up: {err}");
                            request_termination();
                            return Err(err);
                        }
                    }
                }
                PopOutcome::Closed => break,
            }
        }
        if self.state == State::Transaction {
            self.commit()?;
        }
        Ok(())
    }

    /// Wake-up deadline while a transaction is open: whichever of
    /// `max-duration` (since BEGIN) or `idle-timeout` (since the last ROW)
    /// comes first.
    fn next_deadline(&self) -> Duration {
        let now = Instant::now();
        let duration_deadline = self.began_at + self.max_duration;
        let idle_deadline = self.last_row_at + self.idle_timeout;
        let deadline = duration_deadline.min(idle_deadline);
        deadline.saturating_duration_since(now)
    }

    fn handle_row(&mut self, row: Arc<RowTuple>) -> Result<()> {
        if self.state == State::Connected {
            self.begin()?;
        }
        self.pending.push(row.clone());
        match self.execute(&row) {
            Ok(()) => {
                self.inserts_since_begin += 1;
                self.last_row_at = Instant::now();
                if self.inserts_since_begin >= self.max_inserts {
                    self.commit()?;
                }
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "log2pg::writer", "insert failed, entering recovery: {err}");
                self.state = State::Error;
                self.reconnect_and_replay()
            }
        }
    }

    fn begin(&mut self) -> Result<()> {
        let client = self.client.as_mut().expect("connected");
        client.batch_execute("BEGIN")?;
        self.state = State::Transaction;
        self.began_at = Instant::now();
        self.last_row_at = self.began_at;
        self.inserts_since_begin = 0;
        Ok(())
    }

    fn execute(&mut self, row: &RowTuple) -> Result<()> {
        let client = self.client.as_mut().expect("connected");
        let table_name = &row.item.config.table.name;
        let statement = self
            .statements
            .get(table_name)
            .unwrap_or_else(|| panic!("no prepared statement for table '{table_name}'"));
        let fields = row.fields();
        let params: Vec<&(dyn ToSql + Sync)> =
            fields.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        client.execute(statement, &params)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let client = self.client.as_mut().expect("connected");
        match client.batch_execute("COMMIT") {
            Ok(()) => {
                self.pending.clear();
                self.state = State::Connected;
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "log2pg::writer", "commit failed, entering recovery: {err}");
                self.state = State::Error;
                self.reconnect_and_replay()
            }
        }
    }

    /// Sleeps `retry-interval`, then redials, re-prepares, and replays the
    /// pending list inside a fresh transaction; repeats on failure until
    /// `max-failed-reconnections` is reached.
    fn reconnect_and_replay(&mut self) -> Result<()> {
        loop {
            thread::sleep(self.retry_interval);
            match self.try_reconnect() {
                Ok(()) => {
                    self.failed_reconnections = 0;
                    return Ok(());
                }
                Err(err) => {
                    self.failed_reconnections += 1;
                    log::error!(
                        target: "log2pg::writer",
                        "reconnect attempt {}/{} failed: {err}",
                        self.failed_reconnections,
                        self.max_failed_reconnections
                    );
                    if self.failed_reconnections >= self.max_failed_reconnections {
                        return Err(Error::MaxFailedReconnections);
                    }
                }
            }
        }
    }

    fn try_reconnect(&mut self) -> Result<()> {
        let (mut client, statements) = dial_and_prepare(&self.connection_url, &self.tables)?;
        client.batch_execute("BEGIN")?;
        for row in &self.pending {
            let table_name = &row.item.config.table.name;
            let statement = statements
                .get(table_name)
                .unwrap_or_else(|| panic!("no prepared statement for table '{table_name}'"));
            let fields = row.fields();
            let params: Vec<&(dyn ToSql + Sync)> =
                fields.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            client.execute(statement, &params)?;
        }
        client.batch_execute("COMMIT")?;

        self.client = Some(client);
        self.statements = statements;
        self.pending.clear();
        self.state = State::Connected;
        Ok(())
    }
}

fn dial_and_prepare(
    connection_url: &str,
    tables: &[Arc<Table>],
) -> Result<(Client, HashMap<String, Statement>)> {
    let mut client = Client::connect(connection_url, NoTls)?;
    let mut statements = HashMap::with_capacity(tables.len());
    for table in tables {
        let statement = client.prepare(&table.positional_sql)?;
        statements.insert(table.name.clone(), statement);
    }
    Ok((client, statements))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `next_deadline` exercises the pure batching-policy arithmetic
    /// without a database connection.
    #[test]
    fn next_deadline_picks_the_earlier_of_duration_and_idle() {
        let db = DatabaseConfig {
            connection_url: "postgres://localhost/test".to_string(),
            retry_interval_ms: 30_000,
            max_failed_reconnections: 3,
            transaction: crate::config::TransactionConfig {
                max_inserts: 1000,
                max_duration_ms: 10_000,
                idle_timeout_ms: 1000,
            },
        };
        let queue = Arc::new(MessageQueue::<Arc<RowTuple>, ()>::new(32_000));
        let mut writer = Writer::new(&db, Vec::new(), queue);
        writer.state = State::Transaction;
        writer.began_at = Instant::now();
        writer.last_row_at = Instant::now();
        let deadline = writer.next_deadline();
        assert!(deadline <= Duration::from_millis(1000));
    }

    #[test]
    fn pending_list_grows_and_clears_without_touching_the_network() {
        use crate::format::Format;
        use crate::table::Table;
        use crate::watched::test_support::make_file_item_for_tests;

        let fmt = Arc::new(
            Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap(),
        );
        let table = Arc::new(Table::new("t", "insert into t(k,v) values($k,$v)").unwrap());
        let item = Arc::new(make_file_item_for_tests(fmt, table));
        let row = Arc::new(RowTuple::new(item, &["a".to_string(), "1".to_string()]));

        let db = DatabaseConfig {
            connection_url: "postgres://localhost/test".to_string(),
            retry_interval_ms: 30_000,
            max_failed_reconnections: 3,
            transaction: crate::config::TransactionConfig {
                max_inserts: 1000,
                max_duration_ms: 10_000,
                idle_timeout_ms: 1000,
            },
        };
        let queue = Arc::new(MessageQueue::<Arc<RowTuple>, ()>::new(32_000));
        let mut writer = Writer::new(&db, Vec::new(), queue);
        writer.pending.push(row);
        assert_eq!(writer.pending.len(), 1);
        writer.pending.clear();
        assert!(writer.pending.is_empty());
    }
}
