//! Statement dispatch and protocol responses.
//!
//! [`Engine`] ties the registry to the status counters and turns parsed
//! statements into wire responses. It is synchronous; network front ends
//! call it from blocking worker threads.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{ErrorKind, ParseError, Result, RrdbError};
use crate::metric::unix_now;
use crate::query::{QueryResult, format_value};
use crate::registry::{DEFAULT_POLICY, MetricInfo, Registry, RegistryOptions};
use crate::statement::Statement;
use crate::status::{Counter, METRIC_COUNT, ServerStatus, filter_like};

/// Prefix of the metrics the engine records its own counters into.
pub const SELF_METRIC_PREFIX: &str = "self.";

/// Successful result of a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// CREATE, DROP and UPDATE.
    Ok,
    /// SHOW METRICS: sorted names.
    Metrics(Vec<String>),
    /// SHOW METRIC POLICY: canonical policy text.
    Policy(String),
    /// SHOW METRIC: last sample of one metric.
    Metric(MetricInfo),
    /// SHOW STATUS: counters by name.
    Status(BTreeMap<String, u64>),
    /// SELECT: query rows.
    Rows(QueryResult),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Metrics(names) => {
                for name in names {
                    write!(f, "{name};")?;
                }
                Ok(())
            }
            Self::Policy(policy) => f.write_str(policy),
            Self::Metric(info) => {
                writeln!(f, "name,last_ts,last_value")?;
                match info.last_update {
                    Some(last) => writeln!(
                        f,
                        "{},{},{}",
                        info.name,
                        last.timestamp,
                        format_value(last.value)
                    ),
                    None => writeln!(f, "{},,", info.name),
                }
            }
            Self::Status(values) => {
                writeln!(f, "name,value")?;
                for (name, value) in values {
                    writeln!(f, "{name},{value}")?;
                }
                Ok(())
            }
            Self::Rows(result) => write!(f, "{result}"),
        }
    }
}

/// The registry plus server status, shared by all connections.
#[derive(Debug)]
pub struct Engine {
    registry: Registry,
    status: ServerStatus,
}

impl Engine {
    /// Wraps an opened registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            status: ServerStatus::new(),
        }
    }

    /// Opens the registry at `path`.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Registry::open`].
    pub fn open<P: AsRef<Path>>(path: P, options: RegistryOptions) -> Result<Self> {
        Ok(Self::new(Registry::open(path, options)?))
    }

    /// The metric registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The status counters.
    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    /// Executes a parsed statement.
    ///
    /// # Errors
    ///
    /// Returns the registry error for the failed operation.
    pub fn execute(&self, statement: Statement) -> Result<Response> {
        match statement {
            Statement::Create { name, policy } => {
                self.registry.create(&name, &policy)?;
                Ok(Response::Ok)
            }
            Statement::Drop { name } => {
                self.registry.drop_metric(&name)?;
                Ok(Response::Ok)
            }
            Statement::ShowMetrics { like } => {
                Ok(Response::Metrics(self.registry.show_metrics(like.as_deref())))
            }
            Statement::ShowMetric { name } => {
                Ok(Response::Metric(self.registry.show_metric(&name)?))
            }
            Statement::ShowPolicy { name } => {
                Ok(Response::Policy(self.registry.show_policy(&name)?))
            }
            Statement::ShowStatus { like } => {
                Ok(Response::Status(self.status_snapshot(like.as_deref())))
            }
            Statement::Update {
                name,
                value,
                timestamp,
            } => {
                self.registry
                    .update(&name, timestamp.unwrap_or_else(unix_now), value)?;
                Ok(Response::Ok)
            }
            Statement::Select {
                name,
                start,
                end,
                group_by,
            } => Ok(Response::Rows(self.registry.select(&name, start, end, group_by)?)),
        }
    }

    /// Status counters plus the metric count, filtered by `like`.
    pub fn status_snapshot(&self, like: Option<&str>) -> BTreeMap<String, u64> {
        let mut values = self.status.snapshot(None);
        values.insert(METRIC_COUNT.to_string(), self.registry.len() as u64);
        filter_like(values, like)
    }

    /// Parses and executes one TCP statement, returning the response text.
    ///
    /// Failures are rendered as `ERROR: <message>`.
    pub fn handle_tcp(&self, text: &str) -> String {
        self.status.increment(Counter::TcpRequests);
        match Statement::parse(text).and_then(|statement| self.execute(statement)) {
            Ok(response) => response.to_string(),
            Err(e) => {
                self.status.increment(Counter::TcpErrors);
                log_failure(text, &e);
                format!("ERROR: {e}")
            }
        }
    }

    /// Parses and executes one UDP command. There is no reply.
    ///
    /// # Errors
    ///
    /// Returns the parse or execution error; callers only log it.
    pub fn handle_udp(&self, packet: &str) -> Result<()> {
        self.status.increment(Counter::UdpRequests);
        let result = Statement::parse_command(packet).and_then(|statement| self.execute(statement));
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.status.increment(Counter::UdpErrors);
                log_failure(packet, &e);
                Err(e)
            }
        }
    }

    /// Flushes the registry and counts the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure.
    pub fn flush(&self) -> Result<()> {
        let result = self.registry.flush();
        match result {
            Ok(()) => self.status.increment(Counter::Flushes),
            Err(_) => self.status.increment(Counter::FlushErrors),
        }
        result
    }

    /// Records every status value into a `self.<name>` metric at `timestamp`,
    /// creating the metric with the default policy on first use.
    ///
    /// # Errors
    ///
    /// Returns the first error; remaining values are skipped.
    #[allow(clippy::cast_precision_loss)] // counters stay far below 2^53
    pub fn record_status(&self, timestamp: u64) -> Result<()> {
        for (name, value) in self.status_snapshot(None) {
            let metric = format!("{SELF_METRIC_PREFIX}{name}");
            match self.registry.update(&metric, timestamp, value as f64) {
                Err(e) if e.kind() == ErrorKind::UnknownMetric => {
                    match self.registry.create(&metric, DEFAULT_POLICY) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                        Err(e) => return Err(e),
                    }
                    self.registry.update(&metric, timestamp, value as f64)?;
                }
                other => other?,
            }
        }
        Ok(())
    }
}

fn log_failure(input: &str, error: &RrdbError) {
    match error {
        RrdbError::Parse(ParseError::Statement { reason }) => {
            tracing::debug!("failed to parse {:?}: {reason}", input.trim());
        }
        e => tracing::debug!("request {:?} failed: {e}", input.trim()),
    }
}
