//! Statement parsing for the TCP and UDP text protocols.
//!
//! # TCP grammar
//!
//! Keywords are case-insensitive, names are quoted with `'` or `"`, and
//! every statement ends with `;` followed by nothing but whitespace:
//!
//! ```text
//! CREATE [METRIC] '<name>' KEEP <policy | '<policy>'> ;
//! DROP [METRIC] '<name>' ;
//! SHOW METRICS [LIKE '<pattern>'] ;
//! SHOW METRIC '<name>' ;
//! SHOW [METRIC] POLICY '<name>' ;
//! SHOW STATUS [LIKE '<pattern>'] ;
//! UPDATE [METRIC] '<name>' ADD <value> [AT <ts>] ;
//! SELECT * FROM [METRIC] '<name>' BETWEEN <ts1> AND <ts2> [GROUP BY <duration>] ;
//! ```
//!
//! # UDP commands
//!
//! ```text
//! u|<name>|<value>[|<ts>]
//! c|<name>|<policy>
//! d|<name>
//! ```

use crate::duration::Duration;
use crate::error::{ParseError, Result};

/// A parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Create a metric with a retention policy.
    Create {
        /// Metric name as written by the client.
        name: String,
        /// Policy text, validated when the metric is created.
        policy: String,
    },
    /// Drop a metric and its data.
    Drop {
        /// Metric name.
        name: String,
    },
    /// List metric names.
    ShowMetrics {
        /// Substring filter.
        like: Option<String>,
    },
    /// Show the last sample of a metric.
    ShowMetric {
        /// Metric name.
        name: String,
    },
    /// Show the retention policy of a metric.
    ShowPolicy {
        /// Metric name.
        name: String,
    },
    /// Show server status counters.
    ShowStatus {
        /// Substring filter.
        like: Option<String>,
    },
    /// Add a sample to a metric.
    Update {
        /// Metric name.
        name: String,
        /// Sample value.
        value: f64,
        /// Sample time; the current time if absent.
        timestamp: Option<u64>,
    },
    /// Query a time range.
    Select {
        /// Metric name.
        name: String,
        /// Inclusive range start.
        start: u64,
        /// Exclusive range end.
        end: u64,
        /// Requested granularity.
        group_by: Option<Duration>,
    },
}

impl Statement {
    /// Parses one TCP statement.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Statement`] if the text does not match the
    /// grammar, or [`ParseError::Duration`] for a bad `GROUP BY` interval.
    pub fn parse(text: &str) -> Result<Self> {
        let mut scanner = Scanner::new(text);
        let Some(verb) = scanner.next_token() else {
            return Err(ParseError::statement("empty statement").into());
        };

        let statement = match verb.to_ascii_lowercase().as_str() {
            "create" => {
                scanner.accept("metric");
                let name = scanner.quoted()?;
                scanner.expect("keep")?;
                let policy = if scanner.at_quote() {
                    scanner.quoted()?
                } else {
                    scanner.until_semicolon()
                };
                if policy.trim().is_empty() {
                    return Err(ParseError::statement("missing retention policy").into());
                }
                Self::Create {
                    name: name.to_string(),
                    policy: policy.to_string(),
                }
            }
            "drop" => {
                scanner.accept("metric");
                Self::Drop {
                    name: scanner.quoted()?.to_string(),
                }
            }
            "show" => {
                if scanner.accept("metrics") {
                    Self::ShowMetrics {
                        like: scanner.like()?,
                    }
                } else if scanner.accept("status") {
                    Self::ShowStatus {
                        like: scanner.like()?,
                    }
                } else {
                    let metric = scanner.accept("metric");
                    if scanner.accept("policy") {
                        Self::ShowPolicy {
                            name: scanner.quoted()?.to_string(),
                        }
                    } else if metric {
                        Self::ShowMetric {
                            name: scanner.quoted()?.to_string(),
                        }
                    } else {
                        return Err(ParseError::statement("unknown SHOW statement").into());
                    }
                }
            }
            "update" => {
                scanner.accept("metric");
                let name = scanner.quoted()?.to_string();
                scanner.expect("add")?;
                let value = scanner.number("value")?;
                let timestamp = if scanner.accept("at") {
                    Some(scanner.number("timestamp")?)
                } else {
                    None
                };
                Self::Update {
                    name,
                    value,
                    timestamp,
                }
            }
            "select" => {
                scanner.expect("*")?;
                scanner.expect("from")?;
                scanner.accept("metric");
                let name = scanner.quoted()?.to_string();
                scanner.expect("between")?;
                let start = scanner.number("range start")?;
                scanner.expect("and")?;
                let end = scanner.number("range end")?;
                let group_by = if scanner.accept("group") {
                    scanner.expect("by")?;
                    Some(Duration::parse_any(scanner.until_semicolon())?)
                } else {
                    None
                };
                Self::Select {
                    name,
                    start,
                    end,
                    group_by,
                }
            }
            other => {
                return Err(ParseError::statement(format!("unknown statement '{other}'")).into());
            }
        };

        scanner.finish()?;
        Ok(statement)
    }

    /// Parses one UDP command packet.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Command`] for a malformed packet and
    /// [`ParseError::Value`] for an unparsable sample value.
    pub fn parse_command(packet: &str) -> Result<Self> {
        let input = packet.trim();
        let malformed = || ParseError::Command {
            input: input.to_string(),
        };

        let fields: Vec<&str> = input.split('|').map(str::trim).collect();
        let statement = match fields.as_slice() {
            [kind, name, value, rest @ ..] if kind.eq_ignore_ascii_case("u") && rest.len() <= 1 => {
                let value = value.parse().map_err(|_| ParseError::Value {
                    input: (*value).to_string(),
                })?;
                let timestamp = match rest {
                    [ts] => Some(ts.parse().map_err(|_| malformed())?),
                    _ => None,
                };
                Self::Update {
                    name: (*name).to_string(),
                    value,
                    timestamp,
                }
            }
            [kind, name, policy] if kind.eq_ignore_ascii_case("c") => Self::Create {
                name: (*name).to_string(),
                policy: (*policy).to_string(),
            },
            [kind, name] if kind.eq_ignore_ascii_case("d") => Self::Drop {
                name: (*name).to_string(),
            },
            _ => return Err(malformed().into()),
        };
        Ok(statement)
    }
}

/// Cursor over statement text.
#[derive(Debug, Clone, Copy)]
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Consumes the next bare token: `*`, `;`, or a run of characters up to
    /// whitespace, a quote or `;`. Returns `None` at the end or at a quote.
    fn next_token(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let rest = self.rest();
        let first = rest.chars().next()?;
        let len = if matches!(first, '*' | ';') {
            1
        } else {
            rest.find(|c: char| c.is_whitespace() || matches!(c, ';' | '\'' | '"'))
                .unwrap_or(rest.len())
        };
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn peek_token(&self) -> Option<&'a str> {
        let mut copy = *self;
        copy.next_token()
    }

    /// Consumes `keyword` if it is next.
    fn accept(&mut self, keyword: &str) -> bool {
        match self.peek_token() {
            Some(token) if token.eq_ignore_ascii_case(keyword) => {
                self.next_token();
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, keyword: &str) -> Result<()> {
        if self.accept(keyword) {
            Ok(())
        } else {
            Err(ParseError::statement(format!("expected '{keyword}'")).into())
        }
    }

    fn at_quote(&mut self) -> bool {
        self.skip_whitespace();
        self.rest().starts_with(['\'', '"'])
    }

    /// Consumes a `'...'` or `"..."` string and returns its contents.
    fn quoted(&mut self) -> Result<&'a str> {
        if !self.at_quote() {
            return Err(ParseError::statement("expected a quoted string").into());
        }
        let rest = self.rest();
        let quote = &rest[..1];
        let body = &rest[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| ParseError::statement("unterminated quoted string"))?;
        self.pos += end + 2;
        Ok(&body[..end])
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        self.next_token()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| ParseError::statement(format!("expected {what}")).into())
    }

    /// Consumes text up to (not including) the next `;`.
    fn until_semicolon(&mut self) -> &'a str {
        self.skip_whitespace();
        let rest = self.rest();
        let end = rest.find(';').unwrap_or(rest.len());
        self.pos += end;
        rest[..end].trim_end()
    }

    fn like(&mut self) -> Result<Option<String>> {
        if self.accept("like") {
            Ok(Some(self.quoted()?.to_string()))
        } else {
            Ok(None)
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.expect(";")?;
        if self.rest().trim().is_empty() {
            Ok(())
        } else {
            Err(ParseError::statement("unexpected input after ';'").into())
        }
    }
}
