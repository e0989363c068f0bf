//! Command-stream grammar and test-file loading.
//!
//! Grammar: whitespace-tolerant `name(arg, ...)` records, `;` separating
//! commands on one logical line, `//` starting a line comment. A line of
//! `---` switches a test file from commands to assertions, one per line:
//! `assertCommitted(Tk)` / `assertAborted(Tk)`. Assertions are validated at
//! load time so a malformed test file fails before any command runs.

use std::fs;
use std::path::Path;

use repcrec_error::{RepcrecError, Result};
use repcrec_types::{Command, SiteId, TxnId, VariableId};

/// One expected outcome from a test file's assertion section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Assertion {
    Committed(TxnId),
    Aborted(TxnId),
}

impl Assertion {
    /// The transaction this assertion is about.
    #[must_use]
    pub const fn txn(&self) -> TxnId {
        match self {
            Self::Committed(t) | Self::Aborted(t) => *t,
        }
    }
}

/// A parsed test file: the command section and the assertion section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScript {
    commands: Vec<Command>,
    assertions: Vec<Assertion>,
}

impl TestScript {
    /// Parse script text.
    ///
    /// # Errors
    ///
    /// [`RepcrecError::ScriptParse`] / [`RepcrecError::UnknownCommand`] with
    /// the offending line number.
    pub fn parse(input: &str) -> Result<Self> {
        let mut commands = Vec::new();
        let mut assertions = Vec::new();
        let mut in_assertions = false;

        for (idx, raw_line) in input.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if line == "---" {
                in_assertions = true;
                continue;
            }
            for record in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                if in_assertions {
                    assertions.push(parse_assertion(record, line_no)?);
                } else {
                    commands.push(parse_command(record, line_no)?);
                }
            }
        }
        Ok(Self {
            commands,
            assertions,
        })
    }

    /// Load and parse a script file.
    ///
    /// # Errors
    ///
    /// I/O errors reading the file, plus any parse error.
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// The command section, in input order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The assertion section, in input order.
    #[must_use]
    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }
}

fn strip_comment(line: &str) -> &str {
    match line.split_once("//") {
        Some((before, _)) => before,
        None => line,
    }
}

/// Split `name(arg, ...)` into the name and trimmed argument list.
fn split_record<'a>(record: &'a str, line_no: usize) -> Result<(&'a str, Vec<&'a str>)> {
    let open = record.find('(').ok_or_else(|| RepcrecError::ScriptParse {
        line: line_no,
        detail: format!("expected 'name(args)', got '{record}'"),
    })?;
    let rest = &record[open + 1..];
    let close = rest.rfind(')').ok_or_else(|| RepcrecError::ScriptParse {
        line: line_no,
        detail: format!("missing ')' in '{record}'"),
    })?;
    if !rest[close + 1..].trim().is_empty() {
        return Err(RepcrecError::ScriptParse {
            line: line_no,
            detail: format!("trailing text after ')' in '{record}'"),
        });
    }
    let name = record[..open].trim();
    let args = rest[..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    Ok((name, args))
}

fn parse_command(record: &str, line_no: usize) -> Result<Command> {
    let (name, args) = split_record(record, line_no)?;
    let arity = |expected: usize| -> Result<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(RepcrecError::ScriptParse {
                line: line_no,
                detail: format!(
                    "{name} takes {expected} argument(s), got {}",
                    args.len()
                ),
            })
        }
    };

    match name.to_ascii_lowercase().as_str() {
        "begin" => {
            arity(1)?;
            Ok(Command::Begin(parse_txid(args[0], line_no)?))
        }
        "beginro" => {
            arity(1)?;
            Ok(Command::BeginRo(parse_txid(args[0], line_no)?))
        }
        "r" => {
            arity(2)?;
            Ok(Command::Read(
                parse_txid(args[0], line_no)?,
                parse_variable(args[1], line_no)?,
            ))
        }
        "w" => {
            arity(3)?;
            Ok(Command::Write(
                parse_txid(args[0], line_no)?,
                parse_variable(args[1], line_no)?,
                parse_value(args[2], line_no)?,
            ))
        }
        "end" => {
            arity(1)?;
            Ok(Command::End(parse_txid(args[0], line_no)?))
        }
        "fail" => {
            arity(1)?;
            Ok(Command::Fail(parse_site(args[0], line_no)?))
        }
        "recover" => {
            arity(1)?;
            Ok(Command::Recover(parse_site(args[0], line_no)?))
        }
        "dump" => match args.as_slice() {
            [] => Ok(Command::DumpAll),
            &[arg] if arg.starts_with('x') => {
                Ok(Command::DumpVariable(parse_variable(arg, line_no)?))
            }
            &[arg] => Ok(Command::DumpSite(parse_site(arg, line_no)?)),
            _ => Err(RepcrecError::ScriptParse {
                line: line_no,
                detail: format!("dump takes at most 1 argument, got {}", args.len()),
            }),
        },
        _ => Err(RepcrecError::UnknownCommand {
            line: line_no,
            name: name.to_string(),
        }),
    }
}

fn parse_assertion(record: &str, line_no: usize) -> Result<Assertion> {
    let (name, args) = split_record(record, line_no)?;
    if args.len() != 1 {
        return Err(RepcrecError::ScriptParse {
            line: line_no,
            detail: format!("{name} takes 1 argument, got {}", args.len()),
        });
    }
    let txn = parse_txid(args[0], line_no)?;
    match name {
        "assertCommitted" => Ok(Assertion::Committed(txn)),
        "assertAborted" => Ok(Assertion::Aborted(txn)),
        _ => Err(RepcrecError::UnknownCommand {
            line: line_no,
            name: name.to_string(),
        }),
    }
}

fn parse_txid(text: &str, line_no: usize) -> Result<TxnId> {
    let digits = text.strip_prefix('T').ok_or_else(|| RepcrecError::ScriptParse {
        line: line_no,
        detail: format!("transaction id '{text}' must match T[0-9]+"),
    })?;
    parse_nonzero(digits, line_no, text).map(|n| TxnId::new(n).expect("nonzero"))
}

fn parse_variable(text: &str, line_no: usize) -> Result<VariableId> {
    let digits = text.strip_prefix('x').ok_or_else(|| RepcrecError::ScriptParse {
        line: line_no,
        detail: format!("variable '{text}' must match x[0-9]+"),
    })?;
    parse_nonzero(digits, line_no, text).map(|n| VariableId::new(n).expect("nonzero"))
}

fn parse_site(text: &str, line_no: usize) -> Result<SiteId> {
    parse_nonzero(text, line_no, text).map(|n| SiteId::new(n).expect("nonzero"))
}

fn parse_nonzero(digits: &str, line_no: usize, original: &str) -> Result<u32> {
    match digits.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RepcrecError::ScriptParse {
            line: line_no,
            detail: format!("'{original}' is not a positive integer id"),
        }),
    }
}

fn parse_value(text: &str, line_no: usize) -> Result<i64> {
    text.parse::<i64>().map_err(|_| RepcrecError::ScriptParse {
        line: line_no,
        detail: format!("'{text}' is not an integer value"),
    })
}
