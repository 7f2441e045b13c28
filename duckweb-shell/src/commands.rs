//! Parsing of shell input lines.

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain SQL, streamed.
    Sql(String),
    /// `.run <sql>`: fully buffered query.
    Run(String),
    Import {
        format: ImportFormat,
        path: String,
        options: String,
    },
    Tokens(String),
    Flush(Option<String>),
    Version,
    Status,
    Help,
    Exit,
}

pub const HELP: &str = "\
.run <sql>                          run a query to completion
.import csv|json <path> <options>   import a file as a table, options as JSON
.tokens <sql>                       show the token stream of a script
.flush [path]                       write buffered files
.version                            engine version
.status                             open connections
.help                               this text
.exit                               leave the shell";

pub fn parse(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        return Ok(Command::Exit);
    }
    let Some(dot) = line.strip_prefix('.') else {
        return Ok(Command::Sql(line.to_string()));
    };

    let (name, rest) = match dot.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (dot, ""),
    };
    let command = match name {
        "run" => Command::Run(required(rest, ".run <sql>")?),
        "import" => parse_import(rest)?,
        "tokens" => Command::Tokens(required(rest, ".tokens <sql>")?),
        "flush" => Command::Flush((!rest.is_empty()).then(|| rest.to_string())),
        "version" => Command::Version,
        "status" => Command::Status,
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        other => bail!("unknown command: .{other} (try .help)"),
    };
    Ok(command)
}

fn parse_import(rest: &str) -> Result<Command> {
    const USAGE: &str = ".import csv|json <path> <options-json>";
    let (format, rest) = rest.split_once(char::is_whitespace).context(USAGE)?;
    let format = match format.to_ascii_lowercase().as_str() {
        "csv" => ImportFormat::Csv,
        "json" => ImportFormat::Json,
        other => bail!("unsupported import format '{other}', expected csv or json"),
    };
    let (path, options) = rest.trim().split_once(char::is_whitespace).context(USAGE)?;
    Ok(Command::Import {
        format,
        path: path.to_string(),
        options: required(options.trim(), USAGE)?,
    })
}

fn required(text: &str, usage: &str) -> Result<String> {
    if text.is_empty() {
        bail!("usage: {usage}");
    }
    Ok(text.to_string())
}
