//! duckweb - interactive shell over the duckweb query protocol

mod commands;
mod render;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use duckweb_core::{ConnectionId, WebDb, WebDbConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::commands::{Command, ImportFormat, HELP};
use crate::render::{read_file, render, QueryOutput, StreamCollector};

/// duckweb - embedded DuckDB shell
#[derive(Parser, Debug)]
#[command(name = "duckweb")]
#[command(about = "Interactive SQL shell for an embedded DuckDB engine", long_about = None)]
struct Args {
    /// SQL to execute (if provided, runs in non-interactive mode)
    #[arg(short, long)]
    query: Option<String>,

    /// Database file; the database lives in memory when omitted
    #[arg(long)]
    database: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct Shell {
    db: Arc<WebDb>,
    connection: ConnectionId,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = WebDbConfig::load().context("failed to load configuration")?;
    if args.database.is_some() {
        config.database_path = args.database.clone();
    }
    init_tracing(&config, args.debug);

    let db = WebDb::open(config).context("failed to open database")?;
    let connection = db.connect().context("failed to open connection")?;
    info!(version = db.version(), %connection, "shell connected");
    let shell = Shell { db, connection };

    let result = match args.query {
        Some(query) => shell.execute(commands::parse(&query)?).map(|_| ()),
        None => shell.interactive(args.debug),
    };
    shell.db.disconnect(shell.connection);
    result
}

fn init_tracing(config: &WebDbConfig, debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

impl Shell {
    fn interactive(&self, debug: bool) -> Result<()> {
        println!("duckweb {} (DuckDB {})", env!("CARGO_PKG_VERSION"), self.db.version());
        println!("Enter SQL or a dot command; .help lists them. Press Ctrl-C twice to exit.\n");

        let mut rl = DefaultEditor::new()?;
        let history_file = dirs::home_dir()
            .map(|mut p| {
                p.push(".duckweb_history");
                p
            })
            .unwrap_or_default();
        if history_file.exists() {
            let _ = rl.load_history(&history_file);
        }

        let mut interrupt_count = 0;
        loop {
            match rl.readline("duckweb> ") {
                Ok(line) => {
                    interrupt_count = 0;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line);

                    let outcome = commands::parse(line).and_then(|command| self.execute(command));
                    match outcome {
                        Ok(true) => {}
                        Ok(false) => {
                            println!("Goodbye!");
                            break;
                        }
                        Err(e) => {
                            eprintln!("Error: {}", e);
                            if debug {
                                eprintln!("Details: {:?}", e);
                            }
                        }
                    }
                    println!();
                }
                Err(ReadlineError::Interrupted) => {
                    interrupt_count += 1;
                    if interrupt_count >= 2 {
                        println!("\nGoodbye!");
                        break;
                    }
                    println!("^C (press Ctrl-C again to exit)");
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(err) => {
                    eprintln!("Error reading input: {}", err);
                    break;
                }
            }
        }

        if !history_file.as_os_str().is_empty() {
            let _ = rl.save_history(&history_file);
        }
        Ok(())
    }

    /// Run one command; `false` means the shell should exit.
    fn execute(&self, command: Command) -> Result<bool> {
        let start = Instant::now();
        match command {
            Command::Sql(sql) => {
                let mut collector = StreamCollector::new();
                collector.push(self.db.send_query(self.connection, &sql)?)?;
                while let Some(payload) = self.db.fetch_query_results(self.connection)? {
                    collector.push(payload)?;
                }
                display(&collector.finish()?, start)?;
            }
            Command::Run(sql) => {
                let output = read_file(self.db.run_query(self.connection, &sql)?)?;
                display(&output, start)?;
            }
            Command::Import {
                format,
                path,
                options,
            } => {
                match format {
                    ImportFormat::Csv => self.db.import_csv(self.connection, &path, &options)?,
                    ImportFormat::Json => self.db.import_json(self.connection, &path, &options)?,
                }
                println!("Imported {} in {:.3}s", path, start.elapsed().as_secs_f64());
            }
            Command::Tokens(sql) => println!("{}", self.db.tokenize(&sql)?),
            Command::Flush(Some(path)) => {
                self.db.flush_file(&path)?;
                println!("Flushed {}", path);
            }
            Command::Flush(None) => {
                self.db.flush_files()?;
                println!("Flushed buffered files");
            }
            Command::Version => println!("{}", self.db.version()),
            Command::Status => {
                let snapshot = self.db.registry_snapshot();
                let limit = snapshot
                    .max_connections
                    .map_or_else(|| "unlimited".to_string(), |max| max.to_string());
                let active = self.db.is_active(self.connection)?;
                println!(
                    "connection {} | open connections: {} (limit {}) | streaming: {}",
                    self.connection, snapshot.total_connections, limit, active
                );
            }
            Command::Help => println!("{}", HELP),
            Command::Exit => return Ok(false),
        }
        Ok(true)
    }
}

fn display(output: &QueryOutput, start: Instant) -> Result<()> {
    let elapsed = start.elapsed();
    let rows = output.rows();
    if output.schema.fields().is_empty() || rows == 0 {
        println!("(No rows returned)");
    } else {
        println!("{}", render(output)?);
    }
    println!(
        "{} row{} in {:.3}s",
        rows,
        if rows == 1 { "" } else { "s" },
        elapsed.as_secs_f64()
    );
    Ok(())
}
