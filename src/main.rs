use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::Parser;

use silt::types::Value;
use silt::Database;

#[derive(Parser)]
#[command(name = "silt", about = "A small single-file SQL engine")]
struct Config {
    #[arg(help = "Path to the database file; created if missing")]
    #[arg(default_value = "silt.db")]
    database: String,
}

fn print_row(row: &[Value]) {
    let rendered: Vec<String> = row.iter().map(Value::to_string).collect();
    println!("{}", rendered.join(" | "));
}

/// Handles a dot command. Returns true when the REPL should exit.
fn handle_metacommand(db: &Database, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some(".exit") => return true,
        Some(".tables") => {
            for table in db.tables() {
                println!("{}", table);
            }
        }
        Some(".schema") => match words.next() {
            Some(table) => match db.columns_of(table) {
                Some(columns) => {
                    for (name, ty) in columns {
                        println!("{} {}", name, ty);
                    }
                }
                None => println!("no such table: {}", table),
            },
            None => println!("usage: .schema <table>"),
        },
        _ => println!("commands: .tables  .schema <table>  .exit"),
    }
    false
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let config = Config::parse();
    let mut db = Database::open(&config.database)?;
    println!("silt: connected to {}", config.database);

    let stdin = io::stdin();
    let mut statement = String::new();
    print!("silt> ");
    io::stdout().flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.starts_with('.') && statement.trim().is_empty() {
            if handle_metacommand(&db, trimmed) {
                break;
            }
        } else {
            statement.push_str(&line);
            statement.push('\n');

            // Execute once the input ends with a semicolon.
            if statement.trim_end().ends_with(';') {
                match db.execute(&statement, print_row) {
                    Ok(()) => (),
                    Err(e) => println!("error: {:#}", e),
                }
                statement.clear();
            }
        }

        if statement.trim().is_empty() {
            print!("silt> ");
        } else {
            print!("   -> ");
        }
        io::stdout().flush()?;
    }

    Ok(())
}
