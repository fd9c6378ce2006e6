//! Interactive demo front end for the store.

use std::io::{self, BufRead, Write};

use emberdb::{Result, Store};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());
    let store = Store::open(dir)?;

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Please enter command (quit | get <key> | put <key> <value>): ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("quit"), ..) => break,
            (Some("get"), Some(key), _) => match store.get(key.as_bytes())? {
                Some(value) => println!("GET {key}:{}", String::from_utf8_lossy(&value)),
                None => println!("GET {key}:not found"),
            },
            (Some("put"), Some(key), Some(value)) => {
                store.put(key.as_bytes(), value.as_bytes())?;
                println!("PUT {key}:{value}");
            }
            _ => {}
        }
    }

    Ok(())
}
