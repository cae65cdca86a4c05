//! The `listen` command: a long-running stdin/stdout scan loop.
//!
//! One JSON request per input line, one JSON response per output line.
//! Responses come back in priority order, not submission order. Requests
//! that fail to decode are logged and produce no response.

use std::io::{self, BufRead as _};
use std::process::ExitCode;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use leaktk_core::{Config, Request, Scanner};
use tracing::error;

pub fn run(config: &Config) -> anyhow::Result<ExitCode> {
    let scanner = Arc::new(Scanner::new(config)?);
    let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

    {
        let scanner = Arc::clone(&scanner);
        let pending = Arc::clone(&pending);
        thread::spawn(move || {
            scanner.recv(|response| {
                match serde_json::to_string(&response) {
                    Ok(line) => println!("{line}"),
                    Err(err) => error!(error = %err, "could not encode response"),
                }

                let (count, signal) = &*pending;
                let mut count = count.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                *count = count.saturating_sub(1);
                signal.notify_all();
            });
        });
    }

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let (count, _) = &*pending;
                *count.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
                scanner.send(request);
            }
            // Decode failures are reported out-of-band; no response is
            // emitted for a request that never entered the engine.
            Err(err) => error!(error = %err, "could not decode request"),
        }
    }

    // Stdin is closed; drain what was accepted before exiting.
    let (count, signal) = &*pending;
    let mut count = count.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    while *count > 0 {
        count = signal.wait(count).unwrap_or_else(std::sync::PoisonError::into_inner);
    }

    Ok(ExitCode::SUCCESS)
}
