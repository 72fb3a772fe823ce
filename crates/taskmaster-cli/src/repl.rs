//! Interactive REPL attached to stdin/stdout, used whenever the daemon
//! is not started with `-d/--daemon`.

use crate::commands::{dispatch, CommandContext};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(ctx: CommandContext) {
    println!("{}", "taskmaster REPL — type `help` for commands".dimmed());

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("{}", "> ".dimmed());
        use std::io::Write;
        let _ = std::io::stdout().flush();

        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                println!("shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed == "exit" || trimmed == "quit" {
                            break;
                        }
                        if trimmed.is_empty() {
                            continue;
                        }
                        for response in dispatch(trimmed, &ctx).await {
                            println!("{response}");
                        }
                        if ctx.shutdown.is_cancelled() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }
}
