//! Minimal terminal front end over the coaching engine.
//!
//! One local user, one conversation thread. Lifecycle actions on the most
//! recent proposal are driven by slash commands.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use coach::db::CoachDb;
use coach::{CoachConfig, CoachEngine, CoachError, HandlerKind, HttpModelProvider};

const USER_ID: &str = "local";
const THREAD_ID: &str = "main";

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = CoachConfig::load();
    let db = match open_db(&config) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("Could not open the database: {e}");
            std::process::exit(1);
        }
    };
    let provider = Arc::new(HttpModelProvider::new(
        &config.base_url,
        &config.api_key,
        &config.model,
        config.timeout_secs,
    ));
    let engine = CoachEngine::new(db, provider);

    println!("coach: type a message, or /help for commands.");
    let stdin = io::stdin();
    let mut last_proposal_key: Option<String> = None;

    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match run_command(&engine, command, &mut last_proposal_key) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => println!("{}", e.user_message()),
            }
            continue;
        }

        let (explicit, message) = parse_handler_prefix(line);
        match engine
            .handle_message(USER_ID, THREAD_ID, message, explicit)
            .await
        {
            Ok(outcome) => {
                println!("{}", outcome.text);
                if let Some(key) = outcome.proposal_key {
                    println!("  [proposal {key}: /accept, /apply, /discard]");
                    last_proposal_key = Some(key);
                }
                for logged in &outcome.extraction.logged {
                    println!("  [logged {} for {}]", logged.habit_id, logged.date);
                }
            }
            Err(e) => {
                println!("{}", e.user_message());
                if e.is_retryable() {
                    println!("  (you can send that again)");
                }
            }
        }
    }
}

fn open_db(config: &CoachConfig) -> Result<CoachDb, coach::db::DbError> {
    match &config.db_path {
        Some(path) => CoachDb::open_at(path),
        None => CoachDb::open(),
    }
}

/// `@suggest_goals what should I aim for` forces a handler; anything else
/// goes through normal routing.
fn parse_handler_prefix(line: &str) -> (Option<HandlerKind>, &str) {
    let Some(rest) = line.strip_prefix('@') else {
        return (None, line);
    };
    let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
    match HandlerKind::parse(name) {
        Some(kind) => (Some(kind), message.trim_start()),
        None => (None, line),
    }
}

fn run_command(
    engine: &CoachEngine,
    command: &str,
    last_proposal_key: &mut Option<String>,
) -> Result<bool, CoachError> {
    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    let key = |explicit: &str| -> Option<String> {
        if explicit.is_empty() {
            last_proposal_key.clone()
        } else {
            Some(explicit.to_string())
        }
    };

    match name {
        "quit" | "exit" => return Ok(true),
        "help" => {
            println!(
                "  @<handler> <msg>   force a handler (suggest_goals, review_progress,\n\
                 \x20                    prioritize_optimize, surprise_me)\n\
                 \x20 /accept [key]     accept the last (or named) proposal\n\
                 \x20 /apply [key]      apply an accepted proposal\n\
                 \x20 /discard [key]    discard a proposal\n\
                 \x20 /done <habit_id>  log today's completion for a habit\n\
                 \x20 /quit             exit"
            );
        }
        "accept" => match key(arg) {
            Some(k) => {
                engine.accept_proposal(THREAD_ID, &k)?;
                println!("  accepted {k}");
            }
            None => println!("  no proposal to accept"),
        },
        "apply" => match key(arg) {
            Some(k) => {
                let result = engine.apply_proposal(USER_ID, THREAD_ID, &k)?;
                println!(
                    "  applied {k}: {} goal(s), {} habit(s)",
                    result.created_goal_ids.len(),
                    result.created_habit_ids.len()
                );
                if result.focus_overflow {
                    println!("  your focus set is over capacity; consider re-prioritizing");
                }
            }
            None => println!("  no proposal to apply"),
        },
        "discard" => match key(arg) {
            Some(k) => {
                engine.discard_proposal(THREAD_ID, &k)?;
                println!("  discarded {k}");
            }
            None => println!("  no proposal to discard"),
        },
        "done" => {
            if arg.is_empty() {
                println!("  usage: /done <habit_id>");
            } else {
                let today = chrono::Utc::now().date_naive();
                let outcome = engine.log_completion(USER_ID, arg, today)?;
                println!("  logged {} for {}", arg, outcome.record.completed_on);
            }
        }
        other => println!("  unknown command: /{other}"),
    }
    Ok(false)
}
