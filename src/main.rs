use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use streamfan::cli::Args;
use streamfan::config::Config;
use streamfan::notifier::ChannelHub;
use streamfan::store::ResultStore;
use streamfan::{GenerationCoordinator, ProgressFn, RunState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(msg) = args.validate() {
        eprintln!("{}", msg.bright_red());
        std::process::exit(2);
    }

    let mut config = Config::load(args.config.as_deref());
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(store_path) = &args.store {
        config.store_path = store_path.clone();
    }

    let store = match ResultStore::open(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!(
                "{} {}",
                "could not open snapshot store:".bright_red(),
                err
            );
            std::process::exit(1);
        }
    };
    let hub = ChannelHub::new();
    let channel = config.channel.clone();
    let endpoint = config.endpoint.clone();
    let coordinator = GenerationCoordinator::new(config, Arc::clone(&store), hub.clone());

    if args.watch {
        let mut rx = hub.subscribe(&channel);
        tokio::spawn(async move {
            while let Ok(message) = rx.recv().await {
                let line = serde_json::to_string(&message).unwrap_or_default();
                eprintln!("{} {}", "[channel]".bright_magenta(), line);
            }
        });
    }

    println!("{}", "STREAMFAN".bright_cyan().bold());
    println!("{}: {}", "Backend".bright_yellow(), endpoint);
    println!("{}: {}", "Streams".bright_yellow(), args.streams);
    if args.resume {
        println!("{}", "Resuming from persisted snapshot".bright_green());
    }
    println!("{}", "=".repeat(50).bright_blue());

    // Echo each stream's newly arrived text, labelled by index.
    let mut printed = vec![0usize; args.streams.max(1)];
    let on_progress: ProgressFn = Box::new(move |update| {
        if update.index >= printed.len() {
            printed.resize(update.index + 1, 0);
        }
        let fresh = &update.content[printed[update.index]..];
        printed[update.index] = update.content.len();
        if !fresh.is_empty() {
            println!("{} {}", format!("[{}]", update.index).bright_cyan(), fresh);
        }
        if update.complete {
            println!(
                "{}",
                format!(
                    "[{}] complete — {} tok/s, {} total",
                    update.index, update.tokens_per_sec, update.total_tokens
                )
                .bright_green()
            );
        }
        let _ = io::stdout().flush();
    });

    if args.resume {
        let snapshot = store.load();
        if snapshot.is_empty() {
            eprintln!("{}", "nothing to resume: snapshot is empty".bright_red());
            std::process::exit(1);
        }
        let contents: Vec<String> = snapshot
            .streams
            .iter()
            .map(|s| s.content.clone())
            .collect();
        coordinator.continue_generation(&contents, on_progress);
    } else {
        let prompt = args.prompt.as_deref().unwrap_or_default();
        coordinator.start_generation(prompt, args.streams, args.max_tokens, on_progress);
    }

    let state = tokio::select! {
        state = coordinator.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "stopping...".bright_yellow());
            coordinator.cancel();
            coordinator.wait().await
        }
    };

    println!("{}", "=".repeat(50).bright_blue());
    let final_set = store.load();
    for stream in &final_set.streams {
        println!();
        println!(
            "{}",
            format!("--- stream {} ---", stream.id).bright_white().bold()
        );
        println!("{}", stream.content);
    }

    match state {
        RunState::Completed => println!("{}", "Complete.".bright_green()),
        RunState::Cancelled => println!("{}", "Stopped; partial content kept.".bright_yellow()),
        RunState::Failed => {
            eprintln!("{}", "Generation failed; partial content kept.".bright_red());
            std::process::exit(1);
        }
        RunState::Idle | RunState::Running => {}
    }
}
