//! A thin, non-protocol command-line front-end over [`Coordinator`].
//!
//! Every command maps 1:1 onto a `Coordinator`/`SyncClient` call; this
//! module holds no protocol logic of its own, only parsing and printing.

use crate::server::Coordinator;
use std::sync::Arc;
use sync_core::EventType;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Read commands from stdin until `quit` or EOF, driving `coordinator`.
pub async fn run(coordinator: Arc<Coordinator>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();
    loop {
        print!("> ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF (stdin closed, e.g. non-interactive run)
            Err(_) => break,
        };

        if !dispatch(&coordinator, line.trim()).await {
            break;
        }
    }
    coordinator.shutdown();
}

/// Execute one command line. Returns `false` when the REPL should exit.
async fn dispatch(coordinator: &Arc<Coordinator>, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("").to_ascii_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match command.as_str() {
        "" => {}
        "create" => create(coordinator, rest),
        "update" => update(coordinator, rest),
        "delete" => delete(coordinator, rest),
        "list" => list(coordinator),
        "peers" => peers(coordinator),
        "sync" => sync(coordinator, rest).await,
        "quit" | "exit" => {
            coordinator.quit();
            return false;
        }
        "help" => print_help(),
        other => println!("unknown command: {other} (try `help`)"),
    }
    true
}

fn create(coordinator: &Arc<Coordinator>, content: &str) {
    let subject_id = uuid::Uuid::new_v4().to_string();
    match coordinator.create_local_event(EventType::Create, &subject_id, content) {
        Ok(event) => println!("created {subject_id} (hash {})", event.hash),
        Err(e) => println!("\u{274c} create failed: {e}"),
    }
}

fn update(coordinator: &Arc<Coordinator>, rest: &str) {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let (Some(subject_id), Some(content)) = (parts.next(), parts.next()) else {
        println!("usage: update <subject> <content>");
        return;
    };
    match coordinator.create_local_event(EventType::Update, subject_id, content) {
        Ok(event) => println!("updated {subject_id} (hash {})", event.hash),
        Err(e) => println!("\u{274c} update failed: {e}"),
    }
}

fn delete(coordinator: &Arc<Coordinator>, subject_id: &str) {
    if subject_id.is_empty() {
        println!("usage: delete <subject>");
        return;
    }
    match coordinator.create_local_event(EventType::Delete, subject_id, "") {
        Ok(_) => println!("deleted {subject_id}"),
        Err(e) => println!("\u{274c} delete failed: {e}"),
    }
}

fn list(coordinator: &Arc<Coordinator>) {
    let view = coordinator.project();
    if view.is_empty() {
        println!("(empty)");
        return;
    }
    for (subject_id, projected) in view {
        println!("{subject_id}: {} (t={})", projected.content, projected.timestamp);
    }
}

fn peers(coordinator: &Arc<Coordinator>) {
    let peers = coordinator.peers();
    if peers.is_empty() {
        println!("(no peers)");
        return;
    }
    for peer in peers {
        println!("{} @ {} ({})", peer.device_name, peer.base_url(), peer.device_id);
    }
}

async fn sync(coordinator: &Arc<Coordinator>, target: &str) {
    if target.eq_ignore_ascii_case("all") {
        let results = coordinator.sync_with_all().await;
        if results.is_empty() {
            println!("(no peers)");
            return;
        }
        for (peer, outcome) in results {
            print_sync_outcome(&peer.device_name, outcome);
        }
        return;
    }

    let outcome = coordinator.sync_with(target).await;
    print_sync_outcome(target, outcome);
}

fn print_sync_outcome(device_name: &str, outcome: Result<crate::client::SyncSummary, crate::client::SyncClientError>) {
    match outcome {
        Ok(summary) => println!("synced with {device_name}: pulled {} pushed {}", summary.pulled, summary.pushed),
        Err(e) => println!("\u{274c} sync with {device_name} failed: {e}"),
    }
}

fn print_help() {
    println!("commands: create <content> | update <subject> <content> | delete <subject> | list | peers | sync <name> | sync all | quit");
}
