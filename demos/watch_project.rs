//! Watch a Markdown directory and print index changes as they happen.
//!
//! This program demonstrates how to:
//! - Initialize a WatchService with its state in a workspace directory
//! - Register a project and let its sync loop pick up file changes
//! - Process events in real time
//! - Query the index through the command interface
//!
//! Run it with:
//! ```bash
//! cargo run --example watch_project --features demo -- /path/to/notes [seconds]
//! ```
//!
//! Set `RUST_LOG=notebase_core=debug` for sync loop logging.

use notebase_core::{
    commands::{Op, OpResult},
    event::{Event, IndexEvent},
    query::SearchQuery,
    watch::WatchService,
};
use std::{
    env,
    path::PathBuf,
    sync::mpsc::{channel, RecvTimeoutError},
    time::{Duration, Instant},
};

fn print_event(event: &Event) {
    match event {
        Event::Index(_, IndexEvent::BatchCompleted { .. }) | Event::Ping => {}
        Event::Index(project_id, index_event) => {
            println!("  [project {project_id}] {index_event}");
        }
        Event::Status(status) => {
            println!(
                "  [status] {}: {} entities, {} pending, {} parked",
                status.project, status.entity_count, status.pending, status.parked
            );
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let Some(project_dir) = args.next().map(PathBuf::from) else {
        eprintln!("usage: watch_project <project dir> [seconds]");
        std::process::exit(2);
    };
    let run_for = Duration::from_secs(args.next().and_then(|s| s.parse().ok()).unwrap_or(60));
    let project_dir = project_dir.canonicalize()?;
    let name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "notes".to_string());

    // Index database and config.toml go to a scratch workspace.
    let workspace = env::temp_dir().join("notebase-demo");
    println!("Initializing WatchService at: {}", workspace.display());
    let (tx, rx) = channel::<Event>();
    let service = WatchService::new(workspace, tx)?;

    let project = service.add_project(&name, &project_dir)?;
    println!("Watching project '{}' at {}", project.name, project.path);
    println!("Edit, add, move or delete Markdown files to see events.\n");

    let started = Instant::now();
    while started.elapsed() < run_for {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                println!("Event channel disconnected");
                break;
            }
        }
    }

    println!("\n=== Summary ===");
    if let OpResult::Stats(stats) = service.handle(Op::ProjectStats(name.clone()))? {
        println!(
            "{} entities, {} observations, {} relations ({} pending)",
            stats.entity_count,
            stats.observation_count,
            stats.relation_count,
            stats.pending_relations
        );
        for (permalink, degree) in stats.most_connected.iter().take(5) {
            println!("  {permalink}: {degree} connections");
        }
    }
    if let Some(term) = env::var("NOTEBASE_DEMO_SEARCH").ok().filter(|t| !t.is_empty()) {
        if let OpResult::Page(page) =
            service.handle(Op::Search(name.clone(), SearchQuery::text(&term).into()))?
        {
            println!("\nSearch '{term}': {} matches", page.count);
            for hit in page.results.iter().take(10) {
                println!("  {} ({:?}): {}", hit.permalink, hit.kind, hit.snippet);
            }
        }
    }

    service.remove_project(&name)?;
    Ok(())
}
