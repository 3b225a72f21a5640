//! CLI entry point: loads configuration, wires the watcher/parser/writer
//! threads together, and waits for a clean or fatal shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser as ClapParser;

use log2pg::config::Config;
use log2pg::queue::MessageQueue;
use log2pg::row::RowTuple;
use log2pg::signals::is_terminating;
use log2pg::watched::{build_watch_plan, FileItem};
use log2pg::watcher::{FileTag, Watcher};
use log2pg::Result;

/// Row-queue capacity.
const ROW_QUEUE_CAPACITY: usize = 32_000;

#[derive(ClapParser, Debug)]
#[command(name = "log2pg", version, about = "Tails log files and streams parsed records into PostgreSQL")]
struct Cli {
    /// Detach from the controlling terminal after the configuration loads.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Configuration file path.
    #[arg(short = 'f', long = "file", default_value = "/etc/log2pg.conf")]
    config: PathBuf,

    /// Open existing files at byte 0 rather than at end.
    #[arg(short = 's', long = "seek0")]
    seek0: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!(target: "log2pg", "fatal: {err}");
            eprintln!("log2pg: fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    if cli.daemon {
        daemonize();
    }

    let dir_configs = build_watch_plan(&config)?;

    let watcher_queue = Arc::new(MessageQueue::<Arc<FileItem>, FileTag>::new(0));
    let row_queue = Arc::new(MessageQueue::<Arc<RowTuple>, ()>::new(ROW_QUEUE_CAPACITY));

    let mut writer = log2pg::writer::Writer::new(&config.database, config.tables.clone(), row_queue.clone());
    writer.connect()?;

    let writer_handle = thread::Builder::new()
        .name("log2pg-writer".to_string())
        .spawn(move || writer.run())
        .expect("failed to spawn writer thread");

    let parser = log2pg::parser::Parser::new(watcher_queue.clone(), row_queue.clone());
    let parser_handle = thread::Builder::new()
        .name("log2pg-parser".to_string())
        .spawn(move || parser.run())
        .expect("failed to spawn parser thread");

    let mut watcher = Watcher::new(dir_configs, watcher_queue.clone(), cli.seek0)?;
    let watcher_result = watcher.run();

    let parser_result = parser_handle.join().expect("parser thread panicked");
    let writer_result = writer_handle.join().expect("writer thread panicked");

    watcher_result?;
    parser_result?;
    writer_result?;

    if is_terminating() {
        log::info!(target: "log2pg", "shutdown complete");
    }
    Ok(())
}

/// Detaches stdio and returns control to the shell while remaining a
/// normal foreground-spawned child; no portable stdlib double-fork, so
/// this stops short of full daemonization.
fn daemonize() {
    unsafe {
        libc::close(0);
        libc::close(1);
        libc::close(2);
    }
}
