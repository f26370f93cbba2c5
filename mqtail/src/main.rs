//! mqtail daemon entry point
//!
//! Tails a transaction log (a file or stdin), assembles records from
//! interleaved fragments and forwards them through the pipeline to the
//! configured backend.
//!
//! Input is line-oriented. Each line starts with a decimal transaction
//! ID; a tab-separated remainder is either `key=...` setting the shard
//! key or a payload fragment appended to the record. A bare ID line
//! completes the record and submits it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use clap::Parser;

use mqtail_core::{
    Assembler, Entry, FileBackend, MqtailError, MqtailResult, Pipeline, RelayConfig,
};

/// How many input lines between pipeline health checks and producer
/// flushes while the reader is busy
const TICK_LINES: u64 = 1000;

/// How long the input may stay quiet before a health check and flush
/// run anyway, so a blocked read cannot delay worker restarts
const IDLE_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "mqtail")]
#[command(about = "mqtail - transaction log to message queue relay")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Check the configuration and exit
    #[arg(short = 'C', long = "check-config")]
    check_config: bool,

    /// Input log file (defaults to stdin)
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Increase log verbosity (show debug messages)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn load_config(cli: &Cli) -> MqtailResult<RelayConfig> {
    let config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };
    if cli.check_config {
        log::info!("Configuration OK");
        return ExitCode::SUCCESS;
    }

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &RelayConfig) -> MqtailResult<()> {
    log::info!("mqtail starting");
    config.dump();

    let backend = Arc::new(FileBackend::new(&config.output_file, config.partitions));
    let (mut pipeline, mut asm) = Pipeline::start(config, backend)?;

    let input: Box<dyn BufRead + Send> = match &cli.input {
        Some(path) => {
            log::info!("Reading from {}", path.display());
            Box::new(BufReader::new(File::open(path)?))
        }
        None => {
            log::info!("Reading from stdin");
            Box::new(BufReader::new(io::stdin()))
        }
    };

    let result = read_loop(input, &mut pipeline, &mut asm);
    pipeline.shutdown(asm);
    result
}

/// Drive the assembler from the input, checking pipeline health every
/// [`TICK_LINES`] lines and, independently, every [`IDLE_TICK`] of
/// quiet input. Lines come in through a channel from a dedicated input
/// thread, so a blocking read never starves the health checks.
fn read_loop(
    input: Box<dyn BufRead + Send>,
    pipeline: &mut Pipeline,
    asm: &mut Assembler,
) -> MqtailResult<()> {
    let (line_tx, line_rx) = mpsc::channel::<io::Result<String>>();
    let input_thread = thread::Builder::new()
        .name("mqtail-input".into())
        .spawn(move || {
            for line in input.lines() {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| MqtailError::Spawn(format!("input reader: {}", e)))?;

    let mut open: HashMap<u32, Entry> = HashMap::new();
    let mut lines: u64 = 0;

    loop {
        match line_rx.recv_timeout(IDLE_TICK) {
            Ok(Ok(line)) => {
                handle_line(asm, &mut open, &line);

                lines += 1;
                if lines % TICK_LINES == 0 {
                    asm.flush();
                    pipeline.tick()?;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // the input is quiet; flush and restart dead workers now
                // rather than after the next burst of lines
                asm.flush();
                pipeline.tick()?;
            }
            // input thread done, end of input
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    if input_thread.join().is_err() {
        log::error!("Input thread panicked");
    }

    // records still open at end of input go out marked incomplete
    if !open.is_empty() {
        log::warn!("End of input with {} open records", open.len());
        for (_, mut entry) in open.drain() {
            entry.mark_incomplete();
            asm.submit(entry);
        }
    }
    asm.flush();
    pipeline.tick()
}

/// Apply one input line to the open-record table.
fn handle_line(asm: &mut Assembler, open: &mut HashMap<u32, Entry>, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }

    let (xid_str, rest) = match line.split_once('\t') {
        Some((xid, rest)) => (xid, Some(rest)),
        None => (line, None),
    };
    let xid: u32 = match xid_str.parse() {
        Ok(xid) => xid,
        Err(_) => {
            log::warn!("Unparseable transaction ID, line skipped: [{}]", line);
            return;
        }
    };

    match rest {
        // bare ID line: the record is complete
        None => match open.remove(&xid) {
            Some(entry) => asm.submit(entry),
            None => log::debug!("XID={}: end of unknown record ignored", xid),
        },
        Some(fragment) => {
            let mut entry = match open.remove(&xid) {
                Some(entry) => entry,
                None => match asm.open_record(xid) {
                    Some(entry) => entry,
                    // pool exhausted; the record was counted and dropped
                    None => return,
                },
            };
            let result = match fragment.strip_prefix("key=") {
                Some(key) => asm.set_key(&mut entry, key.as_bytes()),
                None => asm.append(&mut entry, fragment.as_bytes()),
            };
            match result {
                Ok(()) => {
                    open.insert(xid, entry);
                }
                Err(mqtail_core::AppendError::NoFreeChunks) => {
                    // cannot grow this record any further
                    asm.discard(entry);
                }
                Err(_) => {
                    // oversized fragment or key; keep what we have
                    open.insert(xid, entry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_pipeline(dir: &tempfile::TempDir) -> (RelayConfig, Pipeline, Assembler) {
        let config = RelayConfig {
            nworkers: 1,
            max_records: 16,
            chunk_size: 64,
            max_reclen: 256,
            max_keylen: 32,
            qlen_goal: 4,
            monitor_interval_ms: 0,
            output_file: dir.path().join("out"),
            ..Default::default()
        };
        let backend = Arc::new(FileBackend::new(&config.output_file, config.partitions));
        let (pipeline, asm) = Pipeline::start(&config, backend).unwrap();
        (config, pipeline, asm)
    }

    fn drain_and_read(config: &RelayConfig, pipeline: Pipeline, asm: Assembler) -> String {
        pipeline.shutdown(asm);
        std::fs::read_to_string(&config.output_file).unwrap()
    }

    #[test]
    fn test_interleaved_fragments_assemble_per_xid() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut pipeline, mut asm) = test_pipeline(&dir);
        let mut open = HashMap::new();

        handle_line(&mut asm, &mut open, "1\tfirst=a");
        handle_line(&mut asm, &mut open, "2\tother=x");
        handle_line(&mut asm, &mut open, "1\tsecond=b");
        handle_line(&mut asm, &mut open, "1");
        handle_line(&mut asm, &mut open, "2");
        asm.flush();
        pipeline.tick().unwrap();

        let out = drain_and_read(&config, pipeline, asm);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines.contains(&"&first=a&second=b"));
        assert!(lines.contains(&"&other=x"));
    }

    #[test]
    fn test_key_line_sets_shard_key() {
        let dir = tempfile::tempdir().unwrap();
        let (config, pipeline, mut asm) = test_pipeline(&dir);
        let mut open = HashMap::new();

        handle_line(&mut asm, &mut open, "7\tkey=cafe0001");
        handle_line(&mut asm, &mut open, "7\tdata=1");
        handle_line(&mut asm, &mut open, "7");

        let out = drain_and_read(&config, pipeline, asm);
        assert_eq!(out, "cafe0001\t&data=1\n");
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (config, pipeline, mut asm) = test_pipeline(&dir);
        let mut open = HashMap::new();

        handle_line(&mut asm, &mut open, "not-a-number\tdata");
        handle_line(&mut asm, &mut open, "");
        handle_line(&mut asm, &mut open, "3\tok=1");
        handle_line(&mut asm, &mut open, "3");

        let out = drain_and_read(&config, pipeline, asm);
        assert_eq!(out, "&ok=1\n");
    }

    #[test]
    fn test_end_of_unknown_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (config, pipeline, mut asm) = test_pipeline(&dir);
        let mut open = HashMap::new();

        handle_line(&mut asm, &mut open, "99");
        assert!(open.is_empty());

        let out = drain_and_read(&config, pipeline, asm);
        assert_eq!(out, "");
    }

    #[test]
    fn test_completed_record_no_longer_open() {
        let dir = tempfile::tempdir().unwrap();
        let (_config, pipeline, mut asm) = test_pipeline(&dir);
        let mut open = HashMap::new();

        handle_line(&mut asm, &mut open, "5\tdata=x");
        assert_eq!(open.len(), 1);
        handle_line(&mut asm, &mut open, "5");
        assert!(open.is_empty());

        // give the worker a moment, then shut down
        std::thread::sleep(Duration::from_millis(10));
        pipeline.shutdown(asm);
    }

    /// Yields its buffered lines, then stalls before reporting end of
    /// input, like a tailed log that has gone quiet.
    struct StallingReader {
        data: io::Cursor<Vec<u8>>,
        stall: Duration,
        stalled: bool,
    }

    impl io::Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = io::Read::read(&mut self.data, buf)?;
            if n == 0 && !self.stalled {
                self.stalled = true;
                thread::sleep(self.stall);
            }
            Ok(n)
        }
    }

    #[test]
    fn test_quiet_input_does_not_strand_records() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut pipeline, mut asm) = test_pipeline(&dir);
        let out_path = config.output_file.clone();

        let reader = thread::spawn(move || {
            let stalling = StallingReader {
                data: io::Cursor::new(b"8\tdata=z\n8\n".to_vec()),
                stall: Duration::from_millis(800),
                stalled: false,
            };
            let input: Box<dyn BufRead + Send> = Box::new(BufReader::new(stalling));
            read_loop(input, &mut pipeline, &mut asm).unwrap();
            pipeline.shutdown(asm);
        });

        // the record must reach the backend while the input is still
        // stalled, well before end of input and shutdown
        let deadline = std::time::Instant::now() + Duration::from_millis(400);
        let mut delivered = false;
        while std::time::Instant::now() < deadline {
            let out = std::fs::read_to_string(&out_path).unwrap_or_default();
            if out.contains("&data=z") {
                delivered = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(delivered, "record not delivered while the input was quiet");
        reader.join().unwrap();
    }
}
