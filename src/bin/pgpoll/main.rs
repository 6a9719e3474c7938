mod args;

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use pgpoll::{ConnHandle, Driver, PgPollError};

use crate::args::{Args, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Status {
    Ok,
    Null,
    NoResult,
    Error,
    Timeout,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    query: &'a str,
    status: Status,
    result: Option<String>,
    polls: u64,
    elapsed_ms: u128,
}

struct Job {
    query: String,
    handle: Option<ConnHandle>,
    started: Option<Instant>,
    polls: u64,
    done: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("PGPOLL_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "pgpoll failed");
            ExitCode::from(2)
        }
    }
}

/// Multiplex every query over the pool. `Ok(false)` if any of them failed.
fn run(args: &Args) -> Result<bool, PgPollError> {
    let mut driver = Driver::init(&args.driver_config())?;
    let mut jobs: Vec<Job> = args
        .queries
        .iter()
        .map(|query| Job {
            query: query.clone(),
            handle: None,
            started: None,
            polls: 0,
            done: false,
        })
        .collect();

    let mut all_ok = true;
    while jobs.iter().any(|job| !job.done) {
        for job in jobs.iter_mut().filter(|job| !job.done) {
            if job.handle.is_none() {
                // pool exhausted: retry on the next tick
                let Some(handle) = driver.create() else {
                    continue;
                };
                driver.query(&handle, job.query.as_str())?;
                job.handle = Some(handle);
                job.started = Some(Instant::now());
            }
            all_ok &= step(&mut driver, job, args)?;
        }
        if !args.tick.is_zero() {
            std::thread::sleep(args.tick);
        }
    }

    driver.shutdown();
    Ok(all_ok)
}

/// Poll one job once. Returns `false` if it finished badly.
fn step(driver: &mut Driver, job: &mut Job, args: &Args) -> Result<bool, PgPollError> {
    let Some(handle) = job.handle.as_ref() else {
        return Ok(true);
    };
    let elapsed = job.started.map_or(Duration::ZERO, |t| t.elapsed());

    job.polls += 1;
    let status = if driver.poll(handle)?.is_ready() {
        if driver.is_error(handle)? {
            Status::Error
        } else if driver.result(handle)?.is_none() {
            Status::NoResult
        } else if driver.is_null(handle)? {
            Status::Null
        } else {
            Status::Ok
        }
    } else if elapsed >= args.timeout {
        Status::Timeout
    } else {
        return Ok(true);
    };

    let result = match status {
        Status::Timeout => None,
        _ => driver.result(handle)?.map(str::to_owned),
    };
    print_report(
        &Report {
            query: &job.query,
            status,
            result,
            polls: job.polls,
            elapsed_ms: elapsed.as_millis(),
        },
        args.format,
    )?;

    if let Some(handle) = job.handle.take() {
        driver.free(handle)?;
    }
    job.done = true;
    Ok(!matches!(status, Status::Error | Status::Timeout))
}

fn print_report(report: &Report<'_>, format: OutputFormat) -> Result<(), PgPollError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Text => {
            let result = report.result.as_deref().unwrap_or("");
            println!(
                "{:?}\t{}ms\t{}\t{}",
                report.status,
                report.elapsed_ms,
                report.query,
                result.trim_end()
            );
        }
    }
    Ok(())
}
