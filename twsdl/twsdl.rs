// twsdl/twsdl.rs
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};

use twsdl::clock::SystemClock;
use twsdl::conn::SocketClient;
use twsdl::job_file::{load_work, JobReader, XmlSink};
use twsdl::todo::WorkTodo;
use twsdl::{Config, TwsDl, ViolationPolicy};

/// Run a batch of TWS requests and write the answers to stdout
#[derive(Parser, Debug)]
#[clap(author, version, about = "Batch downloader for the TWS API")]
struct CliArgs {
  /// Job file with request documents, `-` for stdin
  #[arg()]
  jobs: Option<String>,

  /// JSON config file; flags below override it
  #[arg(long)]
  config: Option<PathBuf>,

  /// TWS or gateway host
  #[arg(long)]
  host: Option<String>,

  #[arg(long)]
  port: Option<u16>,

  /// API client id
  #[arg(long)]
  id: Option<i32>,

  /// Historical requests allowed per pacing window
  #[arg(long)]
  max_requests: Option<usize>,

  /// Pacing window in ms
  #[arg(long)]
  pacing_interval: Option<i64>,

  /// Minimum spacing between historical requests in ms
  #[arg(long)]
  min_pacing_time: Option<i64>,

  /// Pause after a pacing violation in ms
  #[arg(long)]
  violation_pause: Option<i64>,

  /// Request timeout in ms
  #[arg(long)]
  req_timeout: Option<i64>,

  /// Minimum time between connection attempts in ms
  #[arg(long)]
  con_timeout: Option<i64>,

  /// Download account values and portfolio
  #[arg(long)]
  accounts: bool,

  /// Account code for --accounts
  #[arg(long)]
  account: Option<String>,

  /// Download today's executions
  #[arg(long)]
  executions: bool,

  /// Download open orders
  #[arg(long)]
  orders: bool,

  /// Stop on responses that do not match any request
  #[arg(long)]
  strict: bool,
}

fn build_config(args: &CliArgs) -> Result<Config> {
  let mut cfg = match &args.config {
    Some(path) => Config::from_json_file(path)?,
    None => Config::default(),
  };
  if let Some(h) = &args.host {
    cfg.tws_host = h.clone();
  }
  if let Some(p) = args.port {
    cfg.tws_port = p;
  }
  if let Some(id) = args.id {
    cfg.tws_client_id = id;
  }
  if let Some(n) = args.max_requests {
    cfg.tws_max_requests = n;
  }
  if let Some(ms) = args.pacing_interval {
    cfg.tws_pacing_interval = ms;
  }
  if let Some(ms) = args.min_pacing_time {
    cfg.tws_min_pacing_time = ms;
  }
  if let Some(ms) = args.violation_pause {
    cfg.tws_violation_pause = ms;
  }
  if let Some(ms) = args.req_timeout {
    cfg.tws_req_timeout = ms;
  }
  if let Some(ms) = args.con_timeout {
    cfg.tws_con_timeout = ms;
  }
  if let Some(a) = &args.account {
    cfg.account_name = a.clone();
  }
  cfg.get_account |= args.accounts;
  cfg.get_executions |= args.executions;
  cfg.get_orders |= args.orders;
  if args.strict {
    cfg.violation_policy = ViolationPolicy::Abort;
  }
  cfg.validate()?;
  Ok(cfg)
}

fn read_jobs(path: Option<&str>) -> Result<WorkTodo> {
  let mut work = WorkTodo::new();
  let input: Box<dyn BufRead> = match path {
    None => return Ok(work),
    Some("-") => Box::new(BufReader::new(io::stdin())),
    Some(p) => Box::new(BufReader::new(File::open(p).with_context(|| format!("opening job file {}", p))?)),
  };
  let mut reader = JobReader::new(input);
  let n = load_work(&mut reader, &mut work).context("reading job file")?;
  info!("{} requests to do, {} already answered", n, reader.answered());
  Ok(work)
}

fn run(cfg: Config, work: WorkTodo) -> Result<u8> {
  let mut dl = TwsDl::new(cfg, SocketClient::new(), SystemClock, work);
  let stdout = io::stdout();
  let mut sink = XmlSink::new(stdout.lock());
  let summary = dl.run(&mut sink).context("download failed")?;
  Ok(summary.exit_code())
}

fn main() -> ExitCode {
  env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
  let args = CliArgs::parse();

  let setup = build_config(&args).and_then(|cfg| Ok((cfg, read_jobs(args.jobs.as_deref())?)));
  let (cfg, work) = match setup {
    Ok(v) => v,
    Err(e) => {
      error!("{:#}", e);
      return ExitCode::from(2);
    }
  };
  match run(cfg, work) {
    Ok(code) => ExitCode::from(code),
    Err(e) => {
      error!("{:#}", e);
      ExitCode::from(1)
    }
  }
}
