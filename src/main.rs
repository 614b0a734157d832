use clap::Parser;
use sizeguard::config::{load_config, SizeguardConfig};
use sizeguard::registry::LifecycleController;
use sizeguard::report::RunOutcome;
use sizeguard::runner::{run_job, RunRequest};
use sizeguard::scheduler::Scheduler;
use sizeguard::sentinel::LogFilter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Exit status used when a job was aborted for exceeding a limit.
const EXIT_ABORTED: i32 = 3;

/// Run a command and abort it if its log or workspace grows past a limit.
#[derive(Parser, Debug)]
#[command(name = "sizeguard", version, about)]
pub struct Cli {
    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "sizeguard.toml")]
    config: PathBuf,

    /// Log file for the job's output (overrides config)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Working directory for the job (overrides config)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Write a JSON run report here (overrides config)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Force resource monitoring on
    #[arg(long)]
    enable: bool,

    /// Log size limit in bytes, 0 disables (overrides config)
    #[arg(long)]
    max_log_bytes: Option<u64>,

    /// Workspace size limit in bytes, 0 disables (overrides config)
    #[arg(long)]
    max_workspace_bytes: Option<u64>,

    /// Seconds between checks (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Output limit for this run only, in megabytes
    #[arg(long)]
    limit_mb: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (monitor ticks, limit decisions)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut SizeguardConfig) {
        if let Some(log) = &self.log {
            config.job.log_file = log.clone();
        }
        if let Some(ws) = &self.workspace {
            config.job.workspace = ws.clone();
        }
        if let Some(report) = &self.report {
            config.job.report_file = Some(report.clone());
        }
        if self.enable {
            config.monitor.enabled = true;
        }
        if let Some(n) = self.max_log_bytes {
            config.monitor.max_log_bytes = n;
        }
        if let Some(n) = self.max_workspace_bytes {
            config.monitor.max_workspace_bytes = n;
        }
        if let Some(secs) = self.interval {
            config.monitor.check_interval_secs = secs;
        }
    }
}

fn print_settings(config: &SizeguardConfig, cli: &Cli) {
    let m = &config.monitor;
    println!("sizeguard v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file:        {}", cli.config.display());
    println!("Command:            {}", cli.command.join(" "));
    println!("Monitoring:         {}", if m.enabled { "enabled" } else { "disabled" });
    println!("Max log bytes:      {}", m.max_log_bytes);
    println!("Max workspace bytes: {}", m.max_workspace_bytes);
    println!("Check interval:     {}s", m.check_interval_secs);
    match cli.limit_mb {
        Some(mb) => println!("Output limit:       {mb} MB"),
        None => println!("Output limit:       none"),
    }
    println!("Log file:           {}", config.job.log_file.display());
    println!("Workspace:          {}", config.job.workspace.display());
    println!("Kill grace:         {}s", config.job.kill_grace_secs);
    match &config.job.report_file {
        Some(p) => println!("Report file:        {}", p.display()),
        None => println!("Report file:        none"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sizeguard=debug"
    } else {
        "sizeguard=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut config);

    if cli.dry_run {
        print_settings(&config, &cli);
        println!("Dry run mode: config validated, not running.");
        return;
    }

    // `required = true` guarantees at least one element.
    let Some((command, args)) = cli.command.split_first() else {
        std::process::exit(1);
    };

    let scheduler = Scheduler::new(Handle::current(), config.scheduler.max_concurrent_ticks);
    let controller = LifecycleController::new(Arc::new(config.monitor.clone()), scheduler);

    let request = RunRequest {
        job_id: None,
        command: command.clone(),
        args: args.to_vec(),
        log_file: config.job.log_file.clone(),
        workspace: config.job.workspace.clone(),
        report_file: config.job.report_file.clone(),
        output_limit: cli.limit_mb.map(LogFilter::explicit_megabytes),
        kill_grace: Duration::from_secs(config.job.kill_grace_secs),
    };

    let report = match run_job(&controller, &request).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    eprintln!(
        "sizeguard: {} {:?} in {}s ({} log bytes{})",
        report.job_id,
        report.outcome,
        report.duration().num_seconds(),
        report.log_bytes,
        report
            .workspace_bytes
            .map(|b| format!(", {b} workspace bytes"))
            .unwrap_or_default()
    );
    if let Some(cause) = &report.abort_cause {
        eprintln!("sizeguard: aborted: {cause}");
    }

    let code = match report.outcome {
        RunOutcome::Aborted => EXIT_ABORTED,
        _ => report.exit_code.unwrap_or(1),
    };
    std::process::exit(code);
}
