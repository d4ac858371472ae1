use clap::{Parser, Subcommand};
use esb_meter::config::{
    delete_password, ensure_initialized, get_password, has_password, load_config, save_config,
    set_password, MeterSettings,
};
use esb_meter::error::AppError;
use esb_meter::models::UsageWindow;
use esb_meter::service::{select_meter, MeterReport, MeterService};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "esb-meter")]
#[command(about = "ESB Networks smart meter usage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    AddMeter {
        mprn: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    RemoveMeter {
        mprn: String,
    },
    Meters,
    Fetch {
        #[arg(long)]
        mprn: Option<String>,
        #[arg(long, default_value = "table")]
        format: String,
    },
    Watch {
        #[arg(long)]
        mprn: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
}

fn validate_format(input: &str) -> Result<OutputFormat, AppError> {
    if input.eq_ignore_ascii_case("table") {
        Ok(OutputFormat::Table)
    } else if input.eq_ignore_ascii_case("json") {
        Ok(OutputFormat::Json)
    } else {
        Err(AppError::Config(
            "Unsupported format. Use table or json.".into(),
        ))
    }
}

fn render_table(report: &MeterReport) -> String {
    let mut out = format!("MPRN {}\n", report.mprn);
    for window in UsageWindow::ALL {
        out.push_str(&format!(
            "{:<15} {:>10.3} kWh\n",
            window.as_label(),
            report.totals.get(window)
        ));
    }
    let latest = report
        .latest_reading
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "none".into());
    out.push_str(&format!(
        "{} readings, latest {}",
        report.readings, latest
    ));
    out
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn watch(service: &MeterService, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);

    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => poll_once(service).await,
        }
    }
}

async fn poll_once(service: &MeterService) {
    match service.report().await {
        Ok(report) => {
            let t = report.totals;
            info!(
                mprn = %report.mprn,
                today = t.today,
                last_24_hours = t.last_24_hours,
                this_week = t.this_week,
                last_7_days = t.last_7_days,
                this_month = t.this_month,
                last_30_days = t.last_30_days,
                "usage (kWh)"
            );
        }
        // The cache has already logged the failure.
        Err(_) => debug!(mprn = %service.mprn(), "no totals this tick"),
    }
}

fn password_status(meter: &MeterSettings, lookup: Result<bool, AppError>) -> &'static str {
    match lookup {
        Ok(true) => "password stored",
        Ok(false) if meter.password.is_some() => "password in config file",
        Ok(false) => "no stored password",
        Err(e) => {
            warn!(mprn = %meter.mprn, error = %e, "keyring lookup failed");
            "password status unknown"
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized esb-meter config and data directories.");
        }
        Commands::AddMeter {
            mprn,
            username,
            password,
        } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;
            let mprn = cfg.add_meter(&mprn, &username)?;
            if let Some(password) = password {
                set_password(&mprn, &password)?;
            }
            save_config(&cfg)?;
            println!("Meter '{}' configured.", mprn);
        }
        Commands::RemoveMeter { mprn } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;
            let mprn = cfg.remove_meter(&mprn)?;
            save_config(&cfg)?;
            if let Err(e) = delete_password(&mprn) {
                warn!(%mprn, error = %e, "could not delete stored password");
            }
            println!("Meter '{}' removed.", mprn);
        }
        Commands::Meters => {
            ensure_initialized()?;
            let cfg = load_config()?;
            if cfg.meters.is_empty() {
                println!("No meters configured.");
            }
            for meter in &cfg.meters {
                let stored = password_status(meter, has_password(&meter.mprn));
                println!("{}  {}  ({})", meter.mprn, meter.username, stored);
            }
        }
        Commands::Fetch { mprn, format } => {
            let format = validate_format(&format)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let meter = select_meter(&cfg, mprn.as_deref())?;
            let password = get_password(meter)?;
            let service = MeterService::new(&cfg, meter, password);
            let report = service.report().await?;
            match format {
                OutputFormat::Table => println!("{}", render_table(&report)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Watch { mprn } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let meter = select_meter(&cfg, mprn.as_deref())?;
            let password = get_password(meter)?;
            let service = MeterService::new(&cfg, meter, password);
            info!(
                mprn = %meter.mprn,
                poll_seconds = cfg.poll_interval().as_secs(),
                freshness_seconds = cfg.freshness_seconds,
                "watching meter"
            );
            watch(&service, cfg.poll_interval()).await;
        }
    }

    Ok(())
}
