use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use site_client::{ClientConfig, Site};
use site_types::{EventCategory, FormType};

/// Inspects and maintains a site client's data directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory to inspect. Defaults to `SITE_DATA_DIR`, then `.site-data`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// API base URL used by `flush`. Defaults to `SITE_API_URL`.
    #[arg(long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analytics counts, unique visitors and pending submissions per form type
    Summary,
    /// Write an analytics snapshot into DIR
    Export { dir: PathBuf },
    /// List the submissions queued for FORM_TYPE
    Pending { form_type: FormType },
    /// Deliver queued submissions, for one form type or all of them
    Flush { form_type: Option<FormType> },
    /// Delete all stored analytics
    ClearAnalytics {
        /// Required, since this can't be undone
        #[arg(long)]
        yes: bool,
    },
    /// Print the JSON schema of the form and analytics payloads
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::from_env().context("Invalid SITE_* configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = args.api_url {
        config.api_base_url = url.trim_end_matches('/').to_string();
    }

    // needs no data directory
    if let Command::Schema = args.command {
        return print_schema();
    }

    if !config.data_dir.exists() {
        bail!("Data directory '{}' does not exist", config.data_dir.display());
    }
    let site = Site::init(config).context("Failed to open the site data")?;

    match args.command {
        Command::Summary => summary(&site),
        Command::Export { dir } => {
            let path = site
                .export_analytics(&dir)
                .with_context(|| format!("Failed to export into {}", dir.display()))?;
            println!("Wrote {}", path.display());
        }
        Command::Pending { form_type } => {
            let pending = site.pending(form_type);
            println!("{} pending {form_type} submission(s)", pending.len());
            for entry in pending {
                println!("  {}  {}  {}", entry.id, entry.created_at.to_rfc3339(), entry.name);
                println!("    {}", serde_json::to_string(&entry.form)?);
            }
        }
        Command::Flush { form_type } => {
            let reports = match form_type {
                Some(form_type) => vec![(form_type, site.flush_pending(form_type).await)],
                None => site.flush_all().await,
            };
            if reports.is_empty() {
                println!("Nothing to flush");
            }
            for (form_type, report) in reports {
                println!(
                    "{form_type}: {} delivered, {} rejected, {} remaining",
                    report.delivered, report.rejected, report.remaining
                );
                if let Some(reason) = report.interrupted {
                    println!("  stopped early: {reason}");
                }
            }
        }
        Command::ClearAnalytics { yes } => {
            if !yes {
                bail!("Refusing to clear analytics without --yes");
            }
            site.clear_analytics();
            println!("Analytics cleared");
        }
        Command::Schema => print_schema()?,
    }

    site.dispose().await;
    Ok(())
}

fn print_schema() -> Result<()> {
    let schemas = serde_json::json!({
        "submitFormRequest": schemars::schema_for!(site_types::SubmitFormRequest),
        "trackEventRequest": schemars::schema_for!(site_types::TrackEventRequest),
        "analyticsEvent": schemars::schema_for!(site_types::AnalyticsEvent),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}

fn summary(site: &Site) {
    let snapshot = site.analytics_snapshot();
    println!("SiteScope - {}", site.config().data_dir.display());
    println!("==========");
    println!("Visitor: {}", site.visitor_id());
    println!();

    println!("Analytics:");
    println!("----------");
    for category in EventCategory::ALL {
        let events = snapshot.log.events(category);
        let latest = events
            .last()
            .map(|event| event.timestamp.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("  {category:?}: {} (latest {latest})", events.len());
    }
    println!("  Total clicks: {}", snapshot.log.total_clicks);
    println!("  Unique visitors: {}", snapshot.unique_visitors_count);
    println!();

    println!("Pending submissions:");
    println!("--------------------");
    for form_type in FormType::ALL {
        println!("  {form_type}: {}", site.pending(form_type).len());
    }
}
