use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facekeep_core::matcher::DEFAULT_MATCH_THRESHOLD;
use facekeep_core::{Descriptor, KvLabelStore, LabelStore, MatcherBuilder, Metric, SqliteKv};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facekeep", about = "Collect and recognize labeled faces")]
struct Cli {
    /// Label database (defaults to $FACEKEEP_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect samples for a label (via facekeepd)
    Collect {
        /// Subject name to store the samples under
        label: String,
    },
    /// Switch facekeepd to recognition mode
    Recognize,
    /// Return facekeepd to standby
    Stop,
    /// Show daemon status
    Status,
    /// List stored labels
    List,
    /// Print a stored record as JSON
    Show { label: String },
    /// Remove a stored label
    Remove { label: String },
    /// Match a descriptor (JSON array) against the stored labels
    Match {
        /// File holding the descriptor, or `-` for stdin
        descriptor: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
        #[arg(long, default_value = "euclidean")]
        metric: Metric,
    },
}

#[zbus::proxy(
    interface = "org.facekeep.Collector1",
    default_service = "org.facekeep.Collector1",
    default_path = "/org/facekeep/Collector1"
)]
trait Collector {
    async fn collect(&self, label: &str) -> zbus::Result<String>;
    async fn recognize(&self) -> zbus::Result<u32>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn daemon() -> Result<CollectorProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(std::time::Duration::from_secs(120))
        .build()
        .await
        .context("connecting to the session bus")?;
    Ok(CollectorProxy::new(&conn).await?)
}

fn open_store(db: Option<PathBuf>) -> Result<KvLabelStore<SqliteKv>> {
    let path = db
        .or_else(|| std::env::var("FACEKEEP_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(facekeep_core::default_db_path);
    tracing::debug!(path = %path.display(), "opening label store");
    let kv = SqliteKv::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(KvLabelStore::new(kv))
}

fn read_descriptor(path: &PathBuf) -> Result<Descriptor> {
    let text = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&text).context("descriptor must be a JSON array of numbers")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect { label } => {
            println!("Collecting samples for {label}; face the camera...");
            let outcome = daemon().await?.collect(&label).await?;
            println!("{outcome}");
        }
        Commands::Recognize => {
            let labels = daemon().await?.recognize().await?;
            println!("Recognition started with {labels} label(s)");
        }
        Commands::Stop => {
            if daemon().await?.stop().await? {
                println!("Stopped");
            } else {
                println!("Already in standby");
            }
        }
        Commands::Status => {
            let status = daemon().await?.status().await?;
            println!("{status}");
        }
        Commands::List => {
            let store = open_store(cli.db)?;
            let mut any = false;
            for record in store.get_all()? {
                any = true;
                println!(
                    "{}\t{} samples\t{}",
                    record.label,
                    record.samples.len(),
                    record.collected_at.to_rfc3339()
                );
            }
            if !any {
                println!("No labels stored");
            }
        }
        Commands::Show { label } => {
            let store = open_store(cli.db)?;
            let record = store.get(&label)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Remove { label } => {
            let mut store = open_store(cli.db)?;
            store.remove(&label)?;
            println!("Removed {label}");
        }
        Commands::Match {
            descriptor,
            threshold,
            metric,
        } => {
            let store = open_store(cli.db)?;
            let query = read_descriptor(&descriptor)?;
            let index = MatcherBuilder::new(threshold)
                .metric(metric)
                .descriptor_len(query.len())
                .build(&store)?;
            println!("{}", index.find_best_match(&query)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_defaults() {
        let cli = Cli::try_parse_from(["facekeep", "match", "face.json"]).unwrap();
        match cli.command {
            Commands::Match {
                descriptor,
                threshold,
                metric,
            } => {
                assert_eq!(descriptor, PathBuf::from("face.json"));
                assert_eq!(threshold, DEFAULT_MATCH_THRESHOLD);
                assert_eq!(metric, Metric::Euclidean);
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_global_db_flag() {
        let cli = Cli::try_parse_from(["facekeep", "list", "--db", "/tmp/f.db"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/f.db")));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_rejects_unknown_metric() {
        assert!(Cli::try_parse_from(["facekeep", "match", "p.json", "--metric", "manhattan"]).is_err());
    }

    #[test]
    fn test_collect_requires_label() {
        assert!(Cli::try_parse_from(["facekeep", "collect"]).is_err());
    }
}
