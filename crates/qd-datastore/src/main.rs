// qd-datastore/crates/qd-datastore/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{bail, Context};
    use clap::{Parser, Subcommand};
    use qd_datastore::interchange::labeled::parse_time;
    use qd_datastore::{
        import_dump, import_labeled, recover_interrupted, shared_state, telemetry, Config, DatasetDump, SearchFilter,
        SyncWorker,
    };
    use tracing::info;

    #[derive(Parser)]
    #[command(name = "qd-datastore")]
    #[command(about = "Measurement catalog browser and local/remote sync agent", long_about = None)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// Replicate local datasets to the remote catalog
        Sync {
            /// Run a single pass and exit
            #[arg(long)]
            once: bool,

            /// Pull this uuid from the remote before syncing
            #[arg(long)]
            pull: Option<i64>,
        },

        /// Copy one dataset from the remote catalog into the local one
        Pull { uuid: i64 },

        /// Print a dataset overview
        Show {
            uuid: Option<i64>,

            /// Look up by local id instead of uuid
            #[arg(long, conflicts_with = "uuid")]
            id: Option<i64>,
        },

        /// Search the catalog
        Search {
            #[arg(long)]
            project: Option<String>,
            #[arg(long)]
            setup: Option<String>,
            #[arg(long)]
            sample: Option<String>,
            /// Part of the dataset name
            #[arg(long)]
            name: Option<String>,
            /// Required keyword (repeatable)
            #[arg(long = "keyword")]
            keywords: Vec<String>,
            #[arg(long)]
            starred: bool,
            /// Started at or after (YYYY-MM-DD HH:MM:SS or RFC 3339)
            #[arg(long)]
            since: Option<String>,
            /// Started before
            #[arg(long)]
            until: Option<String>,
            /// Search the remote catalog
            #[arg(long)]
            remote: bool,
        },

        /// Write a dataset as JSON
        Export {
            uuid: i64,
            /// Labeled n-dimensional layout instead of the plain dump
            #[arg(long)]
            labeled: bool,
            #[arg(short, long)]
            output: Option<PathBuf>,
        },

        /// Import a JSON document into the local catalog
        Import {
            file: PathBuf,
            #[arg(long)]
            labeled: bool,
        },

        /// Mark datasets left running by a crashed writer as aborted
        Recover,

        /// Print catalog statistics
        Stats {
            /// Also refresh planner statistics and reclaim free pages
            #[arg(long)]
            maintain: bool,
            #[arg(long)]
            remote: bool,
        },
    }

    pub async fn run() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        telemetry::init_tracing();
        let cli = Cli::parse();

        let cfg = Config::from_env()?;
        cfg.print_config();
        let state = shared_state::init(cfg)?;

        match cli.command {
            Commands::Sync { once, pull } => {
                let agent = Arc::new(state.agent());
                if let Some(uuid) = pull {
                    agent.pull(uuid)?;
                }
                if once {
                    let report = agent.run_pass()?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    let mut worker = SyncWorker::spawn(agent, state.config.sync_interval())?;
                    info!("Sync agent running; press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await?;
                    worker.shutdown();
                }
            }
            Commands::Pull { uuid } => {
                state.agent().pull(uuid)?;
                println!("Pulled dataset {}", uuid);
            }
            Commands::Show { uuid, id } => {
                let dataset = match (uuid, id) {
                    (Some(uuid), _) => state.load_by_uuid(uuid, false)?,
                    (None, Some(id)) => state.load_by_id(id)?,
                    (None, None) => bail!("give a uuid or --id"),
                };
                println!("{}", dataset);
            }
            Commands::Search {
                project,
                setup,
                sample,
                name,
                keywords,
                starred,
                since,
                until,
                remote,
            } => {
                let mut filter = SearchFilter::new();
                if let Some(project) = project {
                    filter = filter.project(project);
                }
                if let Some(setup) = setup {
                    filter = filter.setup(setup);
                }
                if let Some(sample) = sample {
                    filter = filter.sample(sample);
                }
                if let Some(name) = name {
                    filter = filter.name_contains(name);
                }
                for keyword in keywords {
                    filter = filter.keyword(keyword);
                }
                if starred {
                    filter = filter.starred(true);
                }
                let after = since.as_deref().map(parse_time).transpose()?;
                let before = until.as_deref().map(parse_time).transpose()?;
                filter = filter.started_between(after, before);

                let catalog = if remote { &state.remote } else { &state.local };
                for row in catalog.search(&filter)? {
                    println!(
                        "{:>6}  {:>20}  {:<30}  {}/{}/{}{}",
                        row.id,
                        row.uuid,
                        row.exp_name,
                        row.project,
                        row.setup,
                        row.sample,
                        if row.starred { "  *" } else { "" }
                    );
                }
            }
            Commands::Export { uuid, labeled, output } => {
                let dataset = state.load_by_uuid(uuid, false)?;
                let document = if labeled {
                    dataset.to_labeled()?
                } else {
                    serde_json::to_value(dataset.to_dump()?)?
                };
                let text = serde_json::to_string_pretty(&document)?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
                        info!("Exported dataset {} to {}", uuid, path.display());
                    }
                    None => println!("{}", text),
                }
            }
            Commands::Import { file, labeled } => {
                let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
                let id = if labeled {
                    import_labeled(&state.local, &serde_json::from_str(&text)?)?
                } else {
                    let dump: DatasetDump = serde_json::from_str(&text)?;
                    import_dump(&state.local, &dump)?
                };
                println!("Imported as id {}", id);
            }
            Commands::Recover => {
                let recovered = recover_interrupted(&state.local)?;
                println!("Recovered {} interrupted datasets", recovered.len());
            }
            Commands::Stats { maintain, remote } => {
                let catalog = if remote { &state.remote } else { &state.local };
                if maintain {
                    catalog.run_maintenance()?;
                }
                println!("{}", serde_json::to_string_pretty(&catalog.get_stats()?)?);
            }
        }

        shared_state::teardown();
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
