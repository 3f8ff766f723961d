use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use border_partitioner::bootstrap::{default_country_plans, CountryBootstrap};
use border_partitioner::config::Config;
use border_partitioner::gateway::InProcessGateway;
use border_partitioner::inputs::InputData;
use border_partitioner::manipulate::{Manipulator, SplitMode};
use border_partitioner::osm_xml::{self, XmlRegion};
use border_partitioner::predictor::Predictor;
use border_partitioner::store::{BorderStore, InMemoryBorderStore};
use border_partitioner::worker;
use border_partitioner::Result;

#[derive(Parser, Debug)]
#[command(name = "border-partitioner", version, about, propagate_version = true)]
struct Cli {
    /// Path to a YAML config file; falls back to built-in defaults when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the background size-counting worker until interrupted.
    Worker,
    /// Bootstraps one declared country's admin-level ladder into the store.
    Bootstrap(BootstrapArgs),
    /// Exports a region subtree to OSM-XML.
    ExportXml(ExportXmlArgs),
    /// Imports regions from an OSM-XML file, creating or updating rows.
    ImportXml(ImportXmlArgs),
    /// Splits a region by a geometric operation.
    Split(SplitArgs),
    /// Joins two sibling regions into one.
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Country name as it appears in the osm_borders admin_level=2 rows.
    country: String,
    #[arg(long)]
    auto_divide: bool,
}

#[derive(Args, Debug)]
struct ExportXmlArgs {
    region_id: i64,
    out: PathBuf,
}

#[derive(Args, Debug)]
struct ImportXmlArgs {
    path: PathBuf,
}

#[derive(Args, Debug)]
struct SplitArgs {
    region_id: i64,
    #[arg(long, default_value_t = false)]
    retain: bool,
}

#[derive(Args, Debug)]
struct JoinArgs {
    region_a: i64,
    region_b: i64,
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path).unwrap_or_else(|err| {
            error!("failed to load config from {}: {err}, using defaults", path.display());
            Config::default()
        }),
        None => Config::default(),
    };

    if let Err(err) = run(&cli.command, &config) {
        error!("command failed: {err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config as LogConfig, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}")))
        .build();
    let log_config = match LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(log::LevelFilter::Info))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to build logging config: {err}");
            return;
        }
    };
    if let Err(err) = log4rs::init_config(log_config) {
        eprintln!("failed to initialize logging: {err}");
    }
}

fn run(command: &Command, config: &Config) -> Result<()> {
    let predictor = Predictor::load(&config.model_path, config.model_limits.clone())?;
    let gateway = InProcessGateway::new(InputData::empty());
    let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), config.read_only, config.snapshot_dir.clone());

    match command {
        Command::Worker => {
            info!("starting background size-counting worker");
            worker::run(
                &store,
                &gateway,
                config.daemon_status_path.clone(),
                Duration::from_secs(config.worker_poll_interval_secs),
                config.worker_max_envelope_area_deg2,
                || false,
                std::thread::sleep,
            );
            Ok(())
        }
        Command::Bootstrap(args) => {
            let plans = default_country_plans();
            let plan = plans
                .into_iter()
                .find(|p| p.name == args.country)
                .unwrap_or(border_partitioner::bootstrap::CountryPlan { name: args.country.clone(), levels: vec![] });
            let bootstrap = CountryBootstrap::new(&store, &gateway, &predictor, &config.model_limits);
            let id = bootstrap.bootstrap_country(&plan, config.mwm_size_threshold, args.auto_divide)?;
            info!("bootstrapped {} as region {id}", args.country);
            Ok(())
        }
        Command::ExportXml(args) => {
            let region = store.get(args.region_id)?;
            let children = store.children(args.region_id)?;
            let mut regions = vec![XmlRegion { id: region.id, name: region.name, disabled: region.disabled, geom: region.geom }];
            for child in children {
                regions.push(XmlRegion { id: child.id, name: child.name, disabled: child.disabled, geom: child.geom });
            }
            let xml = osm_xml::serialize_borders(&regions, config.josm_force_multi)?;
            std::fs::write(&args.out, xml)?;
            info!("exported region {} to {}", args.region_id, args.out.display());
            Ok(())
        }
        Command::ImportXml(args) => {
            let xml = std::fs::read_to_string(&args.path)?;
            let parsed = osm_xml::parse_borders(&xml)?;
            for region in parsed {
                let id = if region.id != 0 { region.id } else { store.allocate_free_id() };
                let mut new_region = border_partitioner::store::region::Region::new(
                    id,
                    region.name.unwrap_or_default(),
                    region.geom,
                    None,
                );
                new_region.disabled = region.disabled;
                if region.modified {
                    new_region.mark_stale();
                }
                store.create(new_region)?;
            }
            info!("imported regions from {}", args.path.display());
            Ok(())
        }
        Command::Split(args) => {
            let manipulator = Manipulator::new(&store, &gateway, &predictor, &config.model_limits);
            let region = store.get(args.region_id)?;
            let bbox = border_partitioner::geom::envelope(&region.geom).ok_or(border_partitioner::Error::NoSplit(args.region_id, 0))?;
            let mid_x = (bbox.min().x + bbox.max().x) / 2.0;
            let line = geo::Line::new(
                geo::Coord { x: mid_x, y: bbox.min().y },
                geo::Coord { x: mid_x, y: bbox.max().y },
            );
            let mode = if args.retain { SplitMode::Retain } else { SplitMode::Delete };
            let new_ids = manipulator.split_by_line(args.region_id, line, mode)?;
            info!("split region {} into {new_ids:?}", args.region_id);
            Ok(())
        }
        Command::Join(args) => {
            let manipulator = Manipulator::new(&store, &gateway, &predictor, &config.model_limits);
            let new_id = manipulator.join(args.region_a, args.region_b)?;
            info!("joined {} and {} into {new_id}", args.region_a, args.region_b);
            Ok(())
        }
    }
}
