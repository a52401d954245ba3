use clap::Parser;
use color_eyre::eyre;
use console::style;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Trace of memory accesses (JSON list of commands)
    #[arg(short = 't', long = "trace", value_name = "TRACE")]
    trace: PathBuf,
    /// Configuration (YAML), defaults are used for missing values
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Override the coherence protocol of the default segment
    #[arg(short = 'p', long = "protocol", value_enum)]
    protocol: Option<dirsim::config::Protocol>,
    /// Write statistics as JSON
    #[arg(long = "stats", value_name = "STATS")]
    stats: Option<PathBuf>,
    /// Write directory statistics as CSV
    #[arg(long = "stats-csv", value_name = "STATS_CSV")]
    stats_csv: Option<PathBuf>,
    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    let level = match options.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut config = match options.config {
        Some(ref path) => dirsim::config::Config::from_yaml(path)?,
        None => dirsim::config::Config::default(),
    };
    if let Some(protocol) = options.protocol {
        config.protocol = protocol;
    }
    log::info!("{:#?}", config);

    let commands = dirsim::parse_commands(&options.trace)?;
    let num_commands = commands.len();
    let mut sim = dirsim::sim::Simulation::new(config)?;
    let start = std::time::Instant::now();
    let output = sim.run(commands)?;

    for done in &output.completions {
        println!(
            "{:>8} core {:>3} {:<5} {:#010x} {}",
            done.cycle,
            done.core,
            format!("{:?}", done.kind),
            done.addr,
            dirsim::Optional(done.value)
        );
    }
    eprintln!(
        "{} {} commands in {} cycles ({} packets, {} hits) in {:?}",
        style("completed").bold().green(),
        num_commands,
        output.stats.sim.cycles,
        output.stats.sim.packets,
        output.stats.sim.hits,
        start.elapsed()
    );
    eprintln!("{:#?}", output.stats.total_directory());

    if let Some(ref path) = options.stats {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &output.stats)?;
    }
    if let Some(ref path) = options.stats_csv {
        let mut writer = csv::WriterBuilder::new().from_path(path)?;
        for row in output.stats.flatten() {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    Ok(())
}
