use std::{fs::File, path::PathBuf, time::Duration};

use clap::Parser;
use geoutils::Location;
use gnss_correction_client::{
    config::NtripConfig,
    credentials::NtripCredentials,
    fetch_sourcetable, forward_ntrip,
    session::RECEIVE_DATA_SIZE,
    sink::{CorrectionSink, WriterSink},
    GgaSentence, NtripClient, NtripState,
};
use tokio::select;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::Subscriber as FmtSubscriber, EnvFilter};

/// GNSS correction command line tool
#[derive(Clone, PartialEq, Debug, Parser)]
struct Args {
    #[clap()]
    /// NTRIP caster identifier or URI ("rtk2go", "linz" etc., or "[ntrip|http|https]://host:port")
    pub ntrip_host: NtripConfig,

    #[clap(flatten)]
    pub ntrip_creds: NtripCredentials,

    #[clap(subcommand)]
    pub command: Commands,

    #[clap(long, default_value = "info")]
    /// Set log level
    pub log_level: LevelFilter,
}

#[derive(Clone, PartialEq, Debug, Parser)]
pub enum Commands {
    /// List the streams in the caster source table
    List,
    /// Find the nearest stream to a specified location
    FindNearest {
        #[clap()]
        lat: f64,
        #[clap()]
        lon: f64,
        /// Search radius in km
        #[clap(long, default_value_t = 100.0)]
        max_km: f64,
    },
    /// Subscribe to a mountpoint and forward received correction data
    Subscribe {
        #[clap()]
        mount: String,
        /// Rover latitude, reported to the caster in GGA sentences
        #[clap(long, requires = "lon")]
        lat: Option<f64>,
        /// Rover longitude, reported to the caster in GGA sentences
        #[clap(long, requires = "lat")]
        lon: Option<f64>,
        /// Write correction data to this file
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    let _ = FmtSubscriber::builder()
        .compact()
        .without_time()
        .with_max_level(args.log_level)
        .with_env_filter(filter)
        .try_init();

    info!("Start GNSS correction tool");

    debug!("Args {args:?}");

    // Setup interrupt / exit handler
    let (exit_tx, mut exit_rx) = tokio::sync::broadcast::channel(1);
    let e = exit_tx.clone();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl-C, shutting down...");
            let _ = e.send(());
        }
    });

    match args.command {
        Commands::List => {
            info!("Listing caster streams");

            let table = fetch_sourcetable(&args.ntrip_host, &args.ntrip_creds).await?;

            for s in table.streams {
                info!(
                    "{} - {} [{}{}] ({:.3}, {:.3})",
                    s.mountpoint,
                    s.identifier,
                    s.format,
                    if s.requires_gga() { ", GGA" } else { "" },
                    s.location.latitude(),
                    s.location.longitude()
                );
            }
        },
        Commands::FindNearest { lat, lon, max_km } => {
            info!("Finding nearest stream to ({}, {})", lat, lon);

            let table = fetch_sourcetable(&args.ntrip_host, &args.ntrip_creds).await?;

            match table.find_nearest(&Location::new(lat, lon), max_km * 1000.0) {
                Some((s, d)) => {
                    info!(
                        "Nearest stream: {} - {} ({:.3}, {:.3}), {:.3} km away",
                        s.mountpoint,
                        s.identifier,
                        s.location.latitude(),
                        s.location.longitude(),
                        d / 1000.0
                    );
                },
                None => {
                    info!("No streams within {} km", max_km);
                },
            }
        },
        Commands::Subscribe {
            mount,
            lat,
            lon,
            output,
        } => {
            let rover = lat.zip(lon).map(|(lat, lon)| Location::new(lat, lon));

            let config = args
                .ntrip_host
                .with_mountpoint(&mount)
                .with_gga(rover.is_some());

            let mut sink: Box<dyn CorrectionSink> = match output {
                Some(path) => Box::new(WriterSink(File::create(path)?)),
                None => Box::new(Vec::new()),
            };

            debug!("Connecting to NTRIP caster");

            let mut client = NtripClient::new(config, args.ntrip_creds.clone());
            client.init().await?;

            let mut buf = vec![0u8; RECEIVE_DATA_SIZE];
            let mut total = 0;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                select! {
                    _ = ticker.tick() => match client.state().await {
                        NtripState::RequestGga => {
                            let Some(location) = rover else {
                                error!("Caster requested a GGA report, pass --lat/--lon");
                                break;
                            };
                            let gga = GgaSentence::new(location).to_sentence();
                            debug!("Sending {}", gga.trim_end());
                            client.send_gga(gga.as_bytes()).await?;
                        },
                        NtripState::CorrectionDataAvailable => {
                            let n = forward_ntrip(&client, &mut buf, &mut sink).await?;
                            total += n;
                            info!("Received {} bytes ({} total)", n, total);
                        },
                        NtripState::ConnectionReset | NtripState::Error => {
                            error!("Session ended: {}", client.detailed_error().await);
                            break;
                        },
                        NtripState::Busy => warn!("Session busy"),
                        _ => {},
                    },
                    _ = exit_rx.recv() => {
                        info!("Exiting on signal");
                        break;
                    }
                }
            }

            client.deinit().await?;
        },
    }

    debug!("Exiting");

    Ok(())
}
