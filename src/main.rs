use clap::{Parser, Subcommand};
use signal_mix::device::{DeviceDirectory, Direction, SystemDevices};
use signal_mix::engine::MixEngine;
use signal_mix::{BusId, ExportFormat, MixConfig, MixEvent, StreamState};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "signalmix", about = "Radio mixing console engine CLI")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status and the channel roster
    Status,
    /// List every channel's stations
    Stations,
    /// List audio input and output devices
    Devices,
    /// Play one channel through MASTER
    Listen {
        /// Channel id (e.g. A, C, RNE_EMISORAS)
        channel: String,
        /// Station name from the channel's catalog
        #[arg(short, long)]
        station: Option<String>,
        /// Explicit stream URL (overrides --station)
        #[arg(short, long)]
        url: Option<String>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Output device for MASTER
        #[arg(long)]
        device: Option<String>,
    },
    /// Record a bus and export it
    Record {
        /// Bus to capture: MASTER, AUX1 or AUX2
        #[arg(default_value = "MASTER")]
        bus: String,
        /// Channel to feed the bus from
        #[arg(short, long, default_value = "A")]
        channel: String,
        /// Stream URL for the channel (defaults to its first station)
        #[arg(short, long)]
        url: Option<String>,
        /// Export format: mp3, webm, wav or ogg
        #[arg(short, long, default_value = "wav")]
        format: String,
        /// Capture length in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Output directory (defaults to the configured recording dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Render without audio devices, as fast as the source allows
        #[arg(long)]
        offline: bool,
    },
    /// Engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the current configuration
    Show,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn open_engine(config: MixConfig, offline: bool) -> MixEngine {
    let result = if offline {
        MixEngine::offline(config)
    } else {
        MixEngine::new(config)
    };
    result.unwrap_or_else(|e| fail(e))
}

fn print_event(event: &MixEvent) {
    match event {
        MixEvent::StreamState { channel, state } => println!("{}: {:?}", channel, state),
        MixEvent::Bitrate { channel, kbps } => println!("{}: {} kbps", channel, kbps),
        MixEvent::AnalysisDegraded { channel } => {
            println!("{}: playing without level metering", channel)
        }
        MixEvent::StreamFailed { channel, reason } => eprintln!("{}: {}", channel, reason),
        MixEvent::RecordingStarted { bus, .. } => println!("{}: recording", bus),
        MixEvent::RecordingTick {
            bus,
            elapsed_seconds,
        } => println!(
            "{}: {:02}:{:02}",
            bus,
            elapsed_seconds / 60,
            elapsed_seconds % 60
        ),
        MixEvent::RecordingStopped { bus } => println!("{}: recording stopped", bus),
        MixEvent::OnAir { on_air } => {
            println!("{}", if *on_air { "ON AIR" } else { "off air" })
        }
        MixEvent::RouteFailed { bus, reason } => eprintln!("{}: {}", bus, reason),
        MixEvent::InputFailed { channel, reason } => eprintln!("{}: {}", channel, reason),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(MixConfig::default_path);
    let config = MixConfig::load_from(&config_path);

    match cli.command {
        Commands::Status => {
            println!("signal_mix engine v{}", env!("CARGO_PKG_VERSION"));
            let engine = open_engine(config, true);
            let buses = engine.buses().unwrap_or_else(|e| fail(e));
            for bus in &buses {
                let dynamics = match bus.dynamics {
                    Some(d) => format!(
                        " | comp: {} | limiter: {}",
                        if d.compressor_enabled { "on" } else { "off" },
                        if d.limiter_enabled { "on" } else { "off" }
                    ),
                    None => String::new(),
                };
                println!(
                    "{:<6} level {:.2} -> {}{}",
                    bus.id, bus.level, bus.route, dynamics
                );
            }
            println!();
            for ch in engine.channels().unwrap_or_else(|e| fail(e)) {
                let source = ch
                    .url
                    .as_deref()
                    .or(ch.live_device.as_deref())
                    .unwrap_or("default input");
                println!("{:<13} {:<18} {}", ch.id, ch.label, source);
            }
        }
        Commands::Stations => {
            let engine = open_engine(config, true);
            for ch in engine.channels().unwrap_or_else(|e| fail(e)) {
                if ch.stations.is_empty() {
                    continue;
                }
                println!("{} ({})", ch.id, ch.label);
                for name in &ch.stations {
                    println!("  {}", name);
                }
            }
        }
        Commands::Devices => {
            let directory = SystemDevices;
            for (title, direction) in [("Inputs", Direction::Input), ("Outputs", Direction::Output)]
            {
                println!("{}:", title);
                for device in directory.list(direction) {
                    let marker = if device.is_default { " *" } else { "" };
                    println!("  {}{}", device.name, marker);
                }
            }
        }
        Commands::Listen {
            channel,
            station,
            url,
            seconds,
            device,
        } => {
            let mut engine = open_engine(config, false);
            if device.is_some() {
                engine
                    .set_output_device(BusId::Master, device.as_deref())
                    .unwrap_or_else(|e| fail(e));
            }
            let bound = match (url, station) {
                (Some(url), _) => engine.bind_stream(&channel, &url),
                (None, Some(station)) => engine.bind_station(&channel, &station),
                (None, None) => engine.reload_stream(&channel),
            };
            bound.unwrap_or_else(|e| fail(e));

            println!("Listening to {} (Ctrl+C to stop)...", channel);
            let started = Instant::now();
            loop {
                for event in engine.poll().unwrap_or_else(|e| fail(e)) {
                    print_event(&event);
                }
                let state = engine
                    .channel(&channel)
                    .map(|c| c.stream_state)
                    .unwrap_or(None);
                if state == Some(StreamState::Error) {
                    std::process::exit(1);
                }
                if seconds.is_some_and(|s| started.elapsed() >= Duration::from_secs(s)) {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            let _ = engine.shutdown();
        }
        Commands::Record {
            bus,
            channel,
            url,
            format,
            seconds,
            out,
            offline,
        } => {
            let bus = MixEngine::bus_id(&bus).unwrap_or_else(|e| fail(e));
            let format: ExportFormat = format.parse().unwrap_or_else(|e| fail(e));
            let mut engine = open_engine(config, offline);

            let bound = match url {
                Some(url) => engine.bind_stream(&channel, &url),
                None => engine.reload_stream(&channel),
            };
            bound.unwrap_or_else(|e| fail(e));
            if bus.aux_index().is_some() {
                let send = engine
                    .set_aux_send(&channel, bus, 1.0)
                    .unwrap_or_else(|e| fail(e));
                if !send.enabled {
                    engine
                        .toggle_aux_send(&channel, bus)
                        .unwrap_or_else(|e| fail(e));
                }
            }

            engine
                .start_recording_as(bus, format)
                .unwrap_or_else(|e| fail(e));
            println!("Recording {} from {} for {}s...", bus, channel, seconds);

            let target = Duration::from_secs(seconds);
            let started = Instant::now();
            let mut rendered = Duration::ZERO;
            loop {
                for event in engine.poll().unwrap_or_else(|e| fail(e)) {
                    print_event(&event);
                }
                if offline {
                    if rendered >= target {
                        break;
                    }
                    engine.advance(POLL_INTERVAL).unwrap_or_else(|e| fail(e));
                    rendered += POLL_INTERVAL;
                    // Give the stream worker time to refill.
                    std::thread::sleep(Duration::from_millis(5));
                } else {
                    if started.elapsed() >= target {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }

            engine.stop_recording(bus).unwrap_or_else(|e| fail(e));
            let path = engine
                .export_recording_to(bus, Some(format), out.as_deref())
                .unwrap_or_else(|e| fail(e));
            println!("Saved {}", path.display());
            let _ = engine.shutdown();
        }
        Commands::Config { action } => match action {
            ConfigCmd::Init { force } => {
                if config_path.exists() && !force {
                    fail(format!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    ));
                }
                MixConfig::default()
                    .save_to(&config_path)
                    .unwrap_or_else(|e| fail(e));
                println!("Wrote {}", config_path.display());
            }
            ConfigCmd::Show => {
                let json = serde_json::to_string_pretty(&config).unwrap_or_else(|e| fail(e));
                println!("{}", json);
            }
        },
    }
}
