use clap::Parser;
use spice_client::{ClientBuilder, ClientConfig, FrameDelivery, SessionNotice, TrustAnchor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "SPICE client test program", long_about = None)]
struct Args {
    /// spice://host:port or spice+tls://host:port
    #[arg(short = 'u', long, default_value = "spice://localhost:5900")]
    uri: String,

    #[arg(short = 'd', long, default_value = "30")]
    duration: u64,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'P', long)]
    password: Option<String>,

    /// PEM bundle of CA certificates for TLS endpoints
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Skip certificate verification (test rigs only)
    #[arg(long)]
    insecure: bool,

    /// Write the last frame of display 0 as PNG on exit
    #[arg(long)]
    screenshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let trust = if args.insecure {
        TrustAnchor::AcceptAny
    } else if let Some(path) = &args.ca_file {
        TrustAnchor::Pem(std::fs::read(path)?)
    } else {
        TrustAnchor::None
    };

    info!("Starting SPICE test client");
    info!("Connecting to {}", args.uri);

    let mut builder = ClientBuilder::new(&args.uri)
        .with_trust_anchor(trust)
        .with_config(ClientConfig::default());
    if let Some(password) = args.password {
        builder = builder.with_password(password);
    }

    let client = match builder.connect().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
    };
    info!("Successfully connected to SPICE server");

    let frames = Arc::new(AtomicU64::new(0));
    let last_frame = Arc::new(Mutex::new(None));
    {
        let frames = frames.clone();
        let last_frame = last_frame.clone();
        client.set_frame_callback(Some(Arc::new(move |delivery: FrameDelivery| match delivery {
            FrameDelivery::Frame(frame) => {
                frames.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = last_frame.lock() {
                    *last = Some(frame);
                }
            }
            FrameDelivery::Failed(e) => error!("Session failed: {}", e),
        })));
    }
    client.set_notice_callback(Some(Arc::new(|notice: SessionNotice| match notice {
        SessionNotice::ChannelFailed { channel, error } => warn!("Channel {} failed: {}", channel, error),
        other => info!("Notice: {:?}", other),
    })));

    info!("Running for {} seconds...", args.duration);
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < args.duration && client.is_connected() {
        info!(
            "Display {}x{}, {} frames, mouse mode {:?}",
            client.width(),
            client.height(),
            frames.load(Ordering::Relaxed),
            client.mouse_mode()
        );
        sleep(Duration::from_secs(1)).await;
    }

    if let Some(failure) = client.failure() {
        error!("Session ended: {}", failure);
    }

    for (channel, state) in client.channel_states() {
        info!("Channel {}: {:?}", channel, state);
    }

    client.disconnect().await;

    if let Some(path) = args.screenshot {
        let frame = last_frame.lock().ok().and_then(|mut f| f.take());
        match frame {
            Some(frame) => {
                std::fs::write(&path, frame.encode_png()?)?;
                info!("Wrote {}x{} screenshot to {}", frame.width, frame.height, path.display());
            }
            None => warn!("No frame received, no screenshot written"),
        }
    }

    info!("Test completed");
    Ok(())
}
