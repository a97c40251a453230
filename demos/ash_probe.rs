use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use ashlink::config::{AshConfig, PortPath};
use ashlink::port::DefaultPortOpener;
use ashlink::uart::{drain_notifications, AshNotification, UartAsh};
use tracing::{error, info, Level};

/// Connects to an NCP, optionally sends a single payload, and prints whatever comes back
#[derive(Parser)]
struct Args {
    /// serial device (e.g. /dev/ttyUSB0) or tcp://<host>:<port>
    port: String,

    #[clap(long, default_value_t = 115200)]
    baud_rate: u32,

    #[clap(long, default_value_t = false)]
    rtscts: bool,

    /// hex encoded DATA payload, e.g. 0000000d for an EZSP version request
    #[clap(long)]
    send: Option<String>,

    #[clap(long, default_value_t = 3)]
    listen_seconds: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let mut config = AshConfig::new(PortPath::parse(&args.port)?);
    config.baud_rate = args.baud_rate;
    config.rtscts = args.rtscts;

    let (mut uart, mut notifications) = UartAsh::new(config, Arc::new(DefaultPortOpener))?;

    let status = uart.reset_ncp().await;
    if !status.is_success() {
        return Err(anyhow!("reset failed: {}", status));
    }
    let status = uart.start().await;
    if !status.is_success() {
        return Err(anyhow!("start failed: {}", status));
    }
    info!("connected");

    if let Some(hex) = &args.send {
        let payload = parse_hex(hex)?;
        let status = uart.send(&payload).await;
        info!("sending {:02X?}: {}", payload, status);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.listen_seconds);
    while tokio::time::Instant::now() < deadline {
        if let Err(e) = uart.poll_for(Duration::from_millis(100)).await {
            error!("{}", e);
            break;
        }

        for notification in drain_notifications(&mut notifications) {
            match notification {
                AshNotification::Frame(payload) => info!("received {:02X?}", payload.as_ref()),
                AshNotification::FatalError(status) => error!("link failed: {}", status),
            }
        }
    }

    uart.stop().await;
    Ok(())
}

fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(anyhow!("not an even number of hex digits: {:?}", s));
    }

    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i+2], 16)
            .map_err(|e| anyhow!("invalid hex {:?}: {}", &s[i..i+2], e)))
        .collect()
}
