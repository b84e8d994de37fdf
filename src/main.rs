use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use podwatch::device::DeviceRecord;
use podwatch::report::{ReportStatus, ScanReport};
use podwatch::scanner::{Scanner, ScannerOptions};
use podwatch::{config, manager, mqtt};

const DEFAULT_CONFIG_PATH: &str = "podwatch.toml";

/// Scan for AirPods advertisements and report their battery and case status.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a TOML config file (defaults to ./podwatch.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scan duration in seconds, overrides the config file
    #[arg(short, long)]
    duration: Option<u64>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<config::AppConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Path::new(DEFAULT_CONFIG_PATH),
        None => return Ok(config::AppConfig::default()),
    };

    let mut file =
        File::open(path).with_context(|| format!("opening config {}", path.display()))?;
    let mut config_contents = String::new();
    file.read_to_string(&mut config_contents)?;

    let config = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

async fn scan(
    options: ScannerOptions,
    duration: Duration,
    announcements: Option<mpsc::UnboundedSender<DeviceRecord>>,
) -> anyhow::Result<Vec<DeviceRecord>> {
    let watcher = manager::BtleWatcher::first_adapter().await?;
    let scanner = Arc::new(Scanner::new(watcher, options));

    if let Some(tx) = announcements {
        scanner.register_observer(move |record| {
            if record.has_status() && tx.send(record.clone()).is_err() {
                debug!("Announcement channel closed");
            }
        });
    }

    let starter = scanner.clone();
    if !tokio::task::spawn_blocking(move || starter.start()).await? {
        // The scanner must not be dropped on the runtime.
        tokio::task::spawn_blocking(move || scanner.shutdown()).await?;
        anyhow::bail!("Failed to start BLE scan");
    }

    info!("Scanning for {} seconds...", duration.as_secs());
    tokio::time::sleep(duration).await;

    let stopper = scanner.clone();
    let devices = tokio::task::spawn_blocking(move || {
        stopper.stop();
        stopper.shutdown();
        stopper.devices()
    })
    .await?;

    info!("Scan finished with {} device records", devices.len());
    Ok(devices)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .parse_filters("info")
            .init();
    } else {
        pretty_env_logger::init();
    }

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let scan_config = config.scan();
    let duration = args
        .duration
        .map(Duration::from_secs)
        .unwrap_or_else(|| scan_config.duration());

    let mut publisher = None;
    let mut announcements = None;
    if let Some(mqtt_config) = config.mqtt.as_ref() {
        let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        let (tx, mut rx) = mpsc::unbounded_channel::<DeviceRecord>();

        let event_loop = tokio::task::spawn(async move {
            mqtt::MqttClient::event_loop(&mut eventloop).await;
        });

        let client = mqtt_client.clone();
        let announcer = tokio::task::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = client.announce_device(&record).await {
                    error!("Error announcing device {}: {:?}", record.id, err);
                }
            }
        });

        announcements = Some(tx);
        publisher = Some((mqtt_client, announcer, event_loop));
    }

    let report = match scan(ScannerOptions::from_config(&scan_config), duration, announcements).await
    {
        Ok(devices) => ScanReport::success(&devices),
        Err(err) => {
            error!("Scan failed: {:#}", err);
            ScanReport::error(err.to_string())
        }
    };

    if let Some((mqtt_client, announcer, mut event_loop)) = publisher {
        if tokio::time::timeout(Duration::from_secs(2), announcer)
            .await
            .is_err()
        {
            warn!("Timed out waiting for MQTT announcements");
        }
        if let Err(err) = mqtt_client.disconnect().await {
            error!("Error disconnecting MQTT client: {:?}", err);
        }
        let _ = tokio::time::timeout(Duration::from_millis(500), &mut event_loop).await;
        event_loop.abort();
    }

    println!("{}", report.to_json(args.pretty)?);

    if report.status == ReportStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}
