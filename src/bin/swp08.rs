use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use structopt::StructOpt;

use prettytable::{cell, format::FormatBuilder, row, Table};

use log::{debug, info};

use tokio::sync::broadcast;

use swp08::*;

#[derive(StructOpt, Debug)]
#[structopt(name = "swp08")]
struct App {
    /// A path to a serial port wired to the router, e.g. /dev/ttyUSB0
    #[structopt(short, long, parse(from_os_str), conflicts_with = "host")]
    device: Option<PathBuf>,

    /// A host[:port] to connect over TCP
    #[structopt(short, long, conflicts_with = "device")]
    host: Option<String>,

    /// Serial baud rate
    #[structopt(short, long, default_value = "38400")]
    baud: u32,

    /// A JSON configuration file; flags override it
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: AppCommand,
}

#[derive(StructOpt, Debug)]
enum AppCommand {
    /// Run the client fan-out server
    Serve,
    /// Connect a source to a destination
    Take {
        #[structopt(short, long, default_value = "0")]
        matrix: u8,

        #[structopt(short, long, default_value = "0")]
        level: u8,

        destination: u16,
        source: u16,
    },
    /// Ask the router for the current source of a destination
    Interrogate {
        #[structopt(short, long, default_value = "0")]
        matrix: u8,

        #[structopt(short, long, default_value = "0")]
        level: u8,

        destination: u16,
    },
    /// Request a tally dump and print the collected table
    Dump {
        #[structopt(short, long, default_value = "0")]
        matrix: u8,

        #[structopt(short, long, default_value = "0")]
        level: u8,
    },
    /// Print crosspoint changes as they arrive
    Listen,
}

fn create_table() -> Table {
    let mut table = Table::new();
    let format = FormatBuilder::new()
        .column_separator(' ')
        .padding(0, 1)
        .build();

    table.set_format(format);
    table
}

fn status_word(status: CrosspointStatus) -> &'static str {
    match status {
        CrosspointStatus::Connected => "connected",
        CrosspointStatus::Pending => "pending",
        CrosspointStatus::Disconnected => "disconnected",
    }
}

async fn connect(config: &Config, router: &Router) -> Result<()> {
    let stream = config
        .transport_config()
        .open()
        .await
        .with_context(|| format!("Failed to open {}", config.transport_config().endpoint()))?;
    router.attach(Link::new(stream, LinkOptions::default()))?;
    Ok(())
}

/// Best-effort wait for the router to tally the routed crosspoint.
async fn await_tally(
    events: &mut broadcast::Receiver<RouterEvent>,
    matrix: u8,
    level: u8,
    destination: u16,
) {
    let confirmed = async {
        loop {
            match events.recv().await {
                Ok(RouterEvent::CrosspointChange(s))
                    if s.matrix == matrix
                        && s.level == level
                        && s.destination == destination
                        && s.status == CrosspointStatus::Connected =>
                {
                    break
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), confirmed)
        .await
        .is_err()
    {
        eprintln!("No tally received yet; the route may still be pending");
    }
}

async fn serve(config: Config, router: Router) -> Result<()> {
    let server = Server::new(&config, router.clone());

    if config.auto_connect {
        let transport = config.transport_config();
        tokio::spawn(async move { router.run(transport).await });
    } else {
        info!("auto_connect disabled; serving the cache only");
    }

    server.run().await.context("Fan-out server failed")
}

async fn listen(router: &Router) -> Result<()> {
    let mut events = router.events();
    loop {
        match events.recv().await {
            Ok(RouterEvent::CrosspointChange(s)) => println!(
                "m{} l{} dst {} <- src {} ({})",
                s.matrix,
                s.level,
                s.destination,
                s.source,
                status_word(s.status)
            ),
            Ok(RouterEvent::Disconnected) => {
                eprintln!("Router disconnected");
                break;
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let app = App::from_args();

    debug!("{:#?}", app);

    let mut config = match &app.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(device) = &app.device {
        config.transport = TransportKind::Serial;
        config.serial.path = device.display().to_string();
        config.serial.baud = app.baud;
    } else if let Some(host) = &app.host {
        config.transport = TransportKind::Tcp;
        match host.rsplit_once(':') {
            Some((name, port)) => {
                config.tcp.host = name.to_owned();
                config.tcp.port = port.parse().context("Invalid port")?;
            }
            None => config.tcp.host = host.clone(),
        }
    }

    let router = Router::new(config.limits(), LinkOptions::default());

    match app.command {
        AppCommand::Serve => serve(config, router).await?,
        AppCommand::Take {
            matrix,
            level,
            destination,
            source,
        } => {
            connect(&config, &router).await?;
            let mut events = router.events();
            router.take(matrix, level, destination, source)?;
            await_tally(&mut events, matrix, level, destination).await;

            let mut table = create_table();
            table.add_row(row!["Destination", destination]);
            table.add_row(row!["Source", source]);
            table.printstd();
        }
        AppCommand::Interrogate {
            matrix,
            level,
            destination,
        } => {
            connect(&config, &router).await?;
            let source = router.interrogate(matrix, level, destination).await?;

            let mut table = create_table();
            table.add_row(row!["Destination", destination]);
            table.add_row(row!["Source", source]);
            table.printstd();
        }
        AppCommand::Dump { matrix, level } => {
            connect(&config, &router).await?;
            router.request_tally_dump(matrix, level)?;
            tokio::time::sleep(Duration::from_secs(2)).await;

            let mut table = create_table();
            table.set_titles(row![b->"Destination", b->"Source", b->"Status"]);
            for s in router.get_by_level(matrix, level) {
                table.add_row(row![s.destination, s.source, status_word(s.status)]);
            }
            table.printstd();
        }
        AppCommand::Listen => {
            connect(&config, &router).await?;
            listen(&router).await?;
        }
    }

    Ok(())
}
