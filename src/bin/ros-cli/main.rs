use clap::Parser;
use futures::StreamExt;
use log::info;

use routeros_api::{command_words, ApiConfig, Authenticated, RouterOsApi};

use crate::config::{Args, Command};

mod config;

#[tokio::main]
pub async fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();

    let args = Args::parse();

    let mut config = ApiConfig::new(args.host.as_str());
    config.port = args.port;
    if args.tls {
        config = config.with_tls();
        if args.insecure {
            if let Some(tls) = config.tls.as_mut() {
                tls.verify_hostname = false;
            }
        }
    }

    let api = match routeros_api::connect(config).await {
        Ok(api) => api,

        Err(e) => {
            eprintln!("connect failed: {e}");
            return;
        }
    };

    let api = match api.login(&args.login, &args.password).await {
        Ok(api) => api,

        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    match args.command {
        Command::Run {
            command,
            attributes,
            proplist,
        } => run(&api, &command, &attributes, proplist.as_deref()).await,

        Command::Listen { command, interval } => listen(&api, &command, interval).await,
    }
}

async fn run(
    api: &RouterOsApi<Authenticated>,
    command: &str,
    attributes: &[String],
    proplist: Option<&str>,
) {
    let mut attrs: Vec<(&str, &str)> = attributes
        .iter()
        .map(|a| a.split_once('=').unwrap_or((a.as_str(), "")))
        .collect();

    if let Some(proplist) = proplist {
        attrs.push((".proplist", proplist));
    }

    let channel = match api.command(command_words(command, &attrs)) {
        Ok(channel) => channel,

        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    match channel.collect().await {
        Ok(rows) => {
            for row in &rows {
                println!("{row:?}");
            }
            info!("{} row(s)", rows.len());
        }

        Err(e) => eprintln!("{e}"),
    }
}

async fn listen(api: &RouterOsApi<Authenticated>, command: &str, interval: Option<u64>) {
    let mut words = vec![command.to_owned()];
    if let Some(interval) = interval {
        words.push(format!("=interval={interval}"));
    }

    let mut stream = match api.stream(words) {
        Ok(stream) => stream,

        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    info!("listening on {command}, Ctrl-C to stop");

    loop {
        tokio::select! {
            batch = stream.next() => match batch {
                Some(Ok(rows)) if rows.is_empty() => info!("no changes"),

                Some(Ok(rows)) => {
                    for row in rows {
                        println!("{row:?}");
                    }
                }

                Some(Err(e)) => {
                    eprintln!("stream error: {e}");
                    return;
                }

                None => return,
            },

            _ = tokio::signal::ctrl_c() => {
                info!("stopping stream");
                if let Err(e) = stream.stop().await {
                    eprintln!("{e}");
                }
                return;
            }
        }
    }
}
