use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short = 'H', long, help = "router host name or address")]
    pub host: String,

    #[clap(short = 'p', long, help = "API port (default 8728, TLS 8729)")]
    pub port: Option<u16>,

    #[clap(long, help = "connect with TLS")]
    pub tls: bool,

    #[clap(long, help = "accept any TLS certificate")]
    pub insecure: bool,

    #[clap(short = 'L', long)]
    pub login: String,

    #[clap(short = 'P', long)]
    pub password: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run a one-shot command and print its rows.
    Run {
        command: String,

        #[clap(short, long = "attr", help = "attribute as key=value")]
        attributes: Vec<String>,

        #[clap(long, help = "set .proplist")]
        proplist: Option<String>,
    },

    /// Subscribe to a listen-style command until Ctrl-C.
    Listen {
        command: String,

        #[clap(short, long, help = "polling interval in seconds")]
        interval: Option<u64>,
    },
}
