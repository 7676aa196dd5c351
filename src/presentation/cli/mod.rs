use clap::{Parser, Subcommand};

pub mod commands;
pub mod sendmail;

#[derive(Parser, Debug)]
#[command(name = "email-relay")]
#[command(about = "Durable outbound mail queue drained in batches over SMTP", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the queue table if it does not exist
    Migrate,
    /// Queue the message on stdin; accepts sendmail arguments (-f, -t, -i, recipients)
    #[command(disable_help_flag = true)]
    Enqueue {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        args: Vec<String>,
    },
    /// Claim and deliver one batch of pending messages
    SendBatch,
    /// Delete sent and failed messages past their retention horizon
    Prune,
    /// Keep delivering batches on an interval until interrupted
    Run {
        /// Seconds between dispatch passes
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Run a prune sweep after this many passes
        #[arg(long, default_value_t = 60)]
        prune_every: u32,
    },
    /// Print message counts per status as JSON
    Stats,
}

impl Cli {
    /// Parses the process arguments. When the binary is installed under a
    /// name ending in `sendmail`, every argument belongs to `enqueue`.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let program = args.next().unwrap_or_default();
        let rest: Vec<String> = args.collect();

        if invoked_as_sendmail(&program) {
            return Cli {
                command: Command::Enqueue { args: rest },
            };
        }
        Cli::parse_from(std::iter::once(program).chain(rest))
    }
}

fn invoked_as_sendmail(program: &str) -> bool {
    std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with("sendmail"))
}
