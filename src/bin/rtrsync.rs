//! Synchronising validated payloads from RTR caches.

use std::io;
use std::path::PathBuf;
use std::process;
use log::LevelFilter;
use structopt::StructOpt;
use rtrsync::error::Error;
use rtrsync::pool::{Outcome, Pool};


//------------ main ----------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = Args::from_args();

    let (own_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    env_logger::Builder::new()
        .filter(Some("rtrsync"), own_level)
        .filter(None, other_level)
        .init();

    let pool = Pool::new(args.dir);
    let res = match args.operation {
        Operation::Init(cmd) => cmd.run(&pool),
        Operation::Reset(cmd) => cmd.run(&pool).await,
        Operation::Refresh(cmd) => cmd.run(&pool).await,
        Operation::Print(cmd) => cmd.run(&pool),
    };
    if let Err(err) = res {
        eprintln!("{err}");
        process::exit(1)
    }
}


//------------ Args ----------------------------------------------------------

#[derive(StructOpt)]
#[structopt(
    name = "rtrsync",
    about = "Synchronises validated payloads from RTR caches."
)]
struct Args {
    /// The directory holding the client records.
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    dir: PathBuf,

    /// Show debug logs (additive for trace logs).
    #[structopt(short, parse(from_occurrences))]
    verbose: u8,

    #[structopt(subcommand)]
    operation: Operation,
}


//------------ Operation -----------------------------------------------------

#[derive(StructOpt)]
enum Operation {
    /// Creates a client record per cache server.
    #[structopt(name = "init")]
    Init(Init),

    /// Fetches the full data set from one cache.
    #[structopt(name = "reset")]
    Reset(Reset),

    /// Updates the data of one cache or of all of them.
    #[structopt(name = "refresh")]
    Refresh(Refresh),

    /// Prints the state of one cache or the merged state of all of them.
    #[structopt(name = "print")]
    Print(Print),
}


//------------ Init ----------------------------------------------------------

#[derive(StructOpt)]
struct Init {
    /// A cache server to create a record for. Can be repeated.
    #[structopt(long = "server")]
    servers: Vec<String>,

    /// The TCP port of the matching --server argument. Can be repeated.
    #[structopt(long = "port")]
    ports: Vec<u16>,

    /// The highest protocol version to accept.
    #[structopt(long, default_value = "2")]
    version: u8,
}

impl Init {
    fn run(self, pool: &Pool) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(args_error("at least one --server is required"))
        }
        if self.servers.len() != self.ports.len() {
            return Err(args_error(
                "each --server needs a matching --port"
            ))
        }
        if self.version > 2 {
            return Err(args_error("supported versions are 0, 1, and 2"))
        }
        let servers: Vec<_> = self.servers.into_iter()
            .zip(self.ports)
            .collect();
        pool.init(&servers, self.version)?;
        println!("created {} client records", servers.len());
        Ok(())
    }
}


//------------ Reset ---------------------------------------------------------

#[derive(StructOpt)]
struct Reset {
    /// The ID of the client record to reset.
    #[structopt(long)]
    client_id: usize,

    /// Run even if the timer gates say otherwise.
    #[structopt(long)]
    force: bool,
}

impl Reset {
    async fn run(self, pool: &Pool) -> Result<(), Error> {
        match pool.reset(self.client_id, self.force).await? {
            Outcome::Updated => println!("client {}: reset", self.client_id),
            Outcome::Skipped => {
                println!("client {}: not due yet", self.client_id)
            }
        }
        Ok(())
    }
}


//------------ Refresh -------------------------------------------------------

#[derive(StructOpt)]
struct Refresh {
    /// The ID of the client record to refresh. All records if omitted.
    #[structopt(long)]
    client_id: Option<usize>,

    /// Run even if the timer gates say otherwise.
    #[structopt(long)]
    force: bool,
}

impl Refresh {
    async fn run(self, pool: &Pool) -> Result<(), Error> {
        match self.client_id {
            Some(id) => {
                match pool.refresh(id, self.force).await? {
                    Outcome::Updated => println!("client {id}: refreshed"),
                    Outcome::Skipped => println!("client {id}: not due yet"),
                }
                Ok(())
            }
            None => {
                let mut failed = 0;
                for (id, res) in pool.refresh_all(self.force).await? {
                    match res {
                        Ok(Outcome::Updated) => {
                            println!("client {id}: refreshed")
                        }
                        Ok(Outcome::Skipped) => {
                            println!("client {id}: not due yet")
                        }
                        Err(err) => {
                            eprintln!("client {id}: {err}");
                            failed += 1;
                        }
                    }
                }
                if failed > 0 {
                    Err(args_error("some caches failed to refresh"))
                }
                else {
                    Ok(())
                }
            }
        }
    }
}


//------------ Print ---------------------------------------------------------

#[derive(StructOpt)]
struct Print {
    /// The ID of the client record to print. Merged state if omitted.
    #[structopt(long)]
    client_id: Option<usize>,
}

impl Print {
    fn run(self, pool: &Pool) -> Result<(), Error> {
        let state = match self.client_id {
            Some(id) => {
                match pool.load(id)?.state() {
                    Some(state) => state.clone(),
                    None => {
                        return Err(args_error(
                            "no data stored for this client"
                        ))
                    }
                }
            }
            None => pool.merged_state()?,
        };
        let json = serde_json::to_string_pretty(&state).map_err(|err| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        println!("{json}");
        Ok(())
    }
}


//------------ Helpers -------------------------------------------------------

fn args_error(reason: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, reason))
}
