//! Command dispatch logic for barpool

use super::{DemoArgs, InitArgs, demo_tasks, init_config, run_demo};
use crate::worker::{SLOT_ENV, serve, slot_from_env};
use crate::{Host, Result};
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand};
use ohno::app_err;

const CLAP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "barpool", version, author, long_about = None)]
#[command(about = "Run tasks across worker processes with unified progress bars and logging")]
#[command(styles = CLAP_STYLES)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tasks with nested progress bars across a pool of workers
    Demo(Box<DemoArgs>),
    /// Generate a default configuration file
    Init(InitArgs),
    /// Serve jobs from a coordinating pool
    #[command(hide = true)]
    Worker,
}

/// Dispatch command-line arguments to the appropriate handler
///
/// # Arguments
///
/// * `args` - An iterator of command-line arguments (typically from `std::env::args()`)
///
/// # Errors
///
/// Returns an error if command parsing fails or if the executed command fails
pub async fn run<I, T, H>(host: &mut H, args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
    H: Host,
{
    match Cli::parse_from(args).command {
        Command::Demo(demo_args) => run_demo(host, &demo_args).await,
        Command::Init(init_args) => init_config(host, &init_args),
        Command::Worker => {
            let slot = slot_from_env().ok_or_else(|| app_err!("the worker command is started by a pool ({SLOT_ENV} is not set)"))?;
            serve(slot, &demo_tasks())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call GetTempPathW")]
    async fn init_writes_the_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pool.toml");
        let path = path.to_str().unwrap();

        let mut host = TestHost::default();
        run(&mut host, ["barpool", "init", path]).await.unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, crate::config::DEFAULT_CONFIG_TOML);
        assert!(String::from_utf8(host.output_buf).unwrap().contains(path));
    }

    #[tokio::test]
    async fn worker_without_a_slot_is_an_error() {
        assert!(std::env::var_os(SLOT_ENV).is_none());
        let mut host = TestHost::default();
        assert!(run(&mut host, ["barpool", "worker"]).await.is_err());
    }

    #[tokio::test]
    async fn zero_fail_every_is_rejected() {
        let mut host = TestHost::default();
        let result = run(&mut host, ["barpool", "demo", "--fail-every", "0", "--log-level", "none"]).await;
        assert!(result.is_err());
    }
}
