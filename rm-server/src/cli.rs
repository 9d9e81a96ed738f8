//! The launcher's CLI surface (§6 CLI surface), grounded on
//! `bin/chainofcommand`/`bin/microboss`'s `clap`-driven host binaries,
//! ported from their builder-style `App`/`Arg` calls to `clap`'s derive
//! macros per the workspace's chosen `clap` feature set.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "rm-server", version, about = "Capability resource manager")]
pub struct Cli {
    /// Output driver and options, `DRV[,options]`.
    #[arg(short = 'o', long = "output", value_name = "DRV[,options]")]
    pub output: Option<String>,

    /// Debug log level.
    #[arg(short = 'D', long = "debug", value_name = "LEVEL")]
    pub debug: Option<String>,

    /// Halt the machine on clean shutdown instead of returning.
    #[arg(short = 'h', long = "halt", conflicts_with = "reboot")]
    pub halt: bool,

    /// Reboot the machine on clean shutdown instead of returning.
    #[arg(short = 'r', long = "reboot", conflicts_with = "halt")]
    pub reboot: bool,
}

impl Cli {
    /// The `log`/`env_logger` filter this invocation asked for, falling
    /// back to `env_logger`'s own `RUST_LOG`-driven default.
    pub fn log_filter(&self) -> Option<&str> {
        self.debug.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_and_reboot_are_mutually_exclusive() {
        let err = Cli::try_parse_from(["rm-server", "--halt", "--reboot"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn output_and_debug_parse() {
        let cli = Cli::try_parse_from(["rm-server", "-o", "ahci,readonly", "-D", "debug"]).unwrap();
        assert_eq!(cli.output.as_deref(), Some("ahci,readonly"));
        assert_eq!(cli.log_filter(), Some("debug"));
    }
}
