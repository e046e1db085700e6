//! Remote copy worker.
//!
//! Spawned on the database (or standby) host by the controller and
//! driven over stdin/stdout with the line protocol. All job context
//! arrives with each request; the command line only carries the
//! options synthesized by `BackupOptions::to_argv`.

use std::io::{stdin, stdout};

use anyhow::Error;

fn main() -> Result<(), Error> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let stdin = stdin();
    let stdout = stdout();
    pgbackup::protocol::serve(stdin.lock(), stdout.lock())
}
