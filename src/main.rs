use std::process::exit;

use aix::cli::{self, Outcome, AIX};

#[tokio::main]
async fn main() {
    match cli::run(&AIX).await {
        Ok(Outcome::Finished) => {}
        // don't wait on a stdin read that may still be blocked
        Ok(Outcome::Interrupted) => exit(0),
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            exit(1);
        }
    }
}
