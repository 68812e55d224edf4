// SPDX-License-Identifier: GPL-2.0-or-later

mod app;
mod cleanup;

use app::run;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("failed to run app: {e}");
        std::process::exit(1);
    }
}
