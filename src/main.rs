// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dispatches power hints to kernel tunables.

use getopts::Options;
use hintd::manager::HintManager;
use log::error;
use log::info;

const DEFAULT_CONFIG_PATH: &str = "/etc/hintd/powerhint.json";

fn print_usage(message: &str, error: bool) {
    if error {
        eprintln!("{}", message)
    } else {
        println!("{}", message);
    }
}

fn app_usage(error: bool, options: &Options) {
    let brief = r#"Usage: hintd [options]
Load a power hint config and serve hint requests until killed. With
--check, parse and validate the config, then exit.
"#;

    print_usage(&options.usage(brief), error);
}

fn hintd_main() -> std::result::Result<(), ()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = Options::new();
    opts.optopt(
        "c",
        "config",
        "Path to the power hint config (default /etc/hintd/powerhint.json)",
        "PATH",
    );
    opts.optflag("k", "check", "Validate the config and exit");
    opts.optflag("h", "help", "Print this help text");
    opts.optflag("v", "verbose", "Print more logs");
    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            app_usage(true, &opts);
            return Err(());
        }
    };

    if matches.opt_present("h") {
        app_usage(false, &opts);
        return Ok(());
    }

    let verbosity = if matches.opt_present("v") { 9 } else { 2 };
    stderrlog::new()
        .module(module_path!())
        .verbosity(verbosity)
        .init()
        .unwrap();

    let config_path = matches
        .opt_str("c")
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if matches.opt_present("k") {
        return match HintManager::from_file(&config_path, false) {
            Ok(manager) => {
                info!(
                    "Config {} parsed successfully: {} hints",
                    config_path,
                    manager.get_hints().len()
                );
                Ok(())
            }
            Err(e) => {
                error!("Invalid config {}: {:#}", config_path, e);
                Err(())
            }
        };
    }

    let manager = match HintManager::from_file(&config_path, true) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to load config {}: {:#}", config_path, e);
            return Err(());
        }
    };
    if !manager.is_running() {
        error!("Failed to start the node scheduler");
        return Err(());
    }

    info!("hintd started with config {}", config_path);

    // The manager owns the scheduler thread; keep it alive until killed.
    loop {
        std::thread::park();
    }
}

fn main() {
    std::process::exit(if hintd_main().is_ok() { 0 } else { 1 });
}
