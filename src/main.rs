//! Replay fragment scripts through a reassembly table.
//!
//! Prints one line per completed message and, on request, its fragment tree.
//! Exits non-zero when the script cannot be loaded, a fatal error aborts the
//! replay, or a later pass disagrees with the first.

mod cli;

use std::{num::NonZeroUsize, process::ExitCode};

use clap::Parser;
use cli::{Cli, Command};
use reassembly::{
    KeyScheme,
    ReassemblyConfig,
    script::{self, ReplayReport, Script},
    tree::{TreeLabels, render, show_fragment_tree},
};

fn main() -> ExitCode {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let Command::Replay {
        script: path,
        passes,
        tree,
        strict_tails,
        ignore_ports,
        max_message_size,
    } = Cli::parse().command;

    let script = match Script::load(&path) {
        Ok(script) => script,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to load script");
            return ExitCode::FAILURE;
        }
    };
    let config = ReassemblyConfig::default()
        .tolerate_multiple_tails(!strict_tails)
        .key_scheme(if ignore_ports {
            KeyScheme::Addresses
        } else {
            KeyScheme::AddressesPorts
        })
        .max_message_size(max_message_size.and_then(NonZeroUsize::new));

    match script::replay(&script, config, passes.max(1)) {
        Ok(report) => {
            print_report(&report, tree);
            if report.is_consistent() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "replay aborted");
            ExitCode::FAILURE
        }
    }
}

fn print_report(report: &ReplayReport, tree: bool) {
    let Some(first) = report.passes.first() else {
        return;
    };
    for completion in &first.completions {
        let message = &completion.message;
        if message.reassembled_in() != completion.frame {
            continue;
        }
        println!(
            "line {}: {} id {} reassembled in frame {}: {} bytes {}",
            completion.line,
            completion.flow,
            completion.id,
            message.reassembled_in(),
            message.payload().len(),
            script::preview(message.payload(), 32),
        );
        if tree {
            print!("{}", render(&show_fragment_tree(message, &TreeLabels::new("script"))));
        }
    }
    for rejection in &first.rejections {
        println!("line {}: rejected: {}", rejection.line, rejection.error);
    }
    for pass in report.divergent_passes() {
        println!("pass {pass} diverged from pass 1");
    }
}
