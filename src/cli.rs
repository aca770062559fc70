// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "vaxel",
    version,
    about = "A programmable LLM gateway: Anthropic and OpenAI dialects in, one canonical pipeline out"
)]
pub struct Cli {
    /// Path to a YAML settings file (env vars still override it).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (RUST_LOG still wins when set).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway (the default when no subcommand is given).
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: std::net::SocketAddr,

        /// Admin bearer token; omitting it disables the admin surface.
        #[arg(long, env = "VAXEL_ADMIN_TOKEN")]
        admin_token: Option<String>,
    },

    /// Print the effective runtime settings (file + env applied) and exit.
    ShowSettings,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
