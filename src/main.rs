use std::process;

use git_gatewayd as gatewayd;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    gatewayd::logger::init().expect("Global logger hasn't already been set");

    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));

    match gatewayd::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments into gateway options.
fn parse_options() -> Result<gatewayd::Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut options = gatewayd::Options::new(".".into());

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                options.listen = parser.value()?.parse()?;
            }
            Long("root") | Short('r') => {
                options.root = parser.value()?.into();
            }
            Long("uri-marker") => {
                let marker: String = parser.value()?.parse()?;
                options.uri_marker = Some(marker);
            }
            Long("auto-create") => {
                options.auto_create = true;
            }
            Long("buffer-size") => {
                options.buffer_size = parser.value()?.parse()?;
            }
            Long("follow-symlinks") => {
                options.follow_symlinks = true;
            }
            Long("help") | Short('h') => {
                println!(
                    "usage: git-gatewayd [--listen <addr>] [--root <path>] [--uri-marker <name>] \
                     [--auto-create] [--buffer-size <bytes>] [--follow-symlinks]"
                );
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(options)
}
