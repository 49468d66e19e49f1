use anyhow::Error;
use arm_image_builder::settings::Settings;
use arm_image_builder::ssh_client::SshCommunicator;
use arm_image_builder::{BuildResult, Builder};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Pause before every step until ENTER is pressed
    #[clap(long)]
    debug: bool,

    /// Validate the configuration and template, then exit
    #[clap(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    env_logger::init();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config.unwrap_or(PathBuf::from("config.yaml")))?;
    settings.validate()?;
    if args.debug {
        settings.debug = true;
    }

    let template = settings.load_template()?;
    if args.dry_run {
        info!(
            "Configuration is valid, template has {} top-level keys",
            template.as_object().map(|o| o.len()).unwrap_or_default()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let client = settings.get_client()?;
    let communicator = Arc::new(SshCommunicator {
        username: settings.ssh.username.clone(),
        private_key: settings.ssh.private_key.clone(),
        port: settings.ssh.port,
    });
    let builder = Builder::new(settings, client, communicator).with_template(template);

    let cancel = builder.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling build");
            cancel.cancel();
        }
    });

    let report = builder.run().await?;
    for w in &report.cleanup_warnings {
        warn!("Cleanup failed, manual removal may be needed: {}", w);
    }

    Ok(match report.result {
        BuildResult::Completed(artifact) => {
            info!("Build finished: {}", artifact);
            println!("{}", artifact.image_id);
            ExitCode::SUCCESS
        }
        BuildResult::Cancelled => {
            info!("Build was cancelled");
            ExitCode::from(130)
        }
        BuildResult::Failed(e) => {
            error!("Build failed: {}", e);
            ExitCode::FAILURE
        }
    })
}
