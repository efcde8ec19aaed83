use docker_image_copier::cli::{Args, Runner};
use docker_image_copier::logging::Logger;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Args::parse_args()
        .from_env()
        .and_then(|args| args.into_config())
    {
        Ok(config) => config,
        Err(e) => {
            Logger::default().error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let runner = Runner::new(config);
    match runner.run(&cancel).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            runner.logger().error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
