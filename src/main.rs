use std::time::Duration;

use clap::Parser;
use serde_json::json;

use rsocket_lunar::channel::producer;
use rsocket_lunar::{Completion, InboundHandler, Payload};

#[derive(Parser, Debug)]
#[command(name = "rsocket-lunar")]
#[command(about = "Subscribes to tasks over an RSocket channel and logs what the server sends")]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short = 'p', default_value_t = 9898)]
    port: u16,

    /// Task id to subscribe to, repeatable.
    #[arg(short = 't', required = true)]
    task_ids: Vec<String>,

    #[arg(long, default_value = "conf/log4rs.yaml")]
    log_config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    log4rs::init_file(&args.log_config, Default::default())?;

    let data = json!({ "taskIds": args.task_ids, "cmd": "SUBSCRIBE" });
    let metadata = json!({});
    log::info!("Subscribe: {}", json!({ "data": data, "metadata": metadata }));
    let subscribe = Payload::json(&data, &metadata)?;

    let connection = rsocket_lunar::connect(
        &args.host,
        args.port,
        Duration::from_secs(30),
        Duration::from_secs(24 * 60 * 60)
    ).await?;

    let flux = connection.request_channel(Payload::empty(), producer::once_then_pause(subscribe)).await?;
    let (handler, mut completion) = InboundHandler::new(|payload: &Payload| {
        log::info!("From server on channel: {}", String::from_utf8_lossy(payload.data()));
        Ok(())
    });
    flux.subscribe(handler)?;

    tokio::select! {
        completed = completion.wait() => match completed {
            Completion::Completed => log::info!("Completed from server on channel"),
            Completion::Errored(e) => log::error!("Error from server on channel: {}", e),
            Completion::Cancelled => log::info!("Channel cancelled")
        },
        reason = connection.wait_closed() => log::error!("Connection closed: {}", reason),
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            flux.cancel();
        }
    }

    let reason = connection.close().await;
    log::debug!("Closed: {}", reason);
    Ok(())
}
