//! llamaserve - local LLM serving
//!
//! Lists the models found in the configured directory. Given a model name and
//! a prompt, streams a completion to stdout.

use std::io::Write;
use std::sync::Arc;

use futures::StreamExt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamaserve::config::load_settings;
use llamaserve::inference::StreamEvent;
use llamaserve::runtime::default_runtime;
use llamaserve::service::CompletionRequest;
use llamaserve::{CancelSignal, Service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("llamaserve=info".parse()?))
        .init();

    info!("Starting llamaserve v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    let runtime = default_runtime()?;
    info!(runtime = runtime.name(), models = %settings.models_directory.display(), "Runtime ready");
    let service = Arc::new(Service::from_settings(runtime, settings));

    for model in service.list_models()? {
        let state = if model.loaded { "loaded" } else { "available" };
        println!("{:<40} {:>12} bytes  {}", model.name, model.size_bytes, state);
    }

    let mut args = std::env::args().skip(1);
    let (Some(model), Some(prompt)) = (args.next(), args.next()) else {
        return Ok(());
    };

    let request = CompletionRequest {
        model,
        prompt,
        ..CompletionRequest::default()
    };
    let cancel = CancelSignal::new();
    let mut stream = service.complete_stream(request, cancel.clone());
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(StreamEvent::Chunk(chunk)) => {
                    write!(stdout, "{}", chunk.text)?;
                    stdout.flush()?;
                }
                Some(StreamEvent::Done(response)) => {
                    writeln!(stdout)?;
                    let usage = &response.usage;
                    info!(
                        finish_reason = %response.choices.first().map(|c| c.finish_reason.as_str()).unwrap_or("none"),
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        tokens_per_second = usage.tokens_per_second,
                        "Completion finished"
                    );
                    break;
                }
                Some(StreamEvent::Error(e)) => anyhow::bail!(e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling generation");
                cancel.cancel();
            }
        }
    }

    service.cache().close();
    Ok(())
}
