use std::error::Error;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use strand_core::{Deferred, Module, ModuleRegistry, Next, Promise, Runtime, RuntimeConfig, module_fn};
use tokio::time::{Duration, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ROUNDS: u32 = 10;
const FAN_OUT: usize = 8;
const DEMO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct EchoReply {
    i: usize,
    seen: u32,
}

/// Answers every PING with a PONG to whoever sent it.
fn pong() -> Arc<dyn Module> {
    module_fn("pong", |scope| {
        scope.set_onmessage(|scope, event| {
            if event.data == json!("PING")
                && let Some(sender) = event.source.and_then(|s| s.upgrade())
            {
                sender.post_message(json!("PONG"));
            } else if event.data == json!("THROW") {
                return Err(json!(format!("{} was told to throw", scope.id())));
            }
            Ok(())
        });
        scope.set_onerror(|scope, event| {
            warn!(worker_id = %scope.id(), error = %event.data, "pong caught its own error");
            Ok(())
        });
        Ok(())
    })
}

/// Plays `ROUNDS` rounds against its own pong worker, then resolves `done`.
fn ping(done: Deferred<u32>) -> Arc<dyn Module> {
    module_fn("ping", move |scope| {
        let partner = scope.spawn("pong").map_err(|e| json!(e.to_string()))?;
        partner.post_message(json!("PING"));

        let done = done.clone();
        let mut rounds = 0;
        scope.set_onmessage(move |scope, event| {
            if event.data != json!("PONG") {
                return Ok(());
            }
            rounds += 1;
            info!(worker_id = %scope.id(), rounds, "ping got PONG");
            if rounds < ROUNDS {
                partner.post_message(json!("PING"));
            } else {
                partner.post_message(json!("THROW"));
                done.resolve(rounds);
            }
            Ok(())
        });
        Ok(())
    })
}

/// Replies with the index it was sent and how many messages this instance has seen.
fn echo() -> Arc<dyn Module> {
    module_fn("echo", |scope| {
        let mut seen = 0;
        scope.set_onmessage(move |_, event| {
            seen += 1;
            if let Some(sender) = event.source.and_then(|s| s.upgrade()) {
                sender.post_message(json!({ "i": event.data, "seen": seen }));
            }
            Ok(())
        });
        Ok(())
    })
}

/// Spawns `FAN_OUT` echo workers and resolves `done` with their replies.
fn gather(done: Deferred<Vec<Value>>) -> Arc<dyn Module> {
    module_fn("gather", move |scope| {
        for i in 0..FAN_OUT {
            scope
                .spawn("echo")
                .map_err(|e| json!(e.to_string()))?
                .post_message(json!(i));
        }

        let done = done.clone();
        let mut replies = Vec::with_capacity(FAN_OUT);
        scope.set_onmessage(move |_, event| {
            replies.push(event.data);
            if replies.len() == FAN_OUT {
                done.resolve(std::mem::take(&mut replies));
            }
            Ok(())
        });
        Ok(())
    })
}

fn load_config() -> Result<RuntimeConfig, Box<dyn Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading runtime config");
            Ok(RuntimeConfig::from_json_file(path)?)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;

    let pinged = Deferred::new();
    let gathered = Deferred::new();
    let registry = ModuleRegistry::new()
        .with(pong())?
        .with(ping(pinged.clone()))?
        .with(echo())?
        .with(gather(gathered.clone()))?;
    let runtime = Runtime::with_config(Arc::new(registry), config)?;
    info!(modules = ?runtime.registry().names(), "runtime ready");

    // (A) ping-pong, ending with an error that pong keeps to itself
    let _ping = runtime.spawn("ping")?;
    let rounds = timeout(DEMO_TIMEOUT, pinged.promise()).await?;
    info!(rounds = ?rounds, "ping-pong finished");

    // (B) fan-out: every echo instance has its own counter
    let _gather = runtime.spawn("gather")?;
    let replies = timeout(DEMO_TIMEOUT, gathered.promise())
        .await?
        .map_err(|reason| format!("gather rejected: {reason}"))?;
    for reply in replies {
        let reply: EchoReply = serde_json::from_value(reply)?;
        info!(i = reply.i, seen = reply.seen, "echo replied");
    }

    // (C) chained promise awaited from async code
    let doubled = Promise::resolved(21)
        .then(|v: i32| Ok(Next::Value(v * 2)))
        .await;
    info!(value = ?doubled, "promise chain settled");

    info!(counts = ?runtime.counts(), "shutting down");
    let shutdown = runtime.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown_and_join()).await?;
    Ok(())
}
