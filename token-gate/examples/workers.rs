//! Ten workers share one limiter and each hold a token while they "work".
//!
//! Run with `RUST_LOG=token_gate=debug` to watch grants and releases.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use token_gate::Config;
use token_gate::GateError;
use token_gate::Manager;
use token_gate::RateLimiter;

const WORKERS: usize = 10;

async fn do_work(limiter: Arc<dyn RateLimiter>, id: usize, began: Instant) -> Result<(), GateError> {
    let token = limiter.acquire().await?;
    println!("[{:>6.2?}] worker {id} acquired {token}", began.elapsed());

    let millis = rand::rng().random_range(0..500);
    sleep(Duration::from_millis(millis)).await;

    println!("[{:>6.2?}] worker {id} done after {millis}ms", began.elapsed());
    limiter.release(token);
    Ok(())
}

async fn run(name: &str, limiter: Arc<dyn RateLimiter>) -> Result<(), GateError> {
    println!("--- {name} ---");
    let began = Instant::now();

    let mut handles = Vec::with_capacity(WORKERS);
    for id in 0..WORKERS {
        handles.push(tokio::spawn(do_work(limiter.clone(), id, began)));
    }
    for handle in handles {
        handle.await.expect("worker panicked")?;
    }

    println!("{name} finished in {:.2?}\n", began.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GateError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::default()
        .with_limit(3)
        .with_throttle(Duration::from_millis(100))
        .with_fixed_interval(Duration::from_secs(1));

    run("max concurrency (3)", Arc::new(Manager::max_concurrency(&config)?)).await?;
    run("throttle (100ms)", Arc::new(Manager::throttle(&config)?)).await?;
    run("fixed window (3 per second)", Arc::new(Manager::fixed_window(&config)?)).await?;

    Ok(())
}
