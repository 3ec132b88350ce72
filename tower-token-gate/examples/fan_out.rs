use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::sleep;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;

use token_gate::Config;
use token_gate::Manager;
use tower_token_gate::GateError;
use tower_token_gate::TokenGateLayer;

#[tokio::main]
async fn main() {
    // 1. At most 2 queries may be in flight against the backends at once
    let limiter = Manager::max_concurrency(&Config::default().with_limit(2))
        .expect("limit is non-zero");

    // 2. Give each query up to 250ms to get a token
    let layer = TokenGateLayer::new(Arc::new(limiter)).with_timeout(Duration::from_millis(250));

    // 3. A pretend backend query that takes 100ms
    let query = tower::service_fn(|backend: String| async move {
        sleep(Duration::from_millis(100)).await;
        Ok::<_, tower::BoxError>(format!("{backend}: ok"))
    });

    let gated = layer.layer(query);
    let backends = [
        "http://prometheus-a:9090",
        "http://prometheus-b:9090",
        "http://prometheus-c:9090",
        "http://prometheus-d:9090",
        "http://prometheus-e:9090",
        "http://prometheus-f:9090",
        "http://prometheus-g:9090",
        "http://prometheus-h:9090",
    ];

    println!("Querying {} backends, 2 at a time, 250ms admission budget\n", backends.len());
    let began = Instant::now();

    // 4. Fan the query out to every backend at once
    let mut tasks = Vec::new();
    for backend in backends {
        let mut svc = gated.clone();
        tasks.push(tokio::spawn(async move {
            match svc.ready().await {
                Ok(ready_svc) => match ready_svc.call(backend.to_string()).await {
                    Ok(resp) => println!("[{:>6.2?}] {resp}", began.elapsed()),
                    Err(e) => println!("[{:>6.2?}] {backend}: query failed: {e}", began.elapsed()),
                },
                Err(e) => match e.downcast_ref::<GateError>() {
                    Some(GateError::Timeout) => {
                        println!("[{:>6.2?}] {backend}: gave up waiting for a token", began.elapsed())
                    }
                    _ => println!("[{:>6.2?}] {backend}: limiter unavailable: {e}", began.elapsed()),
                },
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    println!("\nDone in {:.2?}", began.elapsed());
}
